//! Ahead-of-time compilation of scripts to serialized compiled units.
//!
//! Compilation never touches the live engine: every call builds a disposable
//! runtime/context pair, compiles there, and tears it down before returning.
//! Imports of native modules resolve to placeholder definitions that export
//! the declared names, so a script compiles without the real bindings being
//! present; file-backed imports are read and compiled too (declaration only),
//! which validates the whole import graph up front.

use std::collections::BTreeMap;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::path::PathBuf;

use crate::engine::resolve_script_path;
use crate::ffi::{self, Context, ModuleDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// Source text failed to parse.
    Parse,
    /// An imported module could not be resolved.
    Resolve,
    /// The compiled unit could not be serialized.
    Serialize,
    /// Disposable runtime construction failed, or the engine was torn down.
    Internal,
}

#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CompileError {}

/// A snapshot of the engine's native export surface plus resolution options.
/// Plain data: cloneable and sendable, so compilation can run anywhere.
#[derive(Debug, Clone)]
pub struct ScriptCompiler {
    native_exports: BTreeMap<String, Vec<String>>,
    script_extension: String,
    module_roots: Vec<PathBuf>,
}

impl ScriptCompiler {
    pub(crate) fn new(
        native_exports: BTreeMap<String, Vec<String>>,
        script_extension: String,
        module_roots: Vec<PathBuf>,
    ) -> Self {
        Self {
            native_exports,
            script_extension,
            module_roots,
        }
    }

    /// Compile `source` (logical filename `name`) to a serialized compiled
    /// unit without executing it.
    pub fn compile(&self, source: &str, name: &str) -> Result<Vec<u8>, CompileError> {
        let mut state = StubState {
            native_exports: self.native_exports.clone(),
            script_extension: self.script_extension.clone(),
            module_roots: self.module_roots.clone(),
            defs: BTreeMap::new(),
            cache: BTreeMap::new(),
            missing: None,
        };
        unsafe { compile_with_state(&mut state, source, name) }
    }
}

/// Loader state for one compile call, reached from the C callbacks through
/// the disposable runtime's opaque slot.
struct StubState {
    native_exports: BTreeMap<String, Vec<String>>,
    script_extension: String,
    module_roots: Vec<PathBuf>,
    /// Placeholder definition -> its declared export names.
    defs: BTreeMap<usize, Vec<String>>,
    /// Script path -> compiled module handle within this disposable runtime.
    cache: BTreeMap<String, usize>,
    /// Set when resolution (rather than parsing) failed.
    missing: Option<String>,
}

unsafe fn compile_with_state(
    state: *mut StubState,
    source: &str,
    name: &str,
) -> Result<Vec<u8>, CompileError> {
    let rt = ffi::new_runtime();
    if rt.is_null() {
        return Err(CompileError::new(
            CompileErrorKind::Internal,
            "runtime allocation failed",
        ));
    }
    let ctx = ffi::new_context(rt);
    if ctx.is_null() {
        ffi::free_runtime(rt);
        return Err(CompileError::new(
            CompileErrorKind::Internal,
            "context allocation failed",
        ));
    }
    ffi::set_runtime_opaque(rt, state as *mut c_void);
    ffi::set_module_loader(rt, stub_module_loader, state as *mut c_void);

    let result = compile_in_context(state, ctx, source, name);

    // The disposable pair is torn down on every path, success or not.
    ffi::set_runtime_opaque(rt, std::ptr::null_mut());
    ffi::free_context(ctx);
    ffi::free_runtime(rt);
    result
}

unsafe fn compile_in_context(
    state: *mut StubState,
    ctx: *mut Context,
    source: &str,
    name: &str,
) -> Result<Vec<u8>, CompileError> {
    let unit = ffi::eval(
        ctx,
        source,
        name,
        ffi::EVAL_MODULE | ffi::EVAL_COMPILE_ONLY,
    );
    if ffi::is_exception(unit) {
        let fault = ffi::take_exception(ctx);
        let kind = if (*state).missing.is_some() {
            CompileErrorKind::Resolve
        } else {
            CompileErrorKind::Parse
        };
        return Err(CompileError::new(kind, fault.message));
    }

    let bytes = ffi::write_compiled_unit(ctx, unit);
    ffi::free_value(ctx, unit);
    match bytes {
        Some(bytes) => Ok(bytes),
        None => {
            let fault = ffi::take_exception(ctx);
            Err(CompileError::new(
                CompileErrorKind::Serialize,
                format!("compiled unit serialization failed: {}", fault.message),
            ))
        }
    }
}

unsafe extern "C" fn stub_module_loader(
    ctx: *mut Context,
    name_c: *const c_char,
    opaque: *mut c_void,
) -> *mut ModuleDef {
    let state = opaque as *mut StubState;
    if state.is_null() {
        ffi::throw_reference_error(ctx, "module loader unavailable");
        return std::ptr::null_mut();
    }
    let name = CStr::from_ptr(name_c).to_string_lossy().into_owned();

    if let Some(exports) = (*state).native_exports.get(&name) {
        let def = ffi::new_c_module(ctx, &name, stub_module_init);
        if def.is_null() {
            return def;
        }
        for export in exports {
            ffi::add_module_export(ctx, def, export);
        }
        let exports = exports.clone();
        (*state).defs.insert(def as usize, exports);
        return def;
    }

    let path = match resolve_script_path(
        &(*state).script_extension,
        &(*state).module_roots,
        &name,
    ) {
        Some(path) => path,
        None => {
            (*state).missing = Some(name.clone());
            ffi::throw_reference_error(ctx, &format!("module not found: {name}"));
            return std::ptr::null_mut();
        }
    };
    let key = path.to_string_lossy().into_owned();
    if let Some(&cached) = (*state).cache.get(&key) {
        return cached as *mut ModuleDef;
    }

    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(e) => {
            (*state).missing = Some(name.clone());
            ffi::throw_reference_error(ctx, &format!("module not found: {name} ({e})"));
            return std::ptr::null_mut();
        }
    };
    let compiled = ffi::eval(
        ctx,
        &source,
        &key,
        ffi::EVAL_MODULE | ffi::EVAL_COMPILE_ONLY,
    );
    if ffi::is_exception(compiled) {
        return std::ptr::null_mut();
    }
    let def = ffi::module_def(compiled);
    ffi::free_value(ctx, compiled);
    (*state).cache.insert(key, def as usize);
    def
}

/// Placeholder init: bind every declared export to undefined. Only runs if
/// something instantiates the module inside the disposable runtime.
unsafe extern "C" fn stub_module_init(ctx: *mut Context, def: *mut ModuleDef) -> c_int {
    let rt = ffi::context_runtime(ctx);
    let state = ffi::runtime_opaque(rt) as *mut StubState;
    if state.is_null() {
        return -1;
    }
    let exports = match (*state).defs.get(&(def as usize)) {
        Some(exports) => exports.clone(),
        None => return -1,
    };
    for name in exports {
        ffi::set_module_export(ctx, def, &name, ffi::undefined());
    }
    0
}
