//! Engine lifecycle and script execution.
//!
//! One [`Engine`] owns one runtime and one execution context. The handle is
//! explicit: construct it once and thread it through the embedding instead of
//! reaching for process-global state. Script failures never unwind across the
//! boundary; they are captured and delivered to a replaceable error sink
//! (stderr by default), and every public operation fails fast once the engine
//! has been torn down.

use std::collections::BTreeMap;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::path::{Path, PathBuf};

use crate::compile::{CompileError, CompileErrorKind, ScriptCompiler};
use crate::error::{EngineError, EngineErrorKind};
use crate::ffi::{self, Context, ModuleDef, ScriptFault, Value};
use crate::marshal::ScriptType;
use crate::module::{FuncId, ModuleRef, ModuleTree, NodeId, ValueId};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Extension appended to import names that carry none.
    pub script_extension: String,
    /// Directories searched, in order, for file-backed modules.
    pub module_roots: Vec<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            script_extension: "js".to_string(),
            module_roots: vec![PathBuf::from(".")],
        }
    }
}

/// One argument of a host-initiated script call.
#[derive(Debug, Clone)]
pub enum CallArg {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl CallArg {
    /// Arguments take the same registry path into the runtime as registered
    /// constants and native return values.
    unsafe fn to_value(&self, ctx: *mut Context) -> Value {
        match self {
            CallArg::Int(v) => (*v).into_value(ctx),
            CallArg::Float(v) => (*v).into_value(ctx),
            CallArg::Bool(v) => (*v).into_value(ctx),
            CallArg::Text(v) => v.clone().into_value(ctx),
        }
    }
}

impl From<i32> for CallArg {
    fn from(v: i32) -> Self {
        CallArg::Int(v as i64)
    }
}

impl From<i64> for CallArg {
    fn from(v: i64) -> Self {
        CallArg::Int(v)
    }
}

impl From<f64> for CallArg {
    fn from(v: f64) -> Self {
        CallArg::Float(v)
    }
}

impl From<bool> for CallArg {
    fn from(v: bool) -> Self {
        CallArg::Bool(v)
    }
}

impl From<&str> for CallArg {
    fn from(v: &str) -> Self {
        CallArg::Text(v.to_string())
    }
}

impl From<String> for CallArg {
    fn from(v: String) -> Self {
        CallArg::Text(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Uninitialized,
    Initialized,
    CleanedUp,
}

type ErrorSink = Box<dyn FnMut(&str)>;

struct EngineInner {
    state: LifecycleState,
    /// Global namespace populated at most once, on first evaluation.
    installed: bool,
    rt: *mut ffi::Runtime,
    ctx: *mut Context,
    tree: ModuleTree,
    /// Module-definition handle back to the originating tree node; the
    /// runtime's init callback only hands us the handle.
    mod_defs: BTreeMap<usize, NodeId>,
    /// Script path -> compiled module handle, so a file imported from several
    /// places is compiled once.
    script_modules: BTreeMap<String, usize>,
    sink: ErrorSink,
    options: EngineOptions,
}

pub struct Engine {
    inner: Box<EngineInner>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        Self {
            inner: Box::new(EngineInner {
                state: LifecycleState::Uninitialized,
                installed: false,
                rt: std::ptr::null_mut(),
                ctx: std::ptr::null_mut(),
                tree: ModuleTree::new(),
                mod_defs: BTreeMap::new(),
                script_modules: BTreeMap::new(),
                sink: Box::new(|message| eprintln!("{message}")),
                options,
            }),
        }
    }

    /// Construct the runtime and context. Idempotent; fails only after
    /// [`Engine::cleanup`].
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        let inner = &mut *self.inner;
        match inner.state {
            LifecycleState::CleanedUp => {
                Err(EngineError::lifecycle("engine already cleaned up"))
            }
            LifecycleState::Initialized => Ok(()),
            LifecycleState::Uninitialized => {
                unsafe {
                    let rt = ffi::new_runtime();
                    if rt.is_null() {
                        return Err(EngineError::new(
                            EngineErrorKind::Internal,
                            "runtime allocation failed",
                        ));
                    }
                    let ctx = ffi::new_context(rt);
                    if ctx.is_null() {
                        ffi::free_runtime(rt);
                        return Err(EngineError::new(
                            EngineErrorKind::Internal,
                            "context allocation failed",
                        ));
                    }
                    inner.rt = rt;
                    inner.ctx = ctx;
                    let opaque: *mut EngineInner = inner;
                    ffi::set_runtime_opaque(rt, opaque as *mut c_void);
                    ffi::set_module_loader(rt, engine_module_loader, opaque as *mut c_void);
                }
                inner.state = LifecycleState::Initialized;
                Ok(())
            }
        }
    }

    /// Replace the destination for captured script errors.
    pub fn set_error_sink(&mut self, sink: impl FnMut(&str) + 'static) {
        self.inner.sink = Box::new(sink);
    }

    /// Root of the registration API. Only available until the first script
    /// evaluation freezes the tree.
    pub fn globals_mut(&mut self) -> Result<ModuleRef<'_>, EngineError> {
        let inner = &mut *self.inner;
        if inner.state == LifecycleState::CleanedUp {
            return Err(EngineError::lifecycle("engine already cleaned up"));
        }
        if inner.installed {
            return Err(EngineError::lifecycle(
                "registration must complete before the first script runs",
            ));
        }
        Ok(ModuleRef::new(&mut inner.tree, ModuleTree::ROOT))
    }

    /// Evaluate source text as a module.
    pub fn run_module(&mut self, name: &str, source: &str) -> Result<(), EngineError> {
        self.ensure_ready()?;
        let inner: *mut EngineInner = &mut *self.inner;
        unsafe { eval_source(inner, name, source, ffi::EVAL_MODULE) }
    }

    /// Evaluate source text as a classic script in the global scope.
    pub fn run_script(&mut self, name: &str, source: &str) -> Result<(), EngineError> {
        self.ensure_ready()?;
        let inner: *mut EngineInner = &mut *self.inner;
        unsafe { eval_source(inner, name, source, ffi::EVAL_GLOBAL) }
    }

    /// Read a file and evaluate it as a module.
    pub fn run_file(&mut self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        if self.inner.state == LifecycleState::CleanedUp {
            return Err(EngineError::lifecycle("engine already cleaned up"));
        }
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            EngineError::new(EngineErrorKind::Io, format!("read {}: {e}", path.display()))
        })?;
        let name = path.to_string_lossy().into_owned();
        self.run_module(&name, &source)
    }

    /// Call a global function by name with heterogeneous arguments. Returns
    /// `false` when the function is absent, not callable, or threw (the
    /// error itself goes to the sink); a frame dispatcher treats that as
    /// "skip this callback" rather than a fatal condition.
    pub fn call_global(&mut self, name: &str, args: &[CallArg]) -> bool {
        if self.inner.state != LifecycleState::Initialized {
            return false;
        }
        let inner: *mut EngineInner = &mut *self.inner;
        unsafe { do_call_global(inner, name, args) }
    }

    /// Execute a compiled unit produced by [`ScriptCompiler::compile`]
    /// against the live runtime. Module units get their dependency graph
    /// resolved, are evaluated, and have every export grafted onto the
    /// global object under its own name.
    pub fn run_bytecode(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        self.ensure_ready()?;
        let inner: *mut EngineInner = &mut *self.inner;
        unsafe { do_run_bytecode(inner, bytes) }
    }

    /// Snapshot the registered native-module surface for ahead-of-time
    /// compilation. The snapshot is plain data (`Clone + Send`), so
    /// compilation may run on another thread while the engine keeps working.
    pub fn compiler(&self) -> Result<ScriptCompiler, EngineError> {
        if self.inner.state == LifecycleState::CleanedUp {
            return Err(EngineError::lifecycle("engine already cleaned up"));
        }
        Ok(ScriptCompiler::new(
            self.inner.tree.export_surface(),
            self.inner.options.script_extension.clone(),
            self.inner.options.module_roots.clone(),
        ))
    }

    /// Compile source text to a serialized compiled unit without executing it
    /// and without touching the live runtime.
    pub fn compile(&self, source: &str, name: &str) -> Result<Vec<u8>, CompileError> {
        match self.compiler() {
            Ok(compiler) => compiler.compile(source, name),
            Err(e) => Err(CompileError::new(CompileErrorKind::Internal, e.message)),
        }
    }

    /// Tear down in fixed order: drop cached module handles, collect
    /// garbage, free the context, free the runtime, reset the tree.
    /// Idempotent, and terminal: no operation re-initializes afterwards.
    pub fn cleanup(&mut self) {
        let inner = &mut *self.inner;
        if inner.state == LifecycleState::CleanedUp {
            return;
        }
        if inner.state == LifecycleState::Initialized {
            inner.script_modules.clear();
            inner.mod_defs.clear();
            unsafe {
                ffi::run_gc(inner.rt);
                ffi::set_runtime_opaque(inner.rt, std::ptr::null_mut());
                ffi::free_context(inner.ctx);
                ffi::free_runtime(inner.rt);
            }
            inner.ctx = std::ptr::null_mut();
            inner.rt = std::ptr::null_mut();
        }
        inner.tree = ModuleTree::new();
        inner.installed = false;
        inner.state = LifecycleState::CleanedUp;
    }

    fn ensure_ready(&mut self) -> Result<(), EngineError> {
        match self.inner.state {
            LifecycleState::CleanedUp => {
                Err(EngineError::lifecycle("engine already cleaned up"))
            }
            LifecycleState::Uninitialized => self.initialize(),
            LifecycleState::Initialized => Ok(()),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cleanup();
    }
}

pub(crate) fn resolve_script_path(
    extension: &str,
    roots: &[PathBuf],
    name: &str,
) -> Option<PathBuf> {
    let mut file = PathBuf::from(name);
    if file.extension().is_none() {
        file.set_extension(extension);
    }
    for root in roots {
        let candidate = root.join(&file);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

// -------------------------
// Internals past the C boundary
// -------------------------
//
// Callbacks re-enter the engine through the runtime opaque pointer while a
// public method is still on the stack, so everything below works on
// `*mut EngineInner` and takes only short-lived reborrows.

fn script_error(fault: &ScriptFault) -> EngineError {
    EngineError::new(
        EngineErrorKind::Script,
        format!("script failed: {}", fault.message),
    )
}

unsafe fn report(inner: *mut EngineInner, fault: &ScriptFault) {
    let text = fault.render();
    ((*inner).sink)(&text);
}

/// Graft the module tree onto the global object. Runs once, at the first
/// evaluation.
unsafe fn ensure_installed(inner: *mut EngineInner) {
    if (*inner).installed {
        return;
    }
    (*inner).installed = true;
    let ctx = (*inner).ctx;
    let global = ffi::global_object(ctx);
    install_node(inner, ctx, global, ModuleTree::ROOT);
    ffi::free_value(ctx, global);
}

/// Write a node's functions, values, and (recursively, as plain objects)
/// child modules onto `target`.
unsafe fn install_node(inner: *mut EngineInner, ctx: *mut Context, target: Value, node: NodeId) {
    let funcs: Vec<(String, FuncId)> = (*inner)
        .tree
        .funcs_of(node)
        .map(|(n, id)| (n.to_string(), id))
        .collect();
    for (name, id) in funcs {
        let func = create_function(inner, ctx, id);
        ffi::set_property(ctx, target, &name, func);
    }

    let values: Vec<(String, ValueId)> = (*inner)
        .tree
        .values_of(node)
        .map(|(n, id)| (n.to_string(), id))
        .collect();
    for (name, id) in values {
        if let Some(producer) = (*inner).tree.producer(id) {
            let value = producer(ctx);
            ffi::set_property(ctx, target, &name, value);
        }
    }

    let children: Vec<(String, NodeId)> = (*inner)
        .tree
        .children_of(node)
        .map(|(n, id)| (n.to_string(), id))
        .collect();
    for (name, child) in children {
        let obj = ffi::new_object(ctx);
        install_node(inner, ctx, obj, child);
        ffi::set_property(ctx, target, &name, obj);
    }
}

/// Build a callable runtime value for an arena entry. The function value
/// carries only the arena index; the wrapper stays owned by the tree, which
/// outlives the runtime.
unsafe fn create_function(inner: *mut EngineInner, ctx: *mut Context, id: FuncId) -> Value {
    let arity = (*inner).tree.callable(id).map_or(0, |c| c.arity());
    let mut data = [ffi::new_int32(id.0 as i32)];
    ffi::new_function_data(ctx, call_trampoline, arity, &mut data)
}

unsafe extern "C" fn call_trampoline(
    ctx: *mut Context,
    _this: Value,
    argc: c_int,
    argv: *mut Value,
    _magic: c_int,
    func_data: *mut Value,
) -> Value {
    let rt = ffi::context_runtime(ctx);
    let inner = ffi::runtime_opaque(rt) as *mut EngineInner;
    if inner.is_null() {
        return ffi::throw_internal_error(ctx, "engine state unavailable");
    }
    let id = FuncId((*func_data).u.int32 as u32);
    let callable = match (*inner).tree.callable(id) {
        Some(c) => c as *const dyn crate::callable::NativeCallable,
        None => return ffi::throw_internal_error(ctx, "unknown native function"),
    };
    let args: &[Value] = if argc > 0 {
        std::slice::from_raw_parts(argv, argc as usize)
    } else {
        &[]
    };
    // Raw re-borrow: the callable may evaluate script that re-enters the
    // engine (e.g. through the module loader) before it returns.
    (*callable).call(ctx, args)
}

unsafe fn eval_source(
    inner: *mut EngineInner,
    name: &str,
    source: &str,
    flags: c_int,
) -> Result<(), EngineError> {
    ensure_installed(inner);
    let ctx = (*inner).ctx;
    let result = ffi::eval(ctx, source, name, flags);
    finish_eval(inner, result)
}

/// Common tail of every evaluation: capture the pending exception, drain
/// queued jobs, surface a rejected module promise, release the result.
unsafe fn finish_eval(inner: *mut EngineInner, result: Value) -> Result<(), EngineError> {
    let ctx = (*inner).ctx;
    if ffi::is_exception(result) {
        let fault = ffi::take_exception(ctx);
        report(inner, &fault);
        return Err(script_error(&fault));
    }
    let mut outcome = Ok(());
    if let Some(fault) = ffi::run_pending_jobs((*inner).rt) {
        report(inner, &fault);
        outcome = Err(script_error(&fault));
    }
    if let Some(fault) = ffi::rejected_promise_fault(ctx, result) {
        report(inner, &fault);
        outcome = Err(script_error(&fault));
    }
    ffi::free_value(ctx, result);
    outcome
}

unsafe fn do_call_global(inner: *mut EngineInner, name: &str, args: &[CallArg]) -> bool {
    let ctx = (*inner).ctx;
    let global = ffi::global_object(ctx);
    let func = ffi::get_property(ctx, global, name);
    if !ffi::is_callable(ctx, func) {
        ffi::free_value(ctx, func);
        ffi::free_value(ctx, global);
        return false;
    }

    let mut argv: Vec<Value> = args.iter().map(|a| a.to_value(ctx)).collect();
    let result = ffi::call(ctx, func, &mut argv);
    for v in argv {
        ffi::free_value(ctx, v);
    }
    ffi::free_value(ctx, func);
    ffi::free_value(ctx, global);

    let ok = if ffi::is_exception(result) {
        let fault = ffi::take_exception(ctx);
        report(inner, &fault);
        false
    } else {
        ffi::free_value(ctx, result);
        true
    };
    if let Some(fault) = ffi::run_pending_jobs((*inner).rt) {
        report(inner, &fault);
    }
    ok
}

unsafe fn do_run_bytecode(inner: *mut EngineInner, bytes: &[u8]) -> Result<(), EngineError> {
    ensure_installed(inner);
    let ctx = (*inner).ctx;
    let unit = ffi::read_compiled_unit(ctx, bytes);
    if ffi::is_exception(unit) {
        let fault = ffi::take_exception(ctx);
        report(inner, &fault);
        return Err(EngineError::new(
            EngineErrorKind::Module,
            format!("invalid compiled unit: {}", fault.message),
        ));
    }

    if ffi::is_module(unit) {
        // Keep the definition handle: the export walk below needs it after
        // evaluation consumed the value.
        let def = ffi::module_def(unit);
        if !ffi::resolve_module(ctx, unit) {
            let fault = ffi::take_exception(ctx);
            report(inner, &fault);
            ffi::free_value(ctx, unit);
            return Err(EngineError::new(
                EngineErrorKind::Module,
                format!("module resolution failed: {}", fault.message),
            ));
        }
        let result = ffi::eval_function(ctx, unit);
        finish_eval(inner, result)?;
        graft_module_exports(ctx, def);
        Ok(())
    } else {
        let result = ffi::eval_function(ctx, unit);
        finish_eval(inner, result)
    }
}

/// Copy every export of an evaluated module onto the global object, so hosts
/// reach them by plain name exactly as with source loading. The export list
/// is enumerated dynamically.
unsafe fn graft_module_exports(ctx: *mut Context, def: *mut ModuleDef) {
    let ns = ffi::module_namespace(ctx, def);
    if ffi::is_exception(ns) {
        let _ = ffi::take_exception(ctx);
        return;
    }
    let global = ffi::global_object(ctx);
    for name in ffi::own_property_names(ctx, ns) {
        let value = ffi::get_property(ctx, ns, &name);
        if ffi::is_exception(value) {
            let _ = ffi::take_exception(ctx);
            continue;
        }
        ffi::set_property(ctx, global, &name, value);
    }
    ffi::free_value(ctx, global);
    ffi::free_value(ctx, ns);
}

// -------------------------
// Module resolution hook
// -------------------------

unsafe extern "C" fn engine_module_loader(
    ctx: *mut Context,
    name_c: *const c_char,
    opaque: *mut c_void,
) -> *mut ModuleDef {
    let inner = opaque as *mut EngineInner;
    if inner.is_null() {
        ffi::throw_reference_error(ctx, "module loader unavailable");
        return std::ptr::null_mut();
    }
    let name = CStr::from_ptr(name_c).to_string_lossy().into_owned();

    // Native modules shadow same-named files.
    if let Some(node) = (*inner).tree.child(ModuleTree::ROOT, &name) {
        return instantiate_native_module(inner, ctx, &name, node);
    }
    load_script_module(inner, ctx, &name)
}

/// First phase of the native-module protocol: create the definition and
/// declare its export names. Values are bound later, in
/// [`native_module_init`], once the runtime links the module graph.
unsafe fn instantiate_native_module(
    inner: *mut EngineInner,
    ctx: *mut Context,
    name: &str,
    node: NodeId,
) -> *mut ModuleDef {
    let def = ffi::new_c_module(ctx, name, native_module_init);
    if def.is_null() {
        return def;
    }
    (*inner).mod_defs.insert(def as usize, node);
    for export in (*inner).tree.export_names(node) {
        ffi::add_module_export(ctx, def, &export);
    }
    def
}

/// Second phase: bind every declared export to its value.
unsafe extern "C" fn native_module_init(ctx: *mut Context, def: *mut ModuleDef) -> c_int {
    let rt = ffi::context_runtime(ctx);
    let inner = ffi::runtime_opaque(rt) as *mut EngineInner;
    if inner.is_null() {
        return -1;
    }
    let node = match (*inner).mod_defs.get(&(def as usize)) {
        Some(node) => *node,
        None => return -1,
    };

    let funcs: Vec<(String, FuncId)> = (*inner)
        .tree
        .funcs_of(node)
        .map(|(n, id)| (n.to_string(), id))
        .collect();
    for (name, id) in funcs {
        let func = create_function(inner, ctx, id);
        ffi::set_module_export(ctx, def, &name, func);
    }

    let values: Vec<(String, ValueId)> = (*inner)
        .tree
        .values_of(node)
        .map(|(n, id)| (n.to_string(), id))
        .collect();
    for (name, id) in values {
        if let Some(producer) = (*inner).tree.producer(id) {
            let value = producer(ctx);
            ffi::set_module_export(ctx, def, &name, value);
        }
    }

    // Child modules become recursively populated plain objects, not further
    // native module definitions.
    let children: Vec<(String, NodeId)> = (*inner)
        .tree
        .children_of(node)
        .map(|(n, id)| (n.to_string(), id))
        .collect();
    for (name, child) in children {
        let obj = ffi::new_object(ctx);
        install_node(inner, ctx, obj, child);
        ffi::set_module_export(ctx, def, &name, obj);
    }
    0
}

unsafe fn load_script_module(
    inner: *mut EngineInner,
    ctx: *mut Context,
    name: &str,
) -> *mut ModuleDef {
    let options = &(*inner).options;
    let path = match resolve_script_path(&options.script_extension, &options.module_roots, name)
    {
        Some(path) => path,
        None => {
            ffi::throw_reference_error(ctx, &format!("module not found: {name}"));
            return std::ptr::null_mut();
        }
    };
    let key = path.to_string_lossy().into_owned();
    if let Some(&cached) = (*inner).script_modules.get(&key) {
        return cached as *mut ModuleDef;
    }

    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(e) => {
            ffi::throw_reference_error(ctx, &format!("module not found: {name} ({e})"));
            return std::ptr::null_mut();
        }
    };

    // Declaration-only compile; the runtime evaluates it while linking.
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
    (*inner).script_modules.insert(key, def as usize);
    def
}
