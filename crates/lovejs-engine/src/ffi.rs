//! The QuickJS C ABI boundary.
//!
//! Every `rquickjs_sys` call in this crate goes through here. The helpers are
//! deliberately thin: they fix up the handful of header-inline conveniences
//! the raw bindings cannot express (value construction, reference counting,
//! tag tests) and keep C string handling in one place. Ownership follows the
//! QuickJS conventions: `JS_Set*` calls consume the value reference they are
//! given, everything returned to the caller here is an owned reference that
//! must be released with [`free_value`].

#![allow(clippy::missing_safety_doc)]

use std::ffi::{c_char, c_int, c_void, CStr, CString};

pub use rquickjs_sys as sys;

pub type Runtime = sys::JSRuntime;
pub type Context = sys::JSContext;
pub type Value = sys::JSValue;
pub type ModuleDef = sys::JSModuleDef;

/// Restates the header-only `JSRefCountHeader` (a bare `int ref_count`), which
/// `bindgen` does not emit because it is never referenced by a declared
/// function signature.
#[repr(C)]
struct JSRefCountHeader {
    ref_count: c_int,
}

pub const EVAL_GLOBAL: c_int = sys::JS_EVAL_TYPE_GLOBAL as c_int;
pub const EVAL_MODULE: c_int = sys::JS_EVAL_TYPE_MODULE as c_int;
pub const EVAL_COMPILE_ONLY: c_int = sys::JS_EVAL_FLAG_COMPILE_ONLY as c_int;

// -------------------------
// Value construction
// -------------------------

#[inline]
fn mkval(tag: i64, v: i32) -> Value {
    Value {
        u: sys::JSValueUnion { int32: v },
        tag,
    }
}

#[inline]
pub fn undefined() -> Value {
    mkval(sys::JS_TAG_UNDEFINED as i64, 0)
}

/// The sentinel QuickJS uses for "an exception is pending".
#[inline]
pub fn exception_marker() -> Value {
    mkval(sys::JS_TAG_EXCEPTION as i64, 0)
}

#[inline]
pub fn new_bool(v: bool) -> Value {
    mkval(sys::JS_TAG_BOOL as i64, v as i32)
}

#[inline]
pub fn new_int32(v: i32) -> Value {
    mkval(sys::JS_TAG_INT as i64, v)
}

#[inline]
pub fn new_float64(v: f64) -> Value {
    Value {
        u: sys::JSValueUnion { float64: v },
        tag: sys::JS_TAG_FLOAT64 as i64,
    }
}

pub unsafe fn new_int64(_ctx: *mut Context, v: i64) -> Value {
    // Restates the header-inline `JS_NewInt64`: fits-in-i32 stays tagged as
    // an int, otherwise it is represented as a float64.
    if v == v as i32 as i64 {
        new_int32(v as i32)
    } else {
        new_float64(v as f64)
    }
}

pub unsafe fn new_string(ctx: *mut Context, s: &str) -> Value {
    sys::JS_NewStringLen(ctx, s.as_ptr() as *const c_char, s.len() as u64)
}

pub unsafe fn new_object(ctx: *mut Context) -> Value {
    sys::JS_NewObject(ctx)
}

pub unsafe fn new_array(ctx: *mut Context) -> Value {
    sys::JS_NewArray(ctx)
}

// -------------------------
// Tags and reference counts
// -------------------------

#[inline]
pub fn is_exception(v: Value) -> bool {
    v.tag == sys::JS_TAG_EXCEPTION as i64
}

#[inline]
pub fn is_undefined(v: Value) -> bool {
    v.tag == sys::JS_TAG_UNDEFINED as i64
}

#[inline]
pub fn is_object(v: Value) -> bool {
    v.tag == sys::JS_TAG_OBJECT as i64
}

#[inline]
pub fn is_number(v: Value) -> bool {
    v.tag == sys::JS_TAG_INT as i64 || v.tag == sys::JS_TAG_FLOAT64 as i64
}

#[inline]
pub fn is_module(v: Value) -> bool {
    v.tag == sys::JS_TAG_MODULE as i64
}

#[inline]
fn has_ref_count(v: Value) -> bool {
    // Mirrors JS_VALUE_HAS_REF_COUNT from the C header.
    (v.tag as i32 as u32) >= (sys::JS_TAG_FIRST as i32 as u32)
}

/// Release one reference. Restates the header-inline `JS_FreeValue`.
pub unsafe fn free_value(ctx: *mut Context, v: Value) {
    if has_ref_count(v) {
        let header = v.u.ptr as *mut JSRefCountHeader;
        (*header).ref_count -= 1;
        if (*header).ref_count <= 0 {
            sys::JS_FreeValue(ctx, v);
        }
    }
}

// -------------------------
// Conversions out of the runtime
// -------------------------

pub unsafe fn to_i32(ctx: *mut Context, v: Value) -> Option<i32> {
    let mut out: i32 = 0;
    if sys::JS_ToInt32(ctx, &mut out, v) < 0 {
        return None;
    }
    Some(out)
}

pub unsafe fn to_i64(ctx: *mut Context, v: Value) -> Option<i64> {
    let mut out: i64 = 0;
    if sys::JS_ToInt64(ctx, &mut out, v) < 0 {
        return None;
    }
    Some(out)
}

pub unsafe fn to_f64(ctx: *mut Context, v: Value) -> Option<f64> {
    let mut out: f64 = 0.0;
    if sys::JS_ToFloat64(ctx, &mut out, v) < 0 {
        return None;
    }
    Some(out)
}

pub unsafe fn to_bool(ctx: *mut Context, v: Value) -> Option<bool> {
    let r = sys::JS_ToBool(ctx, v);
    if r < 0 {
        return None;
    }
    Some(r != 0)
}

pub unsafe fn to_string_lossy(ctx: *mut Context, v: Value) -> Option<String> {
    let mut len: u64 = 0;
    let ptr = sys::JS_ToCStringLen2(ctx, &mut len, v, false);
    if ptr.is_null() {
        return None;
    }
    let bytes = std::slice::from_raw_parts(ptr as *const u8, len as usize);
    let out = String::from_utf8_lossy(bytes).into_owned();
    sys::JS_FreeCString(ctx, ptr);
    Some(out)
}

// -------------------------
// Properties and calls
// -------------------------

fn cstring_lossy(s: &str) -> CString {
    match CString::new(s) {
        Ok(c) => c,
        Err(_) => c"<invalid name>".to_owned(),
    }
}

pub unsafe fn global_object(ctx: *mut Context) -> Value {
    sys::JS_GetGlobalObject(ctx)
}

pub unsafe fn get_property(ctx: *mut Context, obj: Value, name: &str) -> Value {
    let cname = cstring_lossy(name);
    sys::JS_GetPropertyStr(ctx, obj, cname.as_ptr())
}

pub unsafe fn set_property(ctx: *mut Context, obj: Value, name: &str, value: Value) {
    let cname = cstring_lossy(name);
    let _ = sys::JS_SetPropertyStr(ctx, obj, cname.as_ptr(), value);
}

pub unsafe fn get_index(ctx: *mut Context, obj: Value, idx: u32) -> Value {
    sys::JS_GetPropertyUint32(ctx, obj, idx)
}

pub unsafe fn set_index(ctx: *mut Context, obj: Value, idx: u32, value: Value) {
    let _ = sys::JS_SetPropertyUint32(ctx, obj, idx, value);
}

pub unsafe fn is_callable(ctx: *mut Context, v: Value) -> bool {
    sys::JS_IsFunction(ctx, v)
}

/// Call `func` with `this` set to undefined. `args` are borrowed, the result
/// is owned by the caller.
pub unsafe fn call(ctx: *mut Context, func: Value, args: &mut [Value]) -> Value {
    sys::JS_Call(ctx, func, undefined(), args.len() as c_int, args.as_mut_ptr())
}

pub type CFunction =
    unsafe extern "C" fn(*mut Context, Value, c_int, *mut Value, c_int, *mut Value) -> Value;

/// Create a callable runtime value backed by `func`, with `data` attached as
/// the function's data slots (duplicated by the runtime).
pub unsafe fn new_function_data(
    ctx: *mut Context,
    func: CFunction,
    length: usize,
    data: &mut [Value],
) -> Value {
    sys::JS_NewCFunctionData(
        ctx,
        Some(func),
        length as c_int,
        0,
        data.len() as c_int,
        data.as_mut_ptr(),
    )
}

// -------------------------
// Exceptions
// -------------------------

const FMT_S: &CStr = c"%s";

pub unsafe fn throw_type_error(ctx: *mut Context, msg: &str) -> Value {
    let c = cstring_lossy(msg);
    sys::JS_ThrowTypeError(ctx, FMT_S.as_ptr(), c.as_ptr())
}

pub unsafe fn throw_range_error(ctx: *mut Context, msg: &str) -> Value {
    let c = cstring_lossy(msg);
    sys::JS_ThrowRangeError(ctx, FMT_S.as_ptr(), c.as_ptr())
}

pub unsafe fn throw_reference_error(ctx: *mut Context, msg: &str) -> Value {
    let c = cstring_lossy(msg);
    sys::JS_ThrowReferenceError(ctx, FMT_S.as_ptr(), c.as_ptr())
}

pub unsafe fn throw_internal_error(ctx: *mut Context, msg: &str) -> Value {
    let c = cstring_lossy(msg);
    sys::JS_ThrowInternalError(ctx, FMT_S.as_ptr(), c.as_ptr())
}

/// A captured script failure: best-effort message plus stack text.
#[derive(Debug, Clone)]
pub struct ScriptFault {
    pub message: String,
    pub stack: Option<String>,
}

impl ScriptFault {
    pub fn render(&self) -> String {
        match &self.stack {
            Some(stack) => format!("{}\n{}", self.message, stack.trim_end()),
            None => self.message.clone(),
        }
    }
}

/// Describe an error value without consuming it.
pub unsafe fn describe_error(ctx: *mut Context, error: Value) -> ScriptFault {
    let message =
        to_string_lossy(ctx, error).unwrap_or_else(|| "unknown script error".to_string());
    let stack_val = get_property(ctx, error, "stack");
    let stack = if is_exception(stack_val) {
        // Reading `.stack` off a primitive can itself throw; swallow that.
        let pending = sys::JS_GetException(ctx);
        free_value(ctx, pending);
        None
    } else if is_undefined(stack_val) {
        None
    } else {
        to_string_lossy(ctx, stack_val)
    };
    free_value(ctx, stack_val);
    ScriptFault { message, stack }
}

/// Take and describe the pending exception.
pub unsafe fn take_exception(ctx: *mut Context) -> ScriptFault {
    let error = sys::JS_GetException(ctx);
    let fault = describe_error(ctx, error);
    free_value(ctx, error);
    fault
}

// -------------------------
// Jobs and promises
// -------------------------

/// Drain the microtask queue. Returns the first job failure, if any.
pub unsafe fn run_pending_jobs(rt: *mut Runtime) -> Option<ScriptFault> {
    let mut first: Option<ScriptFault> = None;
    loop {
        let mut job_ctx: *mut Context = std::ptr::null_mut();
        let r = sys::JS_ExecutePendingJob(rt, &mut job_ctx);
        if r == 0 {
            break;
        }
        if r < 0 {
            let fault = take_exception(job_ctx);
            if first.is_none() {
                first = Some(fault);
            }
        }
    }
    first
}

/// If `v` is a rejected promise, describe its rejection value.
pub unsafe fn rejected_promise_fault(ctx: *mut Context, v: Value) -> Option<ScriptFault> {
    if !is_object(v) {
        return None;
    }
    if sys::JS_PromiseState(ctx, v) != sys::JSPromiseStateEnum_JS_PROMISE_REJECTED {
        return None;
    }
    let result = sys::JS_PromiseResult(ctx, v);
    let fault = describe_error(ctx, result);
    free_value(ctx, result);
    Some(fault)
}

// -------------------------
// Evaluation and modules
// -------------------------

pub unsafe fn eval(ctx: *mut Context, source: &str, name: &str, flags: c_int) -> Value {
    // QuickJS requires the input buffer to be NUL-terminated.
    let csrc = match CString::new(source) {
        Ok(c) => c,
        Err(_) => return throw_type_error(ctx, "source contains a NUL byte"),
    };
    let cname = cstring_lossy(name);
    sys::JS_Eval(ctx, csrc.as_ptr(), source.len() as u64, cname.as_ptr(), flags)
}

pub type ModuleInitFn = unsafe extern "C" fn(*mut Context, *mut ModuleDef) -> c_int;
pub type ModuleLoaderFn = unsafe extern "C" fn(*mut Context, *const c_char, *mut c_void) -> *mut ModuleDef;

pub unsafe fn set_module_loader(rt: *mut Runtime, loader: ModuleLoaderFn, opaque: *mut c_void) {
    sys::JS_SetModuleLoaderFunc(rt, None, Some(loader), opaque);
}

pub unsafe fn new_c_module(ctx: *mut Context, name: &str, init: ModuleInitFn) -> *mut ModuleDef {
    let cname = cstring_lossy(name);
    sys::JS_NewCModule(ctx, cname.as_ptr(), Some(init))
}

pub unsafe fn add_module_export(ctx: *mut Context, m: *mut ModuleDef, name: &str) {
    let cname = cstring_lossy(name);
    let _ = sys::JS_AddModuleExport(ctx, m, cname.as_ptr());
}

pub unsafe fn set_module_export(ctx: *mut Context, m: *mut ModuleDef, name: &str, value: Value) {
    let cname = cstring_lossy(name);
    let _ = sys::JS_SetModuleExport(ctx, m, cname.as_ptr(), value);
}

/// Extract the module definition handle from a compiled-module value.
pub unsafe fn module_def(v: Value) -> *mut ModuleDef {
    v.u.ptr as *mut ModuleDef
}

pub unsafe fn resolve_module(ctx: *mut Context, v: Value) -> bool {
    sys::JS_ResolveModule(ctx, v) >= 0
}

/// Evaluate a compiled module or bytecode function. Consumes `v`.
pub unsafe fn eval_function(ctx: *mut Context, v: Value) -> Value {
    sys::JS_EvalFunction(ctx, v)
}

pub unsafe fn module_namespace(ctx: *mut Context, m: *mut ModuleDef) -> Value {
    sys::JS_GetModuleNamespace(ctx, m)
}

/// Enumerable own string-keyed property names of `obj`.
pub unsafe fn own_property_names(ctx: *mut Context, obj: Value) -> Vec<String> {
    let mut tab: *mut sys::JSPropertyEnum = std::ptr::null_mut();
    let mut count: u32 = 0;
    let flags = (sys::JS_GPN_STRING_MASK | sys::JS_GPN_ENUM_ONLY) as c_int;
    if sys::JS_GetOwnPropertyNames(ctx, &mut tab, &mut count, obj, flags) < 0 {
        return Vec::new();
    }
    let mut names = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let entry = tab.add(i);
        let cname = sys::JS_AtomToCString(ctx, (*entry).atom);
        if !cname.is_null() {
            names.push(CStr::from_ptr(cname).to_string_lossy().into_owned());
            sys::JS_FreeCString(ctx, cname);
        }
        sys::JS_FreeAtom(ctx, (*entry).atom);
    }
    sys::js_free(ctx, tab as *mut c_void);
    names
}

// -------------------------
// Compiled units
// -------------------------

pub unsafe fn write_compiled_unit(ctx: *mut Context, v: Value) -> Option<Vec<u8>> {
    let mut len: u64 = 0;
    let ptr = sys::JS_WriteObject(ctx, &mut len, v, sys::JS_WRITE_OBJ_BYTECODE as c_int);
    if ptr.is_null() {
        return None;
    }
    let out = std::slice::from_raw_parts(ptr, len as usize).to_vec();
    sys::js_free(ctx, ptr as *mut c_void);
    Some(out)
}

pub unsafe fn read_compiled_unit(ctx: *mut Context, bytes: &[u8]) -> Value {
    sys::JS_ReadObject(ctx, bytes.as_ptr(), bytes.len() as u64, sys::JS_READ_OBJ_BYTECODE as c_int)
}

// -------------------------
// Runtime lifecycle
// -------------------------

pub unsafe fn new_runtime() -> *mut Runtime {
    sys::JS_NewRuntime()
}

pub unsafe fn new_context(rt: *mut Runtime) -> *mut Context {
    sys::JS_NewContext(rt)
}

pub unsafe fn free_context(ctx: *mut Context) {
    sys::JS_FreeContext(ctx);
}

pub unsafe fn free_runtime(rt: *mut Runtime) {
    sys::JS_FreeRuntime(rt);
}

pub unsafe fn run_gc(rt: *mut Runtime) {
    sys::JS_RunGC(rt);
}

pub unsafe fn set_runtime_opaque(rt: *mut Runtime, opaque: *mut c_void) {
    sys::JS_SetRuntimeOpaque(rt, opaque);
}

pub unsafe fn runtime_opaque(rt: *mut Runtime) -> *mut c_void {
    sys::JS_GetRuntimeOpaque(rt)
}

pub unsafe fn context_runtime(ctx: *mut Context) -> *mut Runtime {
    sys::JS_GetRuntime(ctx)
}
