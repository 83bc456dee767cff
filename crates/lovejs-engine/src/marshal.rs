//! Bidirectional conversion between native types and runtime values.
//!
//! Only types implementing [`ScriptType`] cross the boundary, so an
//! unsupported parameter or return type in a registered function is a build
//! error at the registration site, not a runtime surprise. Failed conversions
//! throw on the runtime's exception channel and never leave partially built
//! results behind.

use crate::ffi::{self, Context, Value};

/// Upper bound on converted sequence lengths. Script input is untrusted; a
/// hostile `{length: 1e12}` must not translate into a host allocation.
pub const MAX_SEQUENCE_LEN: usize = 1_000_000;

pub trait ScriptType: Sized + 'static {
    /// Convert a runtime value into a native one. Returns `None` after
    /// throwing a type error on the runtime's exception channel. `v` is
    /// borrowed, never consumed.
    unsafe fn from_value(ctx: *mut Context, v: Value) -> Option<Self>;

    /// Produce an owned runtime value from a native one.
    unsafe fn into_value(self, ctx: *mut Context) -> Value;
}

impl ScriptType for i32 {
    unsafe fn from_value(ctx: *mut Context, v: Value) -> Option<Self> {
        if !ffi::is_number(v) {
            ffi::throw_type_error(ctx, "expected a number");
            return None;
        }
        ffi::to_i32(ctx, v)
    }

    unsafe fn into_value(self, _ctx: *mut Context) -> Value {
        ffi::new_int32(self)
    }
}

impl ScriptType for i64 {
    unsafe fn from_value(ctx: *mut Context, v: Value) -> Option<Self> {
        if !ffi::is_number(v) {
            ffi::throw_type_error(ctx, "expected a number");
            return None;
        }
        ffi::to_i64(ctx, v)
    }

    unsafe fn into_value(self, ctx: *mut Context) -> Value {
        ffi::new_int64(ctx, self)
    }
}

impl ScriptType for f64 {
    unsafe fn from_value(ctx: *mut Context, v: Value) -> Option<Self> {
        if !ffi::is_number(v) {
            ffi::throw_type_error(ctx, "expected a number");
            return None;
        }
        ffi::to_f64(ctx, v)
    }

    unsafe fn into_value(self, _ctx: *mut Context) -> Value {
        ffi::new_float64(self)
    }
}

impl ScriptType for bool {
    unsafe fn from_value(ctx: *mut Context, v: Value) -> Option<Self> {
        // Truthiness conversion, like the runtime's own boolean contexts.
        ffi::to_bool(ctx, v)
    }

    unsafe fn into_value(self, _ctx: *mut Context) -> Value {
        ffi::new_bool(self)
    }
}

impl ScriptType for String {
    unsafe fn from_value(ctx: *mut Context, v: Value) -> Option<Self> {
        ffi::to_string_lossy(ctx, v)
    }

    unsafe fn into_value(self, ctx: *mut Context) -> Value {
        ffi::new_string(ctx, &self)
    }
}

impl<T: ScriptType> ScriptType for Vec<T> {
    unsafe fn from_value(ctx: *mut Context, v: Value) -> Option<Self> {
        let len = match sequence_len(ctx, v) {
            Some(len) => len,
            None => {
                ffi::throw_type_error(ctx, "expected a sequence");
                return None;
            }
        };
        if len > MAX_SEQUENCE_LEN {
            ffi::throw_range_error(
                ctx,
                &format!("sequence too long: {len} elements exceeds the {MAX_SEQUENCE_LEN} cap"),
            );
            return None;
        }
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let elem = ffi::get_index(ctx, v, i as u32);
            if ffi::is_exception(elem) {
                let fault = ffi::take_exception(ctx);
                ffi::throw_type_error(ctx, &format!("sequence element {i}: {}", fault.message));
                return None;
            }
            let converted = T::from_value(ctx, elem);
            ffi::free_value(ctx, elem);
            match converted {
                Some(value) => out.push(value),
                None => {
                    let fault = ffi::take_exception(ctx);
                    ffi::throw_type_error(
                        ctx,
                        &format!("sequence element {i}: {}", fault.message),
                    );
                    return None;
                }
            }
        }
        Some(out)
    }

    unsafe fn into_value(self, ctx: *mut Context) -> Value {
        let arr = ffi::new_array(ctx);
        for (i, item) in self.into_iter().enumerate() {
            let value = item.into_value(ctx);
            ffi::set_index(ctx, arr, i as u32, value);
        }
        arr
    }
}

/// Array-like shape check: an object carrying a non-negative numeric
/// `length`. Returns the length without converting any element.
unsafe fn sequence_len(ctx: *mut Context, v: Value) -> Option<usize> {
    if !ffi::is_object(v) {
        return None;
    }
    let len_val = ffi::get_property(ctx, v, "length");
    if ffi::is_exception(len_val) {
        let _ = ffi::take_exception(ctx);
        return None;
    }
    if ffi::is_undefined(len_val) {
        ffi::free_value(ctx, len_val);
        return None;
    }
    if !ffi::is_number(len_val) {
        ffi::free_value(ctx, len_val);
        return None;
    }
    let len = ffi::to_i64(ctx, len_val);
    ffi::free_value(ctx, len_val);
    match len {
        Some(len) if len >= 0 => Some(len as usize),
        _ => None,
    }
}

/// Return-position conversion. Distinct from [`ScriptType`] so that native
/// functions may return nothing at all.
pub trait ScriptReturn: 'static {
    unsafe fn into_return(self, ctx: *mut Context) -> Value;
}

impl ScriptReturn for () {
    unsafe fn into_return(self, _ctx: *mut Context) -> Value {
        ffi::undefined()
    }
}

impl ScriptReturn for i32 {
    unsafe fn into_return(self, ctx: *mut Context) -> Value {
        self.into_value(ctx)
    }
}

impl ScriptReturn for i64 {
    unsafe fn into_return(self, ctx: *mut Context) -> Value {
        self.into_value(ctx)
    }
}

impl ScriptReturn for f64 {
    unsafe fn into_return(self, ctx: *mut Context) -> Value {
        self.into_value(ctx)
    }
}

impl ScriptReturn for bool {
    unsafe fn into_return(self, ctx: *mut Context) -> Value {
        self.into_value(ctx)
    }
}

impl ScriptReturn for String {
    unsafe fn into_return(self, ctx: *mut Context) -> Value {
        self.into_value(ctx)
    }
}

impl<T: ScriptType> ScriptReturn for Vec<T> {
    unsafe fn into_return(self, ctx: *mut Context) -> Value {
        self.into_value(ctx)
    }
}
