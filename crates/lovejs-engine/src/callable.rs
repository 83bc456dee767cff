//! Wrapping native functions as runtime-callable values.
//!
//! A wrapped function checks the argument count first, converts arguments
//! left to right, and only then invokes the native function: at most once,
//! and never with a partially converted argument list.

use crate::ffi::{self, Context, Value};
use crate::marshal::{ScriptReturn, ScriptType};

/// A native function as seen from the runtime side: a fixed arity and a call
/// operation that reports failures on the runtime's exception channel.
pub trait NativeCallable: 'static {
    fn arity(&self) -> usize;

    /// Invoked from the engine trampoline with the caller's argument values.
    /// Implementations must not unwind; failures are thrown into the runtime
    /// and signalled by returning the exception marker.
    unsafe fn call(&self, ctx: *mut Context, args: &[Value]) -> Value;
}

type RawCall = dyn Fn(*mut Context, &[Value]) -> Value;

/// The standard [`NativeCallable`] produced from a plain Rust function or
/// closure via [`IntoNativeCallable`].
pub struct CallableFn {
    arity: usize,
    raw: Box<RawCall>,
}

impl NativeCallable for CallableFn {
    fn arity(&self) -> usize {
        self.arity
    }

    unsafe fn call(&self, ctx: *mut Context, args: &[Value]) -> Value {
        (self.raw)(ctx, args)
    }
}

/// Conversion from a typed native function into a [`CallableFn`]. Implemented
/// for `Fn` signatures of arity 0 through 6 whose parameters are
/// [`ScriptType`]s and whose return type is a [`ScriptReturn`]; anything else
/// fails to compile at the registration site.
pub trait IntoNativeCallable<Args> {
    fn into_callable(self) -> CallableFn;
}

macro_rules! impl_into_callable {
    ($count:expr $(, $ty:ident => $idx:tt)*) => {
        impl<F, R $(, $ty)*> IntoNativeCallable<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> R + 'static,
            R: ScriptReturn,
            $($ty: ScriptType,)*
        {
            #[allow(non_snake_case)]
            fn into_callable(self) -> CallableFn {
                CallableFn {
                    arity: $count,
                    raw: Box::new(move |ctx, args| unsafe {
                        if args.len() != $count {
                            return ffi::throw_type_error(
                                ctx,
                                &format!(
                                    "expected {} arguments, got {}",
                                    $count,
                                    args.len()
                                ),
                            );
                        }
                        $(
                            let $ty = match <$ty as ScriptType>::from_value(ctx, args[$idx]) {
                                Some(value) => value,
                                None => return ffi::exception_marker(),
                            };
                        )*
                        let ret = (self)($($ty),*);
                        ret.into_return(ctx)
                    }),
                }
            }
        }
    };
}

impl_into_callable!(0);
impl_into_callable!(1, A0 => 0);
impl_into_callable!(2, A0 => 0, A1 => 1);
impl_into_callable!(3, A0 => 0, A1 => 1, A2 => 2);
impl_into_callable!(4, A0 => 0, A1 => 1, A2 => 2, A3 => 3);
impl_into_callable!(5, A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4);
impl_into_callable!(6, A0 => 0, A1 => 1, A2 => 2, A3 => 3, A4 => 4, A5 => 5);
