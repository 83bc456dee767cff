//! Embedding layer between native hosts and the QuickJS runtime: typed
//! native-function registration, a hierarchical module namespace, script and
//! compiled-unit execution, and ahead-of-time compilation.

pub mod callable;
pub mod compile;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod marshal;
pub mod module;
