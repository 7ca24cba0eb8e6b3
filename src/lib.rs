//! dynffi - Dynamic Foreign Function Invocation
//!
//! Loads native shared libraries at runtime and calls their exported functions
//! by name, with the return type and argument values supplied at call time.
//! Nothing has to be declared ahead of time.
//!
//! # Features
//!
//! - **Load once per path**: concurrent first loads of one library open it once
//! - **One stub per call shape**: the call interface for a (convention, return,
//!   arguments) shape is prepared once and shared by every function with that shape
//! - **Marshaling**: integers, floats, pointers, strings, null and arrays
//! - **Safe unloading**: a library is only closed once no call through it is running
//!
//! # Example
//!
//! ```ignore
//! use dynffi::{TypeDescriptor, Value};
//!
//! let args = [Value::Int32(2), Value::Int32(5)];
//! let sum: i32 = unsafe { dynffi::invoke("./libsum.so", "sum", &args)? };
//! assert_eq!(sum, 7);
//!
//! let product = unsafe {
//!     dynffi::invoke_untyped(
//!         "./libmul.so",
//!         "multiply",
//!         TypeDescriptor::Double,
//!         &[9.2.into(), 3.4.into()],
//!     )?
//! };
//! dynffi::reset()?;
//! ```

pub mod config;
pub mod ffi;
pub mod logging;

pub use config::{ConfigError, DynffiConfig};
pub use ffi::{
    global, invoke, invoke_untyped, reset, reset_library, CallingConvention, DynamicInvoker,
    ErrorKind, FfiError, FfiResult, NativeReturn, TypeDescriptor, UnloadPolicy, Value,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
