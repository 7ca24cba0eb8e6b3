//! Dynamic FFI
//!
//! Calls exported functions of native shared libraries by name, with argument
//! and return types known only at runtime.
//!
//! # Architecture
//!
//! ```text
//! invoke(library, function, return type, args)
//!       │
//!       ▼
//! DynamicInvoker ──► LibraryRegistry ──► LibraryHandle (libloading)
//!       │                                     │ resolve symbol
//!       ▼                                     ▼
//! StubCache (per SignatureKey) ──► InvocationStub ──► native call (libffi)
//! ```
//!
//! A stub adapts one call shape, not one function: every function sharing a
//! calling convention, return type and argument types reuses the same stub.
//!
//! # Example
//!
//! ```ignore
//! use dynffi::ffi::{DynamicInvoker, Value};
//!
//! let invoker = DynamicInvoker::new();
//! let sum: i32 = unsafe {
//!     invoker.invoke_typed("/path/to/libsum.so", "sum", &[Value::Int32(2), Value::Int32(5)])?
//! };
//! assert_eq!(sum, 7);
//! ```

mod cache;
mod error;
mod invoker;
mod loader;
mod marshal;
mod registry;
mod signature;
mod stub;
mod types;

pub use cache::{CacheStats, StubCache};
pub use error::{ErrorKind, FfiError, FfiResult};
pub use invoker::{
    global, invoke, invoke_untyped, reset, reset_library, DynamicInvoker, NativeReturn,
};
pub use loader::{library_filename, LibraryHandle, LibraryResolver, SymbolAddress};
pub use registry::{LibraryRegistry, UnloadPolicy};
pub use signature::SignatureKey;
pub use stub::InvocationStub;
pub use types::{ArrayValue, CallingConvention, ElementType, TypeDescriptor, Value};
