//! Dynamic Invoker
//!
//! Entry point tying the registry and stub cache together: load the library,
//! resolve the symbol, fetch the stub for the call shape, and call.

use std::ffi::c_void;
use std::path::Path;

use lazy_static::lazy_static;
use tracing::warn;

use super::cache::StubCache;
use super::error::{FfiError, FfiResult};
use super::loader::{LibraryResolver, SymbolAddress};
use super::registry::{LibraryRegistry, UnloadPolicy};
use super::signature::SignatureKey;
use super::types::{CallingConvention, TypeDescriptor, Value};
use crate::config::DynffiConfig;

/// A Rust type a native function can return
///
/// The descriptor is inferred from the type, so callers of
/// [`DynamicInvoker::invoke_typed`] only name the Rust type.
pub trait NativeReturn: Sized {
    const DESCRIPTOR: TypeDescriptor;

    fn from_native(value: Option<Value>) -> FfiResult<Self>;
}

fn unexpected<T>(value: Option<Value>, expected: TypeDescriptor) -> FfiResult<T> {
    let got = value.map_or_else(|| "nothing".to_string(), |v| v.descriptor().to_string());
    Err(FfiError::call_failed(format!("expected a {} return, got {}", expected, got)))
}

impl NativeReturn for () {
    const DESCRIPTOR: TypeDescriptor = TypeDescriptor::Void;

    fn from_native(value: Option<Value>) -> FfiResult<Self> {
        match value {
            None => Ok(()),
            other => unexpected(other, Self::DESCRIPTOR),
        }
    }
}

macro_rules! scalar_return {
    ($ty:ty, $variant:ident) => {
        impl NativeReturn for $ty {
            const DESCRIPTOR: TypeDescriptor = TypeDescriptor::$variant;

            fn from_native(value: Option<Value>) -> FfiResult<Self> {
                match value {
                    Some(Value::$variant(v)) => Ok(v),
                    other => unexpected(other, Self::DESCRIPTOR),
                }
            }
        }
    };
}

scalar_return!(i32, Int32);
scalar_return!(i64, Int64);
scalar_return!(f32, Float);
scalar_return!(f64, Double);

impl NativeReturn for *mut c_void {
    const DESCRIPTOR: TypeDescriptor = TypeDescriptor::Pointer;

    fn from_native(value: Option<Value>) -> FfiResult<Self> {
        match value {
            Some(Value::Pointer(addr)) => Ok(addr as *mut c_void),
            other => unexpected(other, Self::DESCRIPTOR),
        }
    }
}

/// A null `const char*` comes back as `None`
impl NativeReturn for Option<String> {
    const DESCRIPTOR: TypeDescriptor = TypeDescriptor::String;

    fn from_native(value: Option<Value>) -> FfiResult<Self> {
        match value {
            Some(Value::String(s)) => Ok(Some(s)),
            Some(Value::Null) => Ok(None),
            other => unexpected(other, Self::DESCRIPTOR),
        }
    }
}

/// Calls exported native functions by name with runtime-typed arguments
pub struct DynamicInvoker {
    registry: LibraryRegistry,
    stubs: StubCache,
    default_convention: CallingConvention,
}

impl DynamicInvoker {
    /// Create an invoker with default settings
    pub fn new() -> Self {
        Self::from_config(&DynffiConfig::default())
    }

    /// Create an invoker from loaded configuration
    pub fn from_config(config: &DynffiConfig) -> Self {
        let search_paths = config.loader.search_paths.clone();
        let resolver = if config.loader.system_paths {
            LibraryResolver::with_system_paths(search_paths)
        } else {
            LibraryResolver::new(search_paths)
        };

        Self::with_parts(
            LibraryRegistry::with_resolver(resolver, config.loader.cache_symbols),
            StubCache::with_strict_conventions(config.calls.strict_conventions),
            config.calls.default_convention,
        )
    }

    /// Create an invoker over explicit state
    pub fn with_parts(
        registry: LibraryRegistry,
        stubs: StubCache,
        default_convention: CallingConvention,
    ) -> Self {
        Self {
            registry,
            stubs,
            default_convention,
        }
    }

    pub fn registry(&self) -> &LibraryRegistry {
        &self.registry
    }

    pub fn stubs(&self) -> &StubCache {
        &self.stubs
    }

    pub fn default_convention(&self) -> CallingConvention {
        self.default_convention
    }

    /// Call `function` with the return type inferred from `R`
    ///
    /// # Safety
    ///
    /// See [`DynamicInvoker::invoke_with`].
    pub unsafe fn invoke_typed<R: NativeReturn>(
        &self,
        library: impl AsRef<Path>,
        function: &str,
        args: &[Value],
    ) -> FfiResult<R> {
        let value = self.invoke(library, function, R::DESCRIPTOR, args)?;
        R::from_native(value).map_err(|e| e.in_function(function))
    }

    /// Call `function` using the default calling convention
    ///
    /// # Safety
    ///
    /// See [`DynamicInvoker::invoke_with`].
    pub unsafe fn invoke(
        &self,
        library: impl AsRef<Path>,
        function: &str,
        ret: TypeDescriptor,
        args: &[Value],
    ) -> FfiResult<Option<Value>> {
        self.invoke_with(library, function, self.default_convention, ret, args)
    }

    /// Call `function` exported by `library`
    ///
    /// Returns `None` for a `void` return.
    ///
    /// # Safety
    ///
    /// The native function must have exactly the declared convention, return
    /// type and argument types. Pointer arguments must be valid for whatever
    /// the function does with them, and array arguments must not be written.
    pub unsafe fn invoke_with(
        &self,
        library: impl AsRef<Path>,
        function: &str,
        convention: CallingConvention,
        ret: TypeDescriptor,
        args: &[Value],
    ) -> FfiResult<Option<Value>> {
        let library = library.as_ref();
        validate(library, function)?;
        if !ret.is_valid_return() {
            return Err(FfiError::invalid(format!("{} is not a return type", ret)));
        }

        // The handle clone keeps the image open until the call returns, even
        // if another thread unloads it meanwhile.
        let handle = self.registry.load(library)?;
        let address = handle.resolve(function)?;

        let key = SignatureKey::for_call(convention, ret, args);
        let stub = self.stubs.get_stub(&key).map_err(|e| e.in_function(function))?;

        let result = stub.invoke(address, args).map_err(|e| e.in_function(function));
        drop(handle);
        result
    }

    /// Resolve `symbol` in `library`, loading the library if needed
    pub fn resolve(&self, library: impl AsRef<Path>, symbol: &str) -> FfiResult<SymbolAddress> {
        let library = library.as_ref();
        validate(library, symbol)?;
        self.registry.load(library)?.resolve(symbol)
    }

    /// Unload every library, returning how many were unloaded
    pub fn reset(&self) -> FfiResult<usize> {
        self.registry.unload_all()
    }

    /// Unload one library
    pub fn reset_library(&self, library: impl AsRef<Path>, policy: UnloadPolicy) -> FfiResult<()> {
        let library = library.as_ref();
        if library.as_os_str().is_empty() {
            return Err(FfiError::invalid("library path is empty"));
        }
        self.registry.unload(library, policy)
    }
}

impl Default for DynamicInvoker {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(library: &Path, function: &str) -> FfiResult<()> {
    if library.as_os_str().is_empty() {
        return Err(FfiError::invalid("library path is empty"));
    }
    if function.is_empty() {
        return Err(FfiError::invalid("function name is empty"));
    }
    Ok(())
}

lazy_static! {
    static ref GLOBAL: DynamicInvoker = DynamicInvoker::from_config(&global_config());
}

fn global_config() -> DynffiConfig {
    DynffiConfig::load_from_cwd().unwrap_or_else(|e| {
        warn!(error = %e, "ignoring unreadable dynffi.toml");
        DynffiConfig::default()
    })
}

/// Process-wide invoker, configured from the nearest `dynffi.toml`
pub fn global() -> &'static DynamicInvoker {
    &GLOBAL
}

/// Call `function` on the global invoker with the return type inferred from `R`
///
/// # Safety
///
/// See [`DynamicInvoker::invoke_with`].
pub unsafe fn invoke<R: NativeReturn>(
    library: impl AsRef<Path>,
    function: &str,
    args: &[Value],
) -> FfiResult<R> {
    global().invoke_typed(library, function, args)
}

/// Call `function` on the global invoker with an explicit return descriptor
///
/// # Safety
///
/// See [`DynamicInvoker::invoke_with`].
pub unsafe fn invoke_untyped(
    library: impl AsRef<Path>,
    function: &str,
    ret: TypeDescriptor,
    args: &[Value],
) -> FfiResult<Option<Value>> {
    global().invoke(library, function, ret, args)
}

/// Unload every library held by the global invoker
pub fn reset() -> FfiResult<usize> {
    global().reset()
}

/// Unload one library held by the global invoker
pub fn reset_library(library: impl AsRef<Path>, policy: UnloadPolicy) -> FfiResult<()> {
    global().reset_library(library, policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::ErrorKind;

    #[test]
    fn test_empty_library_path_rejected() {
        let invoker = DynamicInvoker::new();
        let err = unsafe { invoker.invoke("", "sum", TypeDescriptor::Int32, &[]) }.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(invoker.registry().is_empty());
    }

    #[test]
    fn test_empty_function_rejected_before_loading() {
        let invoker = DynamicInvoker::new();
        let err = unsafe {
            invoker.invoke("/no/such/dir/libmissing.so", "", TypeDescriptor::Int32, &[])
        }
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_array_return_rejected_before_loading() {
        let invoker = DynamicInvoker::new();
        let err = unsafe {
            invoker.invoke(
                "/no/such/dir/libmissing.so",
                "sum",
                TypeDescriptor::Array(crate::ffi::ElementType::Int32),
                &[],
            )
        }
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_missing_library_reports_load_failure() {
        let invoker = DynamicInvoker::new();
        let err = unsafe {
            invoker.invoke_typed::<i32>("/no/such/dir/libmissing.so", "sum", &[Value::Int32(1)])
        }
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LibraryLoadFailed);
        assert!(invoker.stubs().is_empty());
    }

    #[test]
    fn test_native_return_conversions() {
        assert_eq!(i32::from_native(Some(Value::Int32(7))).unwrap(), 7);
        assert_eq!(
            Option::<String>::from_native(Some(Value::Null)).unwrap(),
            None
        );
        assert!(<()>::from_native(None).is_ok());

        let err = f64::from_native(Some(Value::Int32(1))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NativeCallFailed);
    }

    #[test]
    fn test_reset_empty_is_noop() {
        let invoker = DynamicInvoker::new();
        assert_eq!(invoker.reset().unwrap(), 0);
        assert!(invoker
            .reset_library("/no/such/dir/libmissing.so", UnloadPolicy::IgnoreMissing)
            .is_ok());
    }
}
