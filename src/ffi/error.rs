//! FFI Errors

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Broad category of an [`FfiError`], for branching without matching fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    LibraryLoadFailed,
    LibraryNotLoaded,
    SymbolNotFound,
    NativeCallFailed,
    LibraryCloseFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::LibraryLoadFailed => "library load failed",
            ErrorKind::LibraryNotLoaded => "library not loaded",
            ErrorKind::SymbolNotFound => "symbol not found",
            ErrorKind::NativeCallFailed => "native call failed",
            ErrorKind::LibraryCloseFailed => "library close failed",
        };
        f.write_str(name)
    }
}

/// Error type for FFI operations
#[derive(Debug, Error)]
pub enum FfiError {
    /// A required input was empty or malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The platform loader could not open the image
    #[error("Failed to load library '{}': {message}", .path.display())]
    LibraryLoadFailed {
        path: PathBuf,
        code: Option<i32>,
        message: String,
    },

    /// No open handle exists for the path
    #[error("Library not loaded: {}", .0.display())]
    LibraryNotLoaded(PathBuf),

    /// The export table has no such symbol
    #[error("Symbol '{symbol}' not found in '{}': {message}", .path.display())]
    SymbolNotFound {
        path: PathBuf,
        symbol: String,
        code: Option<i32>,
        message: String,
    },

    /// The call executor rejected or failed the call
    #[error("Native call to '{function}' failed: {message}")]
    NativeCallFailed { function: String, message: String },

    /// The platform loader reported an error while closing an image
    #[error("Failed to close library '{}': {message}", .path.display())]
    LibraryCloseFailed {
        path: PathBuf,
        code: Option<i32>,
        message: String,
    },

    /// Several closures failed during a global reset
    #[error("Reset left {} libraries unclosed", .failures.len())]
    ResetIncomplete { failures: Vec<FfiError> },
}

impl FfiError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        FfiError::InvalidArgument(message.into())
    }

    pub(crate) fn call_failed(message: impl Into<String>) -> Self {
        FfiError::NativeCallFailed {
            function: String::new(),
            message: message.into(),
        }
    }

    pub(crate) fn load_failed(path: &Path, err: &libloading::Error) -> Self {
        FfiError::LibraryLoadFailed {
            path: path.to_path_buf(),
            code: platform_code(err),
            message: err.to_string(),
        }
    }

    /// The previous image for `path` is retired but still mapped by running calls
    pub(crate) fn close_pending(path: &Path) -> Self {
        FfiError::LibraryLoadFailed {
            path: path.to_path_buf(),
            code: None,
            message: "close pending: the previous image is still in use by running calls"
                .to_string(),
        }
    }

    pub(crate) fn symbol_not_found(path: &Path, symbol: &str, err: &libloading::Error) -> Self {
        FfiError::SymbolNotFound {
            path: path.to_path_buf(),
            symbol: symbol.to_string(),
            code: platform_code(err),
            message: err.to_string(),
        }
    }

    pub(crate) fn close_failed(path: &Path, err: &libloading::Error) -> Self {
        FfiError::LibraryCloseFailed {
            path: path.to_path_buf(),
            code: platform_code(err),
            message: err.to_string(),
        }
    }

    /// Attach the function name to a call failure raised below the invoker
    pub(crate) fn in_function(self, name: &str) -> Self {
        match self {
            FfiError::NativeCallFailed { function, message } if function.is_empty() => {
                FfiError::NativeCallFailed {
                    function: name.to_string(),
                    message,
                }
            }
            other => other,
        }
    }

    /// Get the category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            FfiError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FfiError::LibraryLoadFailed { .. } => ErrorKind::LibraryLoadFailed,
            FfiError::LibraryNotLoaded(_) => ErrorKind::LibraryNotLoaded,
            FfiError::SymbolNotFound { .. } => ErrorKind::SymbolNotFound,
            FfiError::NativeCallFailed { .. } => ErrorKind::NativeCallFailed,
            FfiError::LibraryCloseFailed { .. } | FfiError::ResetIncomplete { .. } => {
                ErrorKind::LibraryCloseFailed
            }
        }
    }

    /// Platform diagnostic code, where the loader reports one
    ///
    /// Windows loaders report `GetLastError` values; `dlopen`/`dlsym` only
    /// provide a message, so this is `None` on Unix.
    pub fn code(&self) -> Option<i32> {
        match self {
            FfiError::LibraryLoadFailed { code, .. }
            | FfiError::SymbolNotFound { code, .. }
            | FfiError::LibraryCloseFailed { code, .. } => *code,
            _ => None,
        }
    }

    /// Library path this error refers to, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            FfiError::LibraryLoadFailed { path, .. }
            | FfiError::SymbolNotFound { path, .. }
            | FfiError::LibraryCloseFailed { path, .. }
            | FfiError::LibraryNotLoaded(path) => Some(path),
            _ => None,
        }
    }
}

/// Dig the OS error code out of a loader error's source chain
fn platform_code(err: &libloading::Error) -> Option<i32> {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return io.raw_os_error();
        }
        source = cause.source();
    }
    None
}

/// Result type for FFI operations
pub type FfiResult<T> = Result<T, FfiError>;
