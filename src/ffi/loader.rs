//! Dynamic Library Loader
//!
//! Safe wrapper around libloading for one open library image, plus the
//! search rules that turn a requested library into a registry key.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libloading::{Library, Symbol};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::error::{FfiError, FfiResult};

/// Address of an exported function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolAddress(usize);

impl SymbolAddress {
    pub fn new(addr: usize) -> Self {
        SymbolAddress(addr)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub fn as_ptr(&self) -> *const c_void {
        self.0 as *const c_void
    }
}

impl fmt::Display for SymbolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One open native library image
///
/// Handles are shared as `Arc<LibraryHandle>`; a call keeps its clone alive
/// until the native function returns, so the image outlives every in-flight
/// call even after the registry has dropped it.
pub struct LibraryHandle {
    /// Registry key (canonical path, or the verbatim name for loader-searched libraries)
    path: PathBuf,
    /// The loaded library handle; `None` only once closed
    library: Option<Library>,
    /// Cached function symbols
    symbols: Option<RwLock<HashMap<String, SymbolAddress>>>,
    /// Set once the registry has unloaded this handle
    retired: AtomicBool,
    /// Set once the image has been handed back to the platform loader
    closed: Arc<AtomicBool>,
}

impl LibraryHandle {
    /// Open the image at `path`
    pub fn open(path: impl AsRef<Path>, cache_symbols: bool) -> FfiResult<Self> {
        let path = path.as_ref().to_path_buf();

        // Safety: loading a library runs its initialisers. We trust the
        // caller to name a library that is safe to load into this process.
        let library =
            unsafe { Library::new(&path) }.map_err(|e| FfiError::load_failed(&path, &e))?;
        debug!(path = %path.display(), "opened native library");

        Ok(Self {
            path,
            library: Some(library),
            symbols: cache_symbols.then(|| RwLock::new(HashMap::new())),
            retired: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Get the path to this library
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the registry has unloaded this handle
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Flag that flips once the image is closed, observable after the handle is gone
    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    /// Number of symbols resolved through the cache
    pub fn cached_symbols(&self) -> usize {
        self.symbols.as_ref().map_or(0, |cache| cache.read().len())
    }

    /// Resolve an exported function by exact name
    pub fn resolve(&self, name: &str) -> FfiResult<SymbolAddress> {
        if self.is_retired() {
            return Err(FfiError::LibraryNotLoaded(self.path.clone()));
        }

        // Check cache first
        if let Some(cache) = &self.symbols {
            if let Some(&addr) = cache.read().get(name) {
                trace!(symbol = name, "symbol cache hit");
                return Ok(addr);
            }
        }

        let c_name = CString::new(name)
            .map_err(|_| FfiError::invalid(format!("symbol name '{}' contains a NUL byte", name)))?;
        let library = self
            .library
            .as_ref()
            .ok_or_else(|| FfiError::LibraryNotLoaded(self.path.clone()))?;

        // Safety: the symbol is read as an untyped address; the shape it is
        // called with is checked by the stub it is paired with.
        let addr = unsafe {
            let symbol: Symbol<*const c_void> = library
                .get(c_name.as_bytes_with_nul())
                .map_err(|e| FfiError::symbol_not_found(&self.path, name, &e))?;
            SymbolAddress::new(*symbol as usize)
        };

        if let Some(cache) = &self.symbols {
            cache.write().entry(name.to_string()).or_insert(addr);
        }
        Ok(addr)
    }

    /// Release the image
    pub fn close(mut self) -> FfiResult<()> {
        match self.library.take() {
            Some(library) => {
                let result = library.close();
                self.closed.store(true, Ordering::Release);
                result.map_err(|e| FfiError::close_failed(&self.path, &e))?;
                debug!(path = %self.path.display(), "closed native library");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        // Reached when the last in-flight call releases a retired handle.
        if let Some(library) = self.library.take() {
            let result = library.close();
            self.closed.store(true, Ordering::Release);
            match result {
                Ok(()) => {
                    debug!(path = %self.path.display(), "closed native library after last call")
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "failed to close native library")
                }
            }
        }
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("path", &self.path)
            .field("retired", &self.is_retired())
            .field("cached_symbols", &self.cached_symbols())
            .finish()
    }
}

/// Search rules for turning a requested library into a registry key
#[derive(Debug, Clone, Default)]
pub struct LibraryResolver {
    /// Search paths for libraries
    search_paths: Vec<PathBuf>,
}

impl LibraryResolver {
    /// Resolver with only the given search paths
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// Resolver with the given search paths followed by the platform defaults
    pub fn with_system_paths(mut search_paths: Vec<PathBuf>) -> Self {
        search_paths.extend(default_search_paths());
        Self { search_paths }
    }

    /// Add a search path
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) {
        self.search_paths.push(path.as_ref().to_path_buf());
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Resolve a request to its registry key
    ///
    /// Existing files are canonicalised. Bare names are looked up in the search
    /// paths, as given and then as the platform file name. Anything else is
    /// returned verbatim for the platform loader to search.
    pub fn resolve(&self, request: &Path) -> PathBuf {
        if request.exists() {
            return canonical(request);
        }

        if request.components().count() == 1 {
            let name = request.to_string_lossy();
            let platform_name = library_filename(&name);
            for search_path in &self.search_paths {
                for candidate in [search_path.join(request), search_path.join(&platform_name)] {
                    if candidate.is_file() {
                        return canonical(&candidate);
                    }
                }
            }
        }

        request.to_path_buf()
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Get the default library search paths for this platform
fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // Current directory
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd);
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(ld_path) = std::env::var("LD_LIBRARY_PATH") {
            paths.extend(std::env::split_paths(&ld_path));
        }
        for dir in ["/usr/local/lib", "/usr/lib", "/usr/lib64", "/lib", "/lib64"] {
            paths.push(PathBuf::from(dir));
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(dyld_path) = std::env::var("DYLD_LIBRARY_PATH") {
            paths.extend(std::env::split_paths(&dyld_path));
        }
        for dir in ["/usr/local/lib", "/opt/homebrew/lib", "/usr/lib"] {
            paths.push(PathBuf::from(dir));
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(path) = std::env::var("PATH") {
            paths.extend(std::env::split_paths(&path));
        }
    }

    paths
}

/// Construct the platform-specific library filename
pub fn library_filename(name: &str) -> String {
    #[cfg(target_os = "windows")]
    {
        if name.to_lowercase().ends_with(".dll") {
            name.to_string()
        } else {
            format!("{}.dll", name)
        }
    }

    #[cfg(target_os = "macos")]
    {
        if name.ends_with(".dylib") {
            name.to_string()
        } else if name.starts_with("lib") {
            format!("{}.dylib", name)
        } else {
            format!("lib{}.dylib", name)
        }
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if name.contains(".so") {
            name.to_string()
        } else if name.starts_with("lib") {
            format!("{}.so", name)
        } else {
            format!("lib{}.so", name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::ErrorKind;

    #[test]
    fn test_library_filename() {
        #[cfg(target_os = "linux")]
        {
            assert_eq!(library_filename("sum"), "libsum.so");
            assert_eq!(library_filename("libsum"), "libsum.so");
            assert_eq!(library_filename("libc.so.6"), "libc.so.6");
        }
        #[cfg(target_os = "macos")]
        assert_eq!(library_filename("sum"), "libsum.dylib");
        #[cfg(target_os = "windows")]
        assert_eq!(library_filename("sum"), "sum.dll");
    }

    #[test]
    fn test_open_missing_library() {
        let err = LibraryHandle::open("/definitely/not/here/libnothing.so", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LibraryLoadFailed);
        assert!(err.to_string().contains("libnothing"));
    }

    #[test]
    fn test_resolver_keeps_unknown_names_verbatim() {
        let resolver = LibraryResolver::new(vec![]);
        assert_eq!(
            resolver.resolve(Path::new("libdoesnotexist.so.9")),
            PathBuf::from("libdoesnotexist.so.9")
        );
    }

    #[test]
    fn test_resolver_canonicalizes_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("libfake.so");
        std::fs::write(&file, b"not really a library").unwrap();

        let resolver = LibraryResolver::new(vec![dir.path().to_path_buf()]);
        let expected = std::fs::canonicalize(&file).unwrap();

        let dotted = dir.path().join(".").join("libfake.so");
        assert_eq!(resolver.resolve(&dotted), expected);

        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        assert_eq!(resolver.resolve(Path::new("fake")), expected);
    }

    #[test]
    fn test_symbol_address_display() {
        assert_eq!(SymbolAddress::new(0x1000).to_string(), "0x1000");
    }
}
