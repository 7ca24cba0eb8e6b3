//! Library Registry
//!
//! Process-wide map from registry key to open [`LibraryHandle`]. A library is
//! opened at most once per key; unloading removes the handle and closes the
//! image as one step.
//!
//! Opening and closing take a lock per key, so a slow initialiser in one
//! library does not hold up first loads of another. A key whose previous
//! image is retired but still mapped by running calls refuses to load until
//! that image is closed: the platform loader would otherwise hand back the
//! old image under the new handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::error::{FfiError, FfiResult};
use super::loader::{LibraryHandle, LibraryResolver};

/// What `unload` does when the library is not loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnloadPolicy {
    /// Fail with `LibraryNotLoaded`
    #[default]
    Strict,
    /// Treat as a no-op
    IgnoreMissing,
}

/// Central registry of open native libraries
pub struct LibraryRegistry {
    resolver: LibraryResolver,
    cache_symbols: bool,
    libraries: RwLock<HashMap<PathBuf, Arc<LibraryHandle>>>,
    /// One lock per key, serializing opening and closing of that key
    key_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    /// Close flags of retired handles whose close waits on running calls
    closing: Mutex<HashMap<PathBuf, Arc<AtomicBool>>>,
}

impl LibraryRegistry {
    /// Create a registry searching the platform default directories
    pub fn new() -> Self {
        Self::with_resolver(LibraryResolver::with_system_paths(Vec::new()), true)
    }

    /// Create a registry with explicit search rules
    pub fn with_resolver(resolver: LibraryResolver, cache_symbols: bool) -> Self {
        Self {
            resolver,
            cache_symbols,
            libraries: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            closing: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolver(&self) -> &LibraryResolver {
        &self.resolver
    }

    /// Get the handle for `path`, opening the library on first use
    ///
    /// Fails with `LibraryLoadFailed` while an earlier image under the same
    /// key has been unloaded but is still held by a running call.
    pub fn load(&self, path: impl AsRef<Path>) -> FfiResult<Arc<LibraryHandle>> {
        let key = self.resolver.resolve(path.as_ref());

        if let Some(handle) = self.libraries.read().get(&key) {
            return Ok(Arc::clone(handle));
        }

        let lock = self.key_lock(&key);
        let _guard = lock.lock();
        // Another thread may have opened it while we waited
        if let Some(handle) = self.libraries.read().get(&key) {
            return Ok(Arc::clone(handle));
        }

        if self.close_pending(&key) {
            debug!(path = %key.display(), "refusing to reopen library with a pending close");
            return Err(FfiError::close_pending(&key));
        }

        let handle = Arc::new(LibraryHandle::open(&key, self.cache_symbols)?);
        self.libraries.write().insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Get the handle for `path` if it is loaded
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Arc<LibraryHandle>> {
        let libraries = self.libraries.read();
        self.lookup_key(&libraries, path.as_ref())
            .and_then(|key| libraries.get(&key).cloned())
    }

    /// Remove and close the handle for `path`
    ///
    /// If calls through the handle are still running, closing is deferred
    /// until the last of them returns.
    pub fn unload(&self, path: impl AsRef<Path>, policy: UnloadPolicy) -> FfiResult<()> {
        let path = path.as_ref();
        let key = {
            let libraries = self.libraries.read();
            self.lookup_key(&libraries, path)
        };

        let removed = key.and_then(|key| {
            let lock = self.key_lock(&key);
            let _guard = lock.lock();
            let handle = self.libraries.write().remove(&key)?;
            Some(self.release(key, handle))
        });

        match (removed, policy) {
            (Some(result), _) => result,
            (None, UnloadPolicy::IgnoreMissing) => Ok(()),
            (None, UnloadPolicy::Strict) => Err(FfiError::LibraryNotLoaded(path.to_path_buf())),
        }
    }

    /// Remove and close every handle, returning how many were removed
    ///
    /// Every close is attempted; failures are reported together afterwards.
    /// A load racing this call may leave its library loaded, as if it had
    /// started after the reset.
    pub fn unload_all(&self) -> FfiResult<usize> {
        let drained: Vec<_> = self.libraries.write().drain().collect();
        let count = drained.len();

        let failures: Vec<FfiError> = drained
            .into_iter()
            .filter_map(|(key, handle)| {
                let lock = self.key_lock(&key);
                let _guard = lock.lock();
                self.release(key, handle).err()
            })
            .collect();
        debug!(count, failed = failures.len(), "unloaded all native libraries");

        if failures.is_empty() {
            Ok(count)
        } else {
            Err(FfiError::ResetIncomplete { failures })
        }
    }

    /// Number of loaded libraries
    pub fn len(&self) -> usize {
        self.libraries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.read().is_empty()
    }

    /// Registry keys of every loaded library
    pub fn loaded_paths(&self) -> Vec<PathBuf> {
        self.libraries.read().keys().cloned().collect()
    }

    /// Whether an unloaded image under `path` is still waiting to be closed
    pub fn is_close_pending(&self, path: impl AsRef<Path>) -> bool {
        let key = self.resolver.resolve(path.as_ref());
        self.close_pending(&key) || self.close_pending(path.as_ref())
    }

    /// Find the key `path` is stored under
    ///
    /// The file behind a key may have been removed since it was loaded, in which
    /// case the resolver no longer canonicalises it; the request is then tried
    /// verbatim.
    fn lookup_key(
        &self,
        libraries: &HashMap<PathBuf, Arc<LibraryHandle>>,
        path: &Path,
    ) -> Option<PathBuf> {
        let key = self.resolver.resolve(path);
        if libraries.contains_key(&key) {
            Some(key)
        } else if libraries.contains_key(path) {
            Some(path.to_path_buf())
        } else {
            None
        }
    }

    fn key_lock(&self, key: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock();
        match locks.get(key) {
            Some(lock) => Arc::clone(lock),
            None => {
                let lock = Arc::new(Mutex::new(()));
                locks.insert(key.to_path_buf(), Arc::clone(&lock));
                lock
            }
        }
    }

    /// Check for a deferred close on `key`, forgetting it once it has run
    fn close_pending(&self, key: &Path) -> bool {
        let mut closing = self.closing.lock();
        match closing.get(key) {
            Some(closed) if !closed.load(Ordering::Acquire) => true,
            Some(_) => {
                closing.remove(key);
                false
            }
            None => false,
        }
    }

    /// Retire a removed handle and close it unless a call still holds it
    fn release(&self, key: PathBuf, handle: Arc<LibraryHandle>) -> FfiResult<()> {
        handle.retire();
        let closed = handle.closed_flag();
        match Arc::try_unwrap(handle) {
            Ok(handle) => handle.close(),
            Err(shared) => {
                debug!(
                    path = %shared.path().display(),
                    in_flight = Arc::strong_count(&shared) - 1,
                    "deferring library close until in-flight calls return"
                );
                self.closing.lock().insert(key, closed);
                Ok(())
            }
        }
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::ErrorKind;

    fn empty_registry() -> LibraryRegistry {
        LibraryRegistry::with_resolver(LibraryResolver::new(Vec::new()), true)
    }

    #[test]
    fn test_failed_load_is_not_registered() {
        let registry = empty_registry();
        let err = registry.load("/no/such/dir/libmissing.so").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LibraryLoadFailed);
        assert!(registry.is_empty());
        assert!(registry.get("/no/such/dir/libmissing.so").is_none());
    }

    #[test]
    fn test_unload_missing_strict() {
        let registry = empty_registry();
        let err = registry
            .unload("/no/such/dir/libmissing.so", UnloadPolicy::Strict)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LibraryNotLoaded);
        assert_eq!(err.path(), Some(Path::new("/no/such/dir/libmissing.so")));
    }

    #[test]
    fn test_unload_missing_ignored() {
        let registry = empty_registry();
        assert!(registry
            .unload("/no/such/dir/libmissing.so", UnloadPolicy::IgnoreMissing)
            .is_ok());
    }

    #[test]
    fn test_pending_close_blocks_load_until_closed() {
        let registry = empty_registry();
        let key = PathBuf::from("/no/such/dir/libgone.so");
        let closed = Arc::new(AtomicBool::new(false));
        registry.closing.lock().insert(key.clone(), Arc::clone(&closed));

        assert!(registry.is_close_pending(&key));
        let err = registry.load(&key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LibraryLoadFailed);
        assert!(err.to_string().contains("close pending"), "{}", err);

        closed.store(true, Ordering::Release);
        assert!(!registry.is_close_pending(&key));
        assert!(registry.closing.lock().is_empty());

        // Now the platform loader is asked and fails on its own terms
        let err = registry.load(&key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LibraryLoadFailed);
        assert!(!err.to_string().contains("close pending"), "{}", err);
    }

    #[test]
    fn test_key_locks_are_per_key() {
        let registry = empty_registry();
        let a = registry.key_lock(Path::new("/lib/a.so"));
        let b = registry.key_lock(Path::new("/lib/b.so"));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &registry.key_lock(Path::new("/lib/a.so"))));

        // Holding one key's lock leaves other keys free
        let _held = a.lock();
        assert!(b.try_lock().is_some());
    }

    #[test]
    fn test_unload_all_empty_is_noop() {
        let registry = empty_registry();
        assert_eq!(registry.unload_all().unwrap(), 0);
        assert_eq!(registry.unload_all().unwrap(), 0);
    }
}
