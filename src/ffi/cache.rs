//! Stub Cache
//!
//! Maps each [`SignatureKey`] to its [`InvocationStub`]. Stubs are built at
//! most once per key and never evicted; the key space is one entry per call
//! shape the program actually uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::error::FfiResult;
use super::signature::SignatureKey;
use super::stub::InvocationStub;

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total cache lookups
    pub lookups: u64,
    /// Lookups answered without building
    pub hits: u64,
    /// Lookups that found no stub on the fast path
    pub misses: u64,
    /// Stubs actually built
    pub builds: u64,
    /// Number of cached stubs
    pub entries: usize,
}

impl CacheStats {
    /// Get hit rate as percentage
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            (self.hits as f64 / self.lookups as f64) * 100.0
        }
    }
}

#[derive(Default)]
struct Counters {
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
}

/// Signature-keyed cache of invocation stubs
pub struct StubCache {
    stubs: RwLock<HashMap<SignatureKey, Arc<InvocationStub>>>,
    build_lock: Mutex<()>,
    strict_conventions: bool,
    counters: Counters,
}

impl StubCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::with_strict_conventions(false)
    }

    /// Create an empty cache, rejecting conventions the target cannot honour
    pub fn with_strict_conventions(strict_conventions: bool) -> Self {
        Self {
            stubs: RwLock::new(HashMap::new()),
            build_lock: Mutex::new(()),
            strict_conventions,
            counters: Counters::default(),
        }
    }

    /// Get the stub for `key`, building it on first use
    pub fn get_stub(&self, key: &SignatureKey) -> FfiResult<Arc<InvocationStub>> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);

        if let Some(stub) = self.stubs.read().get(key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(stub));
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let _guard = self.build_lock.lock();
        if let Some(stub) = self.stubs.read().get(key) {
            return Ok(Arc::clone(stub));
        }

        let stub = Arc::new(InvocationStub::build(key.clone(), self.strict_conventions)?);
        self.counters.builds.fetch_add(1, Ordering::Relaxed);
        debug!(signature = %key, "built invocation stub");

        self.stubs.write().insert(key.clone(), Arc::clone(&stub));
        Ok(stub)
    }

    pub fn contains(&self, key: &SignatureKey) -> bool {
        self.stubs.read().contains_key(key)
    }

    /// Number of cached stubs
    pub fn len(&self) -> usize {
        self.stubs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.read().is_empty()
    }

    /// Snapshot of the cache counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            builds: self.counters.builds.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl Default for StubCache {
    fn default() -> Self {
        Self::new()
    }
}
