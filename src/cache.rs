//! Per-cycle value caches.
//!
//! Every cycle gets one [`ComputationCache`] per calculation configuration, handed out by a
//! [`ComputationCacheSource`] keyed by `(cycle, configuration)`. Jobs of the cycle write into
//! it; once the cycle completes the cache is sealed and becomes read-only, so the next cycle
//! can read it as its "previous" cache without coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use papaya::HashMap;

use crate::error::CacheError;
use crate::id::CycleId;
use crate::value::{ComputedValue, Value, ValueSpecification};

/// Thread-safe value store for one cycle and one calculation configuration.
///
/// Uses papaya's lock-free HashMap internally, so concurrently completing jobs can write
/// without contending on a lock.
pub struct ComputationCache {
    cycle: CycleId,
    configuration: Arc<str>,
    shared: HashMap<ValueSpecification, Value, ahash::RandomState>,
    private: HashMap<ValueSpecification, Value, ahash::RandomState>,
    sealed: AtomicBool,
}

impl std::fmt::Debug for ComputationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationCache")
            .field("cycle", &self.cycle)
            .field("configuration", &self.configuration)
            .field("shared", &self.shared.len())
            .field("private", &self.private.len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<ComputationCache>();
    assert_sync::<ComputationCacheSource>();
}

impl ComputationCache {
    /// Create an empty cache.
    pub fn new(cycle: CycleId, configuration: impl Into<Arc<str>>) -> Self {
        Self {
            cycle,
            configuration: configuration.into(),
            shared: HashMap::with_hasher(ahash::RandomState::new()),
            private: HashMap::with_hasher(ahash::RandomState::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// The cycle owning this cache.
    pub fn cycle_id(&self) -> CycleId {
        self.cycle
    }

    /// The calculation configuration this cache belongs to.
    pub fn configuration(&self) -> &Arc<str> {
        &self.configuration
    }

    fn check_writable(&self) -> Result<(), CacheError> {
        if self.is_sealed() {
            return Err(CacheError::Sealed {
                cycle: self.cycle,
                configuration: self.configuration.clone(),
            });
        }
        Ok(())
    }

    /// Store a value visible to every reader of this cache.
    pub fn put_shared_value(&self, value: ComputedValue) -> Result<(), CacheError> {
        self.check_writable()?;
        self.shared.pin().insert(value.specification, value.value);
        Ok(())
    }

    /// Store several shared values.
    pub fn put_shared_values(
        &self,
        values: impl IntoIterator<Item = ComputedValue>,
    ) -> Result<(), CacheError> {
        self.check_writable()?;
        let pinned = self.shared.pin();
        for value in values {
            pinned.insert(value.specification, value.value);
        }
        Ok(())
    }

    /// Store a value only needed locally, e.g. an intermediate nobody downstream consumes.
    ///
    /// Private values are still readable through this cache instance.
    pub fn put_private_value(&self, value: ComputedValue) -> Result<(), CacheError> {
        self.check_writable()?;
        self.private.pin().insert(value.specification, value.value);
        Ok(())
    }

    /// Look up a value.
    pub fn get_value(&self, specification: &ValueSpecification) -> Option<Value> {
        if let Some(value) = self.private.pin().get(specification) {
            return Some(value.clone());
        }
        self.shared.pin().get(specification).cloned()
    }

    /// Look up several values, preserving order.
    pub fn get_values<'a>(
        &self,
        specifications: impl IntoIterator<Item = &'a ValueSpecification>,
    ) -> Vec<(ValueSpecification, Option<Value>)> {
        specifications
            .into_iter()
            .map(|spec| (spec.clone(), self.get_value(spec)))
            .collect()
    }

    /// Returns true if a value is stored.
    pub fn contains(&self, specification: &ValueSpecification) -> bool {
        self.private.pin().contains_key(specification)
            || self.shared.pin().contains_key(specification)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.shared.len() + self.private.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the cache read-only. Idempotent.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Returns true once the owning cycle has completed.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

/// Hands out caches keyed by `(cycle, configuration)`.
pub struct ComputationCacheSource {
    caches: HashMap<(CycleId, Arc<str>), Arc<ComputationCache>, ahash::RandomState>,
}

impl Default for ComputationCacheSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ComputationCacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationCacheSource")
            .field("caches", &self.caches.len())
            .finish()
    }
}

impl ComputationCacheSource {
    /// Create an empty cache source.
    pub fn new() -> Self {
        Self {
            caches: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Get the cache for a cycle and configuration, creating it on first use.
    pub fn get_or_create_cache(
        &self,
        cycle: CycleId,
        configuration: &Arc<str>,
    ) -> Arc<ComputationCache> {
        let pinned = self.caches.pin();
        pinned
            .get_or_insert_with((cycle, configuration.clone()), || {
                Arc::new(ComputationCache::new(cycle, configuration.clone()))
            })
            .clone()
    }

    /// Get an existing cache.
    pub fn cache(&self, cycle: CycleId, configuration: &Arc<str>) -> Option<Arc<ComputationCache>> {
        self.caches
            .pin()
            .get(&(cycle, configuration.clone()))
            .cloned()
    }

    /// Drop every cache of a cycle. Returns how many were released.
    ///
    /// Holders of an `Arc` keep their cache alive; it just can no longer be looked up.
    pub fn release_caches(&self, cycle: CycleId) -> usize {
        let pinned = self.caches.pin();
        let keys: Vec<_> = pinned
            .keys()
            .filter(|(owner, _)| *owner == cycle)
            .cloned()
            .collect();
        keys.iter()
            .filter(|key| pinned.remove(*key).is_some())
            .count()
    }

    /// Cycles that currently own caches.
    pub fn cycle_ids(&self) -> Vec<CycleId> {
        let mut ids: Vec<CycleId> = self.caches.pin().keys().map(|(cycle, _)| *cycle).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
