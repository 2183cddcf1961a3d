//! Loading cache of dynamically requested datasets
//!
//! `ResourceCache` holds at most one live dataset per `DatasetKey`. Entries
//! are created on first request through the `DatasetLoader` and live until
//! they are invalidated, either by key, by instance, or all at once.
//! Invalidation closes the dataset synchronously. A failed close is logged
//! and never reaches the caller of the invalidation.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use strata_core::{same_instance, Dataset, DatasetKey, MetricsContext, StrataError, StrataResult};
use tracing::{debug, warn};

use crate::instantiator::DatasetInstantiator;

/// Metrics tag under which metered datasets report
pub const DATASET_METRICS_TAG: &str = "dataset";

/// Counters for one cache instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests served from the cache
    pub hits: u64,
    /// Requests that loaded a new entry
    pub misses: u64,
    /// Loads that bypassed the cache
    pub bypass_loads: u64,
    /// Entries released
    pub releases: u64,
    /// Releases whose close failed
    pub release_failures: u64,
}

/// Instantiates datasets and wires their metrics
pub struct DatasetLoader {
    instantiator: Box<dyn DatasetInstantiator>,
    namespace: String,
    metrics: Option<Arc<dyn MetricsContext>>,
}

impl DatasetLoader {
    /// Create a loader for `namespace`
    pub fn new(
        instantiator: Box<dyn DatasetInstantiator>,
        namespace: impl Into<String>,
        metrics: Option<Arc<dyn MetricsContext>>,
    ) -> Self {
        Self {
            instantiator,
            namespace: namespace.into(),
            metrics,
        }
    }

    /// Namespace passed to the instantiator
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Instantiate the dataset for `key`
    ///
    /// # Errors
    ///
    /// Returns `Instantiation` if the instantiator fails or finds nothing.
    pub fn load(&self, key: &DatasetKey) -> StrataResult<Arc<dyn Dataset>> {
        let dataset = self
            .instantiator
            .load(&self.namespace, key.name(), key.arguments())
            .map_err(|e| StrataError::instantiation(key.name(), e))?
            .ok_or_else(|| StrataError::dataset_not_found(key.name()))?;

        if let (Some(metrics), Some(metered)) = (&self.metrics, dataset.as_metered()) {
            metered.set_metrics_collector(metrics.child(DATASET_METRICS_TAG, key.name()));
        }
        Ok(dataset)
    }

    /// Release the instantiator's own resources
    pub fn close(&self) -> StrataResult<()> {
        self.instantiator.close()
    }
}

/// Cache of live datasets, one per key
pub struct ResourceCache {
    loader: DatasetLoader,
    entries: FxHashMap<DatasetKey, Arc<dyn Dataset>>,
    stats: CacheStats,
}

impl ResourceCache {
    /// Create an empty cache backed by `loader`
    pub fn new(loader: DatasetLoader) -> Self {
        Self {
            loader,
            entries: FxHashMap::default(),
            stats: CacheStats::default(),
        }
    }

    /// Loader backing this cache
    pub fn loader(&self) -> &DatasetLoader {
        &self.loader
    }

    /// Dataset for `key`
    ///
    /// With `bypass`, a fresh instance is loaded and handed to the caller
    /// without being stored. Otherwise the cached instance is returned, loading
    /// and inserting it first if needed. A failed load inserts nothing.
    pub fn get(&mut self, key: &DatasetKey, bypass: bool) -> StrataResult<Arc<dyn Dataset>> {
        if bypass {
            let dataset = self.loader.load(key)?;
            self.stats.bypass_loads += 1;
            debug!(target: "strata::cache", key = %key, "Loaded dataset bypassing cache");
            return Ok(dataset);
        }

        if let Some(existing) = self.entries.get(key) {
            self.stats.hits += 1;
            return Ok(Arc::clone(existing));
        }

        let dataset = self.loader.load(key)?;
        self.stats.misses += 1;
        self.entries.insert(key.clone(), Arc::clone(&dataset));
        debug!(target: "strata::cache", key = %key, kind = dataset.type_name(), "Loaded dataset into cache");
        Ok(dataset)
    }

    /// Cached instance for `key`, without loading
    pub fn peek(&self, key: &DatasetKey) -> Option<&Arc<dyn Dataset>> {
        self.entries.get(key)
    }

    /// Key of the entry holding this exact instance
    ///
    /// Linear scan; the cache is expected to stay small.
    pub fn key_of<T: ?Sized>(&self, handle: &Arc<T>) -> Option<DatasetKey> {
        self.entries
            .iter()
            .find(|(_, dataset)| same_instance(dataset, handle))
            .map(|(key, _)| key.clone())
    }

    /// Whether this exact instance is cached
    pub fn contains_instance<T: ?Sized>(&self, handle: &Arc<T>) -> bool {
        self.entries.values().any(|dataset| same_instance(dataset, handle))
    }

    /// Remove and close the entry for `key`
    ///
    /// Returns whether an entry was removed.
    pub fn invalidate(&mut self, key: &DatasetKey) -> bool {
        match self.entries.remove(key) {
            Some(dataset) => {
                self.release(key, &dataset);
                true
            }
            None => false,
        }
    }

    /// Remove and close the entry holding this exact instance
    ///
    /// Returns whether an entry was removed.
    pub fn invalidate_instance<T: ?Sized>(&mut self, handle: &Arc<T>) -> bool {
        match self.key_of(handle) {
            Some(key) => self.invalidate(&key),
            None => false,
        }
    }

    /// Remove and close every entry
    ///
    /// Every entry is closed even if some closes fail. Returns one message
    /// per failed close.
    pub fn invalidate_all(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        let entries: Vec<_> = self.entries.drain().collect();
        for (key, dataset) in entries {
            if let Some(e) = self.release(&key, &dataset) {
                failures.push(e.to_string());
            }
        }
        failures
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counters since construction
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn release(&mut self, key: &DatasetKey, dataset: &Arc<dyn Dataset>) -> Option<StrataError> {
        self.stats.releases += 1;
        match dataset.close() {
            Ok(()) => {
                debug!(target: "strata::cache", key = %key, "Released dataset");
                None
            }
            Err(e) => {
                self.stats.release_failures += 1;
                warn!(target: "strata::cache", key = %key, kind = dataset.type_name(), error = %e, "Error closing dataset");
                Some(StrataError::release(key.to_string(), e.to_string()))
            }
        }
    }
}
