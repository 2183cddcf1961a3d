//! Static datasets
//!
//! Static datasets are declared when the cache is built, loaded eagerly, and
//! live until the cache closes. They are never subject to invalidation or
//! dismissal, and the participant-capable ones join every transaction context.

use std::collections::BTreeMap;
use std::sync::Arc;
use strata_core::{same_instance, Dataset, DatasetKey, StrataResult, TransactionParticipant};
use tracing::{debug, warn};

/// Permanent datasets of one cache
#[derive(Default)]
pub struct StaticDatasets {
    datasets: BTreeMap<DatasetKey, Arc<dyn Dataset>>,
    participants: Vec<Arc<dyn TransactionParticipant>>,
}

impl StaticDatasets {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every key through `load`, failing on the first error
    ///
    /// Datasets loaded before the failure are closed again.
    ///
    /// # Errors
    ///
    /// Returns the first load error.
    pub fn load<I, F>(keys: I, mut load: F) -> StrataResult<Self>
    where
        I: IntoIterator<Item = DatasetKey>,
        F: FnMut(&DatasetKey) -> StrataResult<Arc<dyn Dataset>>,
    {
        let mut statics = Self::new();
        for key in keys {
            match load(&key) {
                Ok(dataset) => statics.insert(key, dataset),
                Err(e) => {
                    statics.close_all();
                    return Err(e);
                }
            }
        }
        Ok(statics)
    }

    fn insert(&mut self, key: DatasetKey, dataset: Arc<dyn Dataset>) {
        if let Some(participant) = Arc::clone(&dataset).into_participant() {
            self.participants.push(participant);
        }
        debug!(target: "strata::cache", key = %key, "Loaded static dataset");
        self.datasets.insert(key, dataset);
    }

    /// Static dataset for `key`
    pub fn get(&self, key: &DatasetKey) -> Option<&Arc<dyn Dataset>> {
        self.datasets.get(key)
    }

    /// Whether this exact instance is a static dataset
    pub fn contains_instance<T: ?Sized>(&self, handle: &Arc<T>) -> bool {
        self.datasets.values().any(|dataset| same_instance(dataset, handle))
    }

    /// Participant-capable static datasets
    pub fn participants(&self) -> &[Arc<dyn TransactionParticipant>] {
        &self.participants
    }

    /// Keys of all static datasets
    pub fn keys(&self) -> impl Iterator<Item = &DatasetKey> {
        self.datasets.keys()
    }

    /// Number of static datasets
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    /// Whether there are no static datasets
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Close and drop every static dataset
    ///
    /// Returns one message per failed close.
    pub fn close_all(&mut self) -> Vec<String> {
        self.participants.clear();
        let mut failures = Vec::new();
        for (key, dataset) in std::mem::take(&mut self.datasets) {
            if let Err(e) = dataset.close() {
                warn!(target: "strata::cache", key = %key, error = %e, "Error closing static dataset");
                failures.push(format!("static dataset '{}': {}", key, e));
            }
        }
        failures
    }
}
