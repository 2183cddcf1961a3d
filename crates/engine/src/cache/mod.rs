//! Dataset cache bound to one execution context
//!
//! `DatasetCache` composes four parts:
//!
//! - `ResourceCache`: at most one live dataset per key, loaded on demand
//! - `ParticipantTracker`: which cached datasets are in use and transactional
//! - `StaticDatasets`: datasets loaded at construction that join every context
//! - `ExtraParticipants`: caller-supplied participants with no key
//!
//! ## Transaction Contexts
//!
//! At most one `TransactionContext` is open per cache. Opening a new one
//! cleans up the previous one first. Every context is seeded with the static
//! participants, the extras, and the tracked participants, and any
//! participant loaded while it is open joins it immediately.
//!
//! ## Dismissal
//!
//! Dismissing a transactional dataset while a context is open does not
//! release it: the dataset stays in the context until the context is
//! cleaned up, then it is closed. With no open context, or for a dataset
//! that cannot take part in transactions, the release is immediate.
//!
//! ## Thread Safety
//!
//! Single-owner. Every mutation takes `&mut self` and nothing is locked
//! internally. Use one cache per concurrent unit of work.

mod config;
mod extras;
mod resources;
mod statics;
mod tracker;

pub use config::{CacheConfig, DEFAULT_NAMESPACE};
pub use extras::ExtraParticipants;
pub use resources::{CacheStats, DatasetLoader, ResourceCache, DATASET_METRICS_TAG};
pub use statics::StaticDatasets;
pub use tracker::ParticipantTracker;

use std::sync::Arc;
use strata_concurrency::{TransactionContext, TransactionCoordinator};
use strata_core::{
    same_instance, scoped_arguments, Arguments, Dataset, DatasetKey, MetricsContext, StrataError,
    StrataResult, TransactionParticipant,
};
use tracing::{debug, info, warn};

use crate::instantiator::DatasetInstantiator;

/// Transaction-aware dataset cache
pub struct DatasetCache {
    resources: ResourceCache,
    tracker: ParticipantTracker,
    statics: StaticDatasets,
    extras: ExtraParticipants,
    coordinator: Arc<dyn TransactionCoordinator>,
    runtime_arguments: Arguments,
    context: Option<TransactionContext>,
    closed: bool,
}

impl DatasetCache {
    /// Create a cache and load its static datasets
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or any static dataset fails
    /// to load. Nothing stays open in that case.
    pub fn new(
        instantiator: Box<dyn DatasetInstantiator>,
        coordinator: Arc<dyn TransactionCoordinator>,
        config: CacheConfig,
        metrics: Option<Arc<dyn MetricsContext>>,
    ) -> StrataResult<Self> {
        config.validate()?;
        let CacheConfig {
            namespace,
            runtime_arguments,
            static_datasets,
        } = config;

        let loader = DatasetLoader::new(instantiator, namespace, metrics);
        let keys: Vec<DatasetKey> = static_datasets
            .iter()
            .map(|(name, arguments)| {
                DatasetKey::new(name.clone(), scoped_arguments(name, &runtime_arguments, arguments))
            })
            .collect();

        let statics = match StaticDatasets::load(keys, |key| loader.load(key)) {
            Ok(statics) => statics,
            Err(e) => {
                if let Err(close_err) = loader.close() {
                    warn!(target: "strata::cache", error = %close_err, "Error closing instantiator after failed construction");
                }
                return Err(e);
            }
        };

        info!(
            target: "strata::cache",
            namespace = %loader.namespace(),
            static_datasets = statics.len(),
            "Dataset cache created"
        );

        Ok(Self {
            resources: ResourceCache::new(loader),
            tracker: ParticipantTracker::new(),
            statics,
            extras: ExtraParticipants::new(),
            coordinator,
            runtime_arguments,
            context: None,
            closed: false,
        })
    }

    /// Namespace passed to the instantiator
    pub fn namespace(&self) -> &str {
        self.resources.loader().namespace()
    }

    /// Key for `name` with runtime arguments scoped in and `arguments` on top
    pub fn key_for(&self, name: &str, arguments: &Arguments) -> DatasetKey {
        DatasetKey::new(name, scoped_arguments(name, &self.runtime_arguments, arguments))
    }

    /// Dataset `name` with runtime arguments only
    ///
    /// # Errors
    ///
    /// See [`DatasetCache::get`].
    pub fn get_dataset<T: Dataset>(&mut self, name: &str) -> StrataResult<Arc<T>> {
        self.get_dataset_with(name, &Arguments::new())
    }

    /// Dataset `name` with explicit arguments on top of the runtime arguments
    ///
    /// # Errors
    ///
    /// See [`DatasetCache::get`].
    pub fn get_dataset_with<T: Dataset>(
        &mut self,
        name: &str,
        arguments: &Arguments,
    ) -> StrataResult<Arc<T>> {
        let key = self.key_for(name, arguments);
        self.get(&key, false)
    }

    /// Typed dataset for `key`
    ///
    /// The type is checked before the dataset is tracked, so a mismatch
    /// leaves no participant behind.
    ///
    /// # Errors
    ///
    /// - `Instantiation` if the dataset cannot be loaded
    /// - `TypeMismatch` if the dataset is not a `T`
    /// - `InternalConsistency` if the cache and tracker have diverged
    /// - `InvalidState` if the cache is closed
    pub fn get<T: Dataset>(&mut self, key: &DatasetKey, bypass: bool) -> StrataResult<Arc<T>> {
        let dataset = self.fetch(key, bypass)?;
        let typed = Arc::clone(&dataset)
            .into_any_arc()
            .downcast::<T>()
            .map_err(|_| StrataError::TypeMismatch {
                name: key.name().to_string(),
                key: key.to_string(),
                actual: dataset.type_name().to_string(),
            })?;
        if !bypass {
            self.register(key, &dataset)?;
        }
        Ok(typed)
    }

    /// Untyped dataset for `key`
    ///
    /// With `bypass`, a fresh instance is returned that the cache neither
    /// stores nor tracks; the caller owns it.
    ///
    /// # Errors
    ///
    /// Same as [`DatasetCache::get`], except `TypeMismatch`.
    pub fn get_resource(&mut self, key: &DatasetKey, bypass: bool) -> StrataResult<Arc<dyn Dataset>> {
        let dataset = self.fetch(key, bypass)?;
        if !bypass {
            self.register(key, &dataset)?;
        }
        Ok(dataset)
    }

    fn fetch(&mut self, key: &DatasetKey, bypass: bool) -> StrataResult<Arc<dyn Dataset>> {
        self.ensure_open()?;
        if !bypass {
            if let Some(dataset) = self.statics.get(key) {
                return Ok(Arc::clone(dataset));
            }
        }
        self.resources.get(key, bypass)
    }

    fn register(&mut self, key: &DatasetKey, dataset: &Arc<dyn Dataset>) -> StrataResult<()> {
        // static participants are already in every context
        if self.statics.get(key).is_some() {
            return Ok(());
        }
        let Some(participant) = Arc::clone(dataset).into_participant() else {
            return Ok(());
        };
        if self.tracker.track(key, Arc::clone(&participant))? {
            if let Some(ctx) = &self.context {
                if ctx.add_participant(participant) {
                    debug!(target: "strata::txn", key = %key, "Enrolled dataset in open context");
                }
            }
        }
        Ok(())
    }

    /// Dismiss a typed dataset handle
    pub fn dismiss<T: Dataset>(&mut self, dataset: &Arc<T>) {
        let handle: Arc<dyn Dataset> = dataset.clone();
        self.dismiss_resource(&handle);
    }

    /// Dismiss a dataset
    ///
    /// Static datasets are refused. The dataset stops being tracked right
    /// away, so no later context includes it. It is released when the open
    /// context is cleaned up if it takes part in transactions, and right
    /// away otherwise.
    pub fn dismiss_resource(&mut self, dataset: &Arc<dyn Dataset>) {
        if self.statics.contains_instance(dataset) {
            warn!(target: "strata::cache", kind = dataset.type_name(), "Refusing to dismiss static dataset");
            return;
        }

        self.tracker.untrack_instance(dataset);

        let participant = Arc::clone(dataset).into_participant();
        if let (Some(ctx), Some(participant)) = (self.context.as_ref(), participant) {
            if self.resources.contains_instance(dataset) {
                debug!(target: "strata::cache", participant = %participant.participant_name(), "Deferring release until context cleanup");
                ctx.dismiss_after_tx(participant);
                return;
            }
        }
        self.dismiss_safely(dataset);
    }

    fn dismiss_safely(&mut self, dataset: &Arc<dyn Dataset>) {
        if !self.resources.invalidate_instance(dataset) {
            warn!(target: "strata::cache", kind = dataset.type_name(), "Dismissed dataset was not acquired through this cache");
        }
    }

    /// Open a new transaction context, cleaning up the previous one
    ///
    /// A transaction still in progress in the previous context is aborted.
    /// Deferred releases of the previous context run before the new one is
    /// seeded.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the cache is closed.
    pub fn new_transaction_context(&mut self) -> StrataResult<TransactionContext> {
        self.ensure_open()?;
        if let Some(previous) = self.context.take() {
            self.release_deferred(&previous);
        }

        let ctx = TransactionContext::new(Arc::clone(&self.coordinator));
        for participant in self
            .statics
            .participants()
            .iter()
            .chain(self.tracker.participants())
            .chain(self.extras.iter())
        {
            ctx.add_participant(Arc::clone(participant));
        }
        debug!(target: "strata::txn", participants = ctx.participants().len(), "Opened transaction context");

        self.context = Some(ctx.clone());
        Ok(ctx)
    }

    /// Clean up the open context, running its deferred releases
    ///
    /// A no-op when no context is open.
    pub fn dismiss_transaction_context(&mut self) {
        if let Some(ctx) = self.context.take() {
            self.release_deferred(&ctx);
            debug!(target: "strata::txn", "Dismissed transaction context");
        }
    }

    fn release_deferred(&mut self, ctx: &TransactionContext) {
        let resources = &mut self.resources;
        let tracker = &mut self.tracker;
        ctx.cleanup(|participant| {
            tracker.untrack_instance(participant);
            if !resources.invalidate_instance(participant) {
                debug!(target: "strata::cache", participant = %participant.participant_name(), "Deferred dataset was already released");
            }
        });
    }

    /// The open transaction context
    pub fn transaction_context(&self) -> Option<&TransactionContext> {
        self.context.as_ref()
    }

    /// Add a participant that belongs to no dataset
    ///
    /// It joins the open context right away and every later one, until removed.
    pub fn add_extra_participant(&mut self, participant: Arc<dyn TransactionParticipant>) {
        if self.extras.insert(Arc::clone(&participant)) {
            if let Some(ctx) = &self.context {
                ctx.add_participant(participant);
            }
        }
    }

    /// Remove an extra participant from the set and from the open context
    ///
    /// The participant leaves the set in every case, so no later context
    /// includes it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while the open context has a transaction in
    /// progress. The participant then stays in that context until it ends.
    pub fn remove_extra_participant(
        &mut self,
        participant: &Arc<dyn TransactionParticipant>,
    ) -> StrataResult<()> {
        if !self.extras.remove(participant) {
            return Ok(());
        }
        if let Some(ctx) = &self.context {
            ctx.remove_participant(participant)?;
        }
        Ok(())
    }

    /// Participants the cache knows about: statics, extras, tracked
    ///
    /// Empty when no context is open.
    pub fn participants(&self) -> Vec<Arc<dyn TransactionParticipant>> {
        if self.context.is_none() {
            return Vec::new();
        }
        let mut participants: Vec<Arc<dyn TransactionParticipant>> = Vec::new();
        for participant in self
            .statics
            .participants()
            .iter()
            .chain(self.extras.iter())
            .chain(self.tracker.participants())
        {
            if !participants.iter().any(|p| same_instance(p, participant)) {
                participants.push(Arc::clone(participant));
            }
        }
        participants
    }

    /// Participant-capable static datasets
    pub fn static_participants(&self) -> &[Arc<dyn TransactionParticipant>] {
        self.statics.participants()
    }

    /// Run `f` in a transaction
    ///
    /// Opens a context and starts it, runs `f`, then commits if `f`
    /// succeeded and aborts if it failed. The context is dismissed in every
    /// case, so releases deferred inside `f` run before this returns.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or the commit error.
    pub fn execute<R, F>(&mut self, f: F) -> StrataResult<R>
    where
        F: FnOnce(&mut Self) -> StrataResult<R>,
    {
        let ctx = self.new_transaction_context()?;
        if let Err(e) = ctx.start() {
            self.dismiss_transaction_context();
            return Err(e);
        }

        let outcome = match f(self) {
            Ok(value) => ctx.finish().map(|()| value),
            Err(e) => {
                if let Err(abort_err) = ctx.abort_with(e.to_string()) {
                    warn!(target: "strata::txn", error = %abort_err, "Abort after failed closure did not complete");
                }
                Err(e)
            }
        };

        self.dismiss_transaction_context();
        outcome
    }

    /// Hard reset
    ///
    /// Discards the open context without running its deferred releases,
    /// forgets every tracked participant, and releases every cached dataset.
    /// Static datasets and extras are kept. Release failures are logged.
    pub fn invalidate(&mut self) {
        let failures = self.reset();
        if !failures.is_empty() {
            warn!(target: "strata::cache", failures = failures.len(), "Invalidation finished with release failures");
        }
    }

    fn reset(&mut self) -> Vec<String> {
        if let Some(ctx) = self.context.take() {
            ctx.discard();
        }
        self.tracker.clear();
        self.resources.invalidate_all()
    }

    /// Close the cache
    ///
    /// Closes the closeable extras, invalidates, closes the static datasets,
    /// then closes the instantiator. Every step runs even if earlier ones
    /// failed. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `CleanupFailed` listing every failed close.
    pub fn close(&mut self) -> StrataResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut failures = self.extras.close_all();
        failures.extend(self.reset());
        failures.extend(self.statics.close_all());
        if let Err(e) = self.resources.loader().close() {
            warn!(target: "strata::cache", error = %e, "Error closing instantiator");
            failures.push(format!("instantiator: {}", e));
        }

        if failures.is_empty() {
            info!(target: "strata::cache", namespace = %self.namespace(), "Dataset cache closed");
            Ok(())
        } else {
            Err(StrataError::CleanupFailed { failures })
        }
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of cached, non-static datasets
    pub fn cached_len(&self) -> usize {
        self.resources.len()
    }

    /// Cache counters
    pub fn stats(&self) -> CacheStats {
        self.resources.stats()
    }

    fn ensure_open(&self) -> StrataResult<()> {
        if self.closed {
            return Err(StrataError::invalid_state("dataset cache is closed"));
        }
        Ok(())
    }
}

impl Drop for DatasetCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(target: "strata::cache", error = %e, "Errors closing dataset cache on drop");
        }
    }
}
