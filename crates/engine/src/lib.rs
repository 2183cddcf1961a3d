//! Dataset cache engine
//!
//! This crate composes the lower layers into the cache callers use:
//! - DatasetCache: Loading cache of datasets bound to one execution context
//! - Transaction context lifecycle: at most one open context per cache,
//!   seeded with every participant the cache knows about
//! - Dismissal: immediate release, or deferred until the open context ends
//! - CacheConfig: Construction-time configuration (TOML)
//!
//! The cache is single-owner: it takes `&mut self` for every mutation and
//! performs no internal locking.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod instantiator;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::{
    CacheConfig, CacheStats, DatasetCache, DatasetLoader, ExtraParticipants, ParticipantTracker,
    ResourceCache, StaticDatasets, DATASET_METRICS_TAG, DEFAULT_NAMESPACE,
};
pub use instantiator::DatasetInstantiator;
