//! Strata datasets - transaction-aware dataset cache
//!
//! A per-execution-context cache that instantiates named, parameterized
//! datasets on demand, keeps at most one live instance per key, and enrols
//! the transactional ones in the open transaction context.
//!
//! # Quick Start
//!
//! ```ignore
//! use strata_datasets::{CacheConfig, DatasetCache, InMemoryCoordinator};
//!
//! let mut cache = DatasetCache::new(
//!     Box::new(my_instantiator),
//!     Arc::new(InMemoryCoordinator::new()),
//!     CacheConfig::for_namespace("analytics"),
//!     None,
//! )?;
//!
//! cache.execute(|cache| {
//!     let orders = cache.get_dataset::<OrdersTable>("orders")?;
//!     orders.append(row)?;
//!     Ok(())
//! })?;
//! ```
//!
//! # Architecture
//!
//! - `strata-core`: keys, capability traits, errors, argument scoping
//! - `strata-concurrency`: transaction contexts and coordinators
//! - `strata-engine`: the cache itself and its configuration

pub use strata_concurrency::{
    CoordinatorMetrics, InMemoryCoordinator, TransactionContext, TransactionCoordinator,
    TransactionStatus,
};
pub use strata_core::{
    same_instance, scoped_arguments, Arguments, Closeable, Dataset, DatasetKey, MeteredDataset,
    MetricsContext, StrataError, StrataResult, Transaction, TransactionParticipant,
};
pub use strata_engine::{CacheConfig, CacheStats, DatasetCache, DatasetInstantiator};
