//! Core types and traits for the Strata dataset cache
//!
//! This crate defines the foundational types used throughout the system:
//! - DatasetKey: Identity of a cacheable dataset (name + arguments)
//! - Dataset / TransactionParticipant / Closeable: Capability traits
//! - MetricsContext / MeteredDataset: Metrics hook for loaded datasets
//! - Runtime argument scoping for per-dataset arguments
//! - Error: Error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arguments;
pub mod error;
pub mod key;
pub mod traits;

pub use arguments::{scoped_arguments, DATASET_SCOPE, WILDCARD};
pub use error::{StrataError, StrataResult};
pub use key::{Arguments, DatasetKey};
pub use traits::{
    same_instance, AsAny, Closeable, Dataset, MeteredDataset, MetricsContext, Transaction,
    TransactionParticipant,
};
