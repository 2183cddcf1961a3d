//! Transaction layer for the dataset cache
//!
//! This crate provides:
//! - TransactionCoordinator: Interface to the service that issues, validates
//!   and commits transactions
//! - InMemoryCoordinator: Local coordinator with change-set conflict detection
//! - TransactionContext: Participant set for one in-flight transaction, with a
//!   queue of releases deferred until the transaction is over

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod coordinator;

pub use context::{TransactionContext, TransactionStatus};
pub use coordinator::{CoordinatorMetrics, InMemoryCoordinator, TransactionCoordinator};
