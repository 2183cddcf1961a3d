//! Capability traits for cached datasets
//!
//! A dataset is anything the cache can hold and close. On top of that a
//! dataset may optionally expose further capabilities, discovered at runtime
//! rather than through a type hierarchy:
//!
//! - `TransactionParticipant`: joins the read/write set of a transaction
//! - `MeteredDataset`: accepts a metrics collector after loading
//!
//! The cache compares datasets by *instance*, never by value. Use
//! [`same_instance`] to compare two handles, even when one is seen through
//! `dyn Dataset` and the other through `dyn TransactionParticipant`.

use crate::error::StrataResult;
use std::any::Any;
use std::sync::Arc;

/// Upcast helper so that `dyn Dataset` handles can be downcast to concrete types
///
/// Implemented automatically for every `Send + Sync + 'static` type.
pub trait AsAny: Any + Send + Sync {
    /// Convert an `Arc` handle into an `Arc<dyn Any>` for `Arc::downcast`
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Something that holds resources and must be released explicitly
pub trait Closeable: Send + Sync {
    /// Release underlying resources
    ///
    /// # Errors
    ///
    /// Returns an error if releasing failed. Callers in teardown paths log
    /// and continue.
    fn close(&self) -> StrataResult<()>;
}

/// A live dataset handle owned by the cache
pub trait Dataset: AsAny + Closeable {
    /// Concrete type name, used in diagnostics and type-mismatch errors
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Transaction capability of this dataset, if it has one
    ///
    /// Implementors that participate in transactions return `Some(self)`.
    /// The returned handle must be the same instance as `self`.
    fn into_participant(self: Arc<Self>) -> Option<Arc<dyn TransactionParticipant>> {
        None
    }

    /// Metrics capability of this dataset, if it has one
    fn as_metered(&self) -> Option<&dyn MeteredDataset> {
        None
    }
}

/// Handle for one transaction, as issued by a coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Unique transaction ID
    pub txn_id: u64,
    /// Highest committed transaction ID visible to this transaction
    pub read_pointer: u64,
}

impl Transaction {
    /// Create a transaction handle
    pub fn new(txn_id: u64, read_pointer: u64) -> Self {
        Self {
            txn_id,
            read_pointer,
        }
    }
}

/// Capability to join a transaction's read/write set
///
/// Lifecycle per transaction:
/// 1. `start_tx` when the transaction begins
/// 2. `tx_changes` to report the change set for conflict detection
/// 3. `commit_tx` to persist buffered writes
/// 4. `post_tx_commit` once the coordinator confirmed the commit
///
/// Or `rollback_tx` at any point after `start_tx`.
pub trait TransactionParticipant: Send + Sync {
    /// Name for logging
    fn participant_name(&self) -> String;

    /// Begin participating in `tx`
    fn start_tx(&self, tx: &Transaction);

    /// Change set of the current transaction
    fn tx_changes(&self) -> Vec<Vec<u8>>;

    /// Persist buffered writes; `Ok(false)` means the participant refused
    fn commit_tx(&self) -> StrataResult<bool>;

    /// Called after the coordinator committed the transaction
    fn post_tx_commit(&self);

    /// Undo persisted writes; `Ok(false)` means undo was incomplete
    fn rollback_tx(&self) -> StrataResult<bool>;

    /// Close capability of this participant, if it has one
    fn as_closeable(&self) -> Option<&dyn Closeable> {
        None
    }
}

/// Hierarchical metrics sink handed to metered datasets
pub trait MetricsContext: Send + Sync {
    /// Child context with one extra tag
    fn child(&self, tag: &str, value: &str) -> Arc<dyn MetricsContext>;

    /// Increment a counter
    fn increment(&self, metric: &str, delta: u64);

    /// Set a gauge
    fn gauge(&self, metric: &str, value: i64);
}

/// Capability to receive a metrics collector after loading
pub trait MeteredDataset {
    /// Install the collector this dataset reports to
    fn set_metrics_collector(&self, metrics: Arc<dyn MetricsContext>);
}

/// Whether two handles point at the same instance
///
/// Compares data addresses only, so handles of different trait-object types
/// pointing at the same allocation compare equal.
pub fn same_instance<A: ?Sized, B: ?Sized>(a: &Arc<A>, b: &Arc<B>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Plain {
        closed: AtomicU64,
    }

    impl Closeable for Plain {
        fn close(&self) -> StrataResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Dataset for Plain {}

    #[derive(Default)]
    struct Aware {
        started: AtomicU64,
    }

    impl Closeable for Aware {
        fn close(&self) -> StrataResult<()> {
            Ok(())
        }
    }

    impl Dataset for Aware {
        fn into_participant(self: Arc<Self>) -> Option<Arc<dyn TransactionParticipant>> {
            Some(self)
        }
    }

    impl TransactionParticipant for Aware {
        fn participant_name(&self) -> String {
            "aware".to_string()
        }
        fn start_tx(&self, _tx: &Transaction) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn tx_changes(&self) -> Vec<Vec<u8>> {
            Vec::new()
        }
        fn commit_tx(&self) -> StrataResult<bool> {
            Ok(true)
        }
        fn post_tx_commit(&self) {}
        fn rollback_tx(&self) -> StrataResult<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_plain_dataset_has_no_capabilities() {
        let ds: Arc<dyn Dataset> = Arc::new(Plain::default());
        assert!(ds.as_metered().is_none());
        assert!(Arc::clone(&ds).into_participant().is_none());
        ds.close().unwrap();
        let plain = ds.into_any_arc().downcast::<Plain>().unwrap();
        assert_eq!(plain.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_participant_is_same_instance() {
        let ds: Arc<dyn Dataset> = Arc::new(Aware::default());
        let participant = Arc::clone(&ds).into_participant().unwrap();
        assert!(same_instance(&ds, &participant));

        participant.start_tx(&Transaction::new(1, 0));
        let aware = Arc::clone(&ds).into_any_arc().downcast::<Aware>().unwrap();
        assert_eq!(aware.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_equal_contents_are_distinct_instances() {
        let a: Arc<dyn Dataset> = Arc::new(Plain::default());
        let b: Arc<dyn Dataset> = Arc::new(Plain::default());
        assert!(!same_instance(&a, &b));
        assert!(same_instance(&a, &Arc::clone(&a)));
    }

    #[test]
    fn test_type_name_reports_concrete_type() {
        let ds: Arc<dyn Dataset> = Arc::new(Plain::default());
        assert!(ds.type_name().ends_with("Plain"));
    }

    #[test]
    fn test_downcast_to_wrong_type_fails() {
        let ds: Arc<dyn Dataset> = Arc::new(Plain::default());
        assert!(ds.into_any_arc().downcast::<Aware>().is_err());
    }
}
