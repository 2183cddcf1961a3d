//! Transaction coordinator interface and a local implementation
//!
//! The coordinator issues transactions, decides whether a change set may
//! commit, and records the outcome. In production it is a remote service;
//! `InMemoryCoordinator` implements the same protocol in process.
//!
//! ## Conflict Rule
//!
//! A transaction conflicts if any change it reports was also reported by a
//! transaction that committed after it started (first-committer-wins).
//! Checked at `can_commit` and again at `commit`.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_core::{StrataError, StrataResult, Transaction};
use tracing::{debug, warn};

/// Issues and settles transactions for a `TransactionContext`
pub trait TransactionCoordinator: Send + Sync {
    /// Start a new short transaction
    fn start_short(&self) -> StrataResult<Transaction>;

    /// Whether `tx` may commit given its change set
    fn can_commit(&self, tx: &Transaction, changes: &[Vec<u8>]) -> StrataResult<bool>;

    /// Commit `tx`; `Ok(false)` means a conflict was detected
    fn commit(&self, tx: &Transaction) -> StrataResult<bool>;

    /// Abort `tx` after its participants rolled back
    fn abort(&self, tx: &Transaction);

    /// Mark `tx` invalid because rollback did not complete
    fn invalidate(&self, tx: &Transaction);
}

/// Snapshot of coordinator counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorMetrics {
    /// Transactions started and not yet settled
    pub active_count: u64,
    /// Total transactions started
    pub total_started: u64,
    /// Total transactions committed
    pub total_committed: u64,
    /// Total transactions aborted
    pub total_aborted: u64,
    /// Total transactions invalidated
    pub total_invalidated: u64,
    /// committed / started
    pub commit_rate: f64,
}

#[derive(Default)]
struct CoordinatorState {
    /// Last assigned transaction ID
    last_txn_id: u64,
    /// Commit sequence; a transaction's read pointer is the value at start
    commit_version: u64,
    /// In-flight transactions: read pointer and the change set reported so far
    in_flight: FxHashMap<u64, (u64, FxHashSet<Vec<u8>>)>,
    /// Change sets of committed transactions still visible to an in-flight one
    committed: Vec<(u64, FxHashSet<Vec<u8>>)>,
    /// Transactions whose rollback failed
    invalid: FxHashSet<u64>,
}

impl CoordinatorState {
    fn has_conflict(&self, read_pointer: u64, changes: &FxHashSet<Vec<u8>>) -> bool {
        self.committed
            .iter()
            .filter(|(version, _)| *version > read_pointer)
            .any(|(_, committed)| !committed.is_disjoint(changes))
    }

    /// Drop committed change sets no in-flight transaction can conflict with
    fn prune(&mut self) {
        match self.in_flight.values().map(|(rp, _)| *rp).min() {
            Some(oldest) => self.committed.retain(|(version, _)| *version > oldest),
            None => self.committed.clear(),
        }
    }
}

/// In-process coordinator
///
/// The metric counters use Relaxed ordering: they are observational only.
pub struct InMemoryCoordinator {
    state: Mutex<CoordinatorState>,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
    total_invalidated: AtomicU64,
}

impl InMemoryCoordinator {
    /// Create a coordinator with no history
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            total_started: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
            total_invalidated: AtomicU64::new(0),
        }
    }

    /// Whether `txn_id` was invalidated
    pub fn is_invalid(&self, txn_id: u64) -> bool {
        self.state.lock().invalid.contains(&txn_id)
    }

    /// Number of committed change sets currently retained
    pub fn retained_change_sets(&self) -> usize {
        self.state.lock().committed.len()
    }

    /// Get coordinator metrics
    pub fn metrics(&self) -> CoordinatorMetrics {
        let started = self.total_started.load(Ordering::Relaxed);
        let committed = self.total_committed.load(Ordering::Relaxed);
        let aborted = self.total_aborted.load(Ordering::Relaxed);
        let invalidated = self.total_invalidated.load(Ordering::Relaxed);

        CoordinatorMetrics {
            active_count: started.saturating_sub(committed + aborted + invalidated),
            total_started: started,
            total_committed: committed,
            total_aborted: aborted,
            total_invalidated: invalidated,
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }

    fn settle(&self, txn_id: u64) {
        let mut state = self.state.lock();
        state.in_flight.remove(&txn_id);
        state.prune();
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionCoordinator for InMemoryCoordinator {
    fn start_short(&self) -> StrataResult<Transaction> {
        let mut state = self.state.lock();
        state.last_txn_id += 1;
        let tx = Transaction::new(state.last_txn_id, state.commit_version);
        state
            .in_flight
            .insert(tx.txn_id, (tx.read_pointer, FxHashSet::default()));
        self.total_started.fetch_add(1, Ordering::Relaxed);

        debug!(target: "strata::txn", txn_id = tx.txn_id, read_pointer = tx.read_pointer, "Transaction started");
        Ok(tx)
    }

    fn can_commit(&self, tx: &Transaction, changes: &[Vec<u8>]) -> StrataResult<bool> {
        let mut state = self.state.lock();
        let read_pointer = match state.in_flight.get(&tx.txn_id) {
            Some((rp, _)) => *rp,
            None => {
                return Err(StrataError::invalid_state(format!(
                    "transaction {} is not in progress",
                    tx.txn_id
                )))
            }
        };

        let changes: FxHashSet<Vec<u8>> = changes.iter().cloned().collect();
        if state.has_conflict(read_pointer, &changes) {
            debug!(target: "strata::txn", txn_id = tx.txn_id, "Change set conflicts with a later commit");
            return Ok(false);
        }
        if let Some((_, recorded)) = state.in_flight.get_mut(&tx.txn_id) {
            *recorded = changes;
        }
        Ok(true)
    }

    fn commit(&self, tx: &Transaction) -> StrataResult<bool> {
        let mut state = self.state.lock();
        let (read_pointer, changes) = match state.in_flight.get(&tx.txn_id) {
            Some((rp, changes)) => (*rp, changes.clone()),
            None => {
                return Err(StrataError::invalid_state(format!(
                    "transaction {} is not in progress",
                    tx.txn_id
                )))
            }
        };

        // Another transaction may have committed between can_commit and commit
        if state.has_conflict(read_pointer, &changes) {
            return Ok(false);
        }

        state.commit_version += 1;
        let version = state.commit_version;
        if !changes.is_empty() {
            state.committed.push((version, changes));
        }
        state.in_flight.remove(&tx.txn_id);
        state.prune();
        self.total_committed.fetch_add(1, Ordering::Relaxed);

        debug!(target: "strata::txn", txn_id = tx.txn_id, commit_version = version, "Transaction committed");
        Ok(true)
    }

    fn abort(&self, tx: &Transaction) {
        self.settle(tx.txn_id);
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
        debug!(target: "strata::txn", txn_id = tx.txn_id, "Transaction aborted");
    }

    fn invalidate(&self, tx: &Transaction) {
        self.state.lock().invalid.insert(tx.txn_id);
        self.settle(tx.txn_id);
        self.total_invalidated.fetch_add(1, Ordering::Relaxed);
        warn!(target: "strata::txn", txn_id = tx.txn_id, "Transaction invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn test_transaction_ids_are_monotonic() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.start_short().unwrap();
        let b = coordinator.start_short().unwrap();
        assert!(b.txn_id > a.txn_id);
    }

    #[test]
    fn test_disjoint_change_sets_both_commit() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.start_short().unwrap();
        let b = coordinator.start_short().unwrap();

        assert!(coordinator.can_commit(&a, &[change("x")]).unwrap());
        assert!(coordinator.commit(&a).unwrap());
        assert!(coordinator.can_commit(&b, &[change("y")]).unwrap());
        assert!(coordinator.commit(&b).unwrap());

        assert_eq!(coordinator.metrics().total_committed, 2);
    }

    #[test]
    fn test_first_committer_wins() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.start_short().unwrap();
        let b = coordinator.start_short().unwrap();

        assert!(coordinator.can_commit(&a, &[change("x")]).unwrap());
        assert!(coordinator.commit(&a).unwrap());

        // b started before a committed and touches the same change
        assert!(!coordinator.can_commit(&b, &[change("x")]).unwrap());
        coordinator.abort(&b);

        let metrics = coordinator.metrics();
        assert_eq!(metrics.total_committed, 1);
        assert_eq!(metrics.total_aborted, 1);
        assert_eq!(metrics.active_count, 0);
    }

    #[test]
    fn test_later_transaction_sees_no_conflict() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.start_short().unwrap();
        coordinator.can_commit(&a, &[change("x")]).unwrap();
        coordinator.commit(&a).unwrap();

        let c = coordinator.start_short().unwrap();
        assert!(coordinator.can_commit(&c, &[change("x")]).unwrap());
    }

    #[test]
    fn test_conflict_rechecked_at_commit() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.start_short().unwrap();
        let b = coordinator.start_short().unwrap();

        assert!(coordinator.can_commit(&a, &[change("x")]).unwrap());
        assert!(coordinator.can_commit(&b, &[change("x")]).unwrap());
        assert!(coordinator.commit(&a).unwrap());
        assert!(!coordinator.commit(&b).unwrap());
    }

    #[test]
    fn test_unknown_transaction_is_rejected() {
        let coordinator = InMemoryCoordinator::new();
        let ghost = Transaction::new(42, 0);
        assert!(matches!(
            coordinator.can_commit(&ghost, &[]),
            Err(StrataError::InvalidState { .. })
        ));
        assert!(coordinator.commit(&ghost).is_err());
    }

    #[test]
    fn test_invalidate_records_transaction() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.start_short().unwrap();
        coordinator.invalidate(&a);
        assert!(coordinator.is_invalid(a.txn_id));
        assert_eq!(coordinator.metrics().total_invalidated, 1);
    }

    #[test]
    fn test_committed_change_sets_are_pruned_when_idle() {
        let coordinator = InMemoryCoordinator::new();
        let a = coordinator.start_short().unwrap();
        let b = coordinator.start_short().unwrap();
        coordinator.can_commit(&a, &[change("x")]).unwrap();
        coordinator.commit(&a).unwrap();
        // b is still in flight and could conflict with a
        assert_eq!(coordinator.retained_change_sets(), 1);

        coordinator.abort(&b);
        assert_eq!(coordinator.retained_change_sets(), 0);
    }

    #[test]
    fn test_commit_rate() {
        let coordinator = InMemoryCoordinator::new();
        assert_eq!(coordinator.metrics().commit_rate, 0.0);
        let a = coordinator.start_short().unwrap();
        let b = coordinator.start_short().unwrap();
        coordinator.can_commit(&a, &[]).unwrap();
        coordinator.commit(&a).unwrap();
        coordinator.abort(&b);
        assert_eq!(coordinator.metrics().commit_rate, 0.5);
    }
}
