//! Transaction context for cached datasets
//!
//! A `TransactionContext` owns the participant set of one logical
//! transaction context and drives its transactions through a
//! `TransactionCoordinator`. It is a cheap, clonable handle: the dataset
//! cache keeps one clone to enrol participants as they are loaded, and the
//! caller keeps another to start, finish, or abort.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──start()──▶ Active ──finish()──▶ Committed ──start()──▶ Active ...
//!                     │
//!                     └──abort()───▶ Aborted ──start()──▶ Active ...
//!
//! any state ──cleanup()──▶ Closed (terminal; start() is rejected)
//! ```
//!
//! ## Deferred Releases
//!
//! A participant dismissed while the context is open must not leave the
//! read/write set mid-transaction. It is queued with `dismiss_after_tx` and
//! handed back to the owner by `cleanup`, which runs only once the
//! context is no longer needed.
//!
//! No lock is held while participants or the coordinator are called.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use strata_core::{same_instance, StrataError, StrataResult, Transaction, TransactionParticipant};
use tracing::{debug, warn};

use crate::coordinator::TransactionCoordinator;

type Participants = SmallVec<[Arc<dyn TransactionParticipant>; 8]>;

/// Status of a transaction context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// No transaction has been started yet
    Idle,
    /// A transaction is in progress
    Active,
    /// The last transaction committed
    Committed,
    /// The last transaction was aborted
    Aborted {
        /// Human-readable reason for abort
        reason: String,
    },
    /// The context was cleaned up and is inert
    Closed,
}

impl TransactionStatus {
    /// Whether a transaction is in progress
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionStatus::Active)
    }

    /// Whether the context has been cleaned up
    pub fn is_closed(&self) -> bool {
        matches!(self, TransactionStatus::Closed)
    }
}

struct ContextState {
    participants: Participants,
    deferred: Vec<Arc<dyn TransactionParticipant>>,
    current: Option<Transaction>,
    status: TransactionStatus,
}

/// Participant set and transaction driver for one context
#[derive(Clone)]
pub struct TransactionContext {
    coordinator: Arc<dyn TransactionCoordinator>,
    state: Arc<Mutex<ContextState>>,
}

impl TransactionContext {
    /// Create an idle context with no participants
    pub fn new(coordinator: Arc<dyn TransactionCoordinator>) -> Self {
        Self {
            coordinator,
            state: Arc::new(Mutex::new(ContextState {
                participants: SmallVec::new(),
                deferred: Vec::new(),
                current: None,
                status: TransactionStatus::Idle,
            })),
        }
    }

    /// Current status
    pub fn status(&self) -> TransactionStatus {
        self.state.lock().status.clone()
    }

    /// Transaction in progress, if any
    pub fn current_transaction(&self) -> Option<Transaction> {
        self.state.lock().current.clone()
    }

    /// Whether both handles refer to the same context
    pub fn ptr_eq(&self, other: &TransactionContext) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Participants currently enrolled, in enrolment order
    pub fn participants(&self) -> Vec<Arc<dyn TransactionParticipant>> {
        self.state.lock().participants.iter().cloned().collect()
    }

    /// Whether `participant` is enrolled
    pub fn contains(&self, participant: &Arc<dyn TransactionParticipant>) -> bool {
        self.state
            .lock()
            .participants
            .iter()
            .any(|p| same_instance(p, participant))
    }

    /// Enrol a participant
    ///
    /// If a transaction is in progress, the participant joins it right away.
    /// Returns `false` if it was already enrolled or the context is closed.
    pub fn add_participant(&self, participant: Arc<dyn TransactionParticipant>) -> bool {
        let current = {
            let mut state = self.state.lock();
            if state.status.is_closed() {
                debug!(target: "strata::txn", participant = %participant.participant_name(), "Ignoring participant for closed context");
                return false;
            }
            if state.participants.iter().any(|p| same_instance(p, &participant)) {
                return false;
            }
            state.participants.push(Arc::clone(&participant));
            state.current.clone()
        };

        if let Some(tx) = current {
            participant.start_tx(&tx);
        }
        true
    }

    /// Remove a participant
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while a transaction is in progress, since
    /// removing a participant then would corrupt its read/write set.
    pub fn remove_participant(&self, participant: &Arc<dyn TransactionParticipant>) -> StrataResult<bool> {
        let mut state = self.state.lock();
        if state.status.is_active() {
            return Err(StrataError::invalid_state(format!(
                "cannot remove participant '{}' while a transaction is in progress",
                participant.participant_name()
            )));
        }
        let before = state.participants.len();
        state.participants.retain(|p| !same_instance(p, participant));
        Ok(state.participants.len() != before)
    }

    /// Queue a participant for release when this context is cleaned up
    ///
    /// Queuing the same instance twice has no further effect.
    pub fn dismiss_after_tx(&self, participant: Arc<dyn TransactionParticipant>) {
        let mut state = self.state.lock();
        if !state.deferred.iter().any(|p| same_instance(p, &participant)) {
            state.deferred.push(participant);
        }
    }

    /// Number of releases waiting for cleanup
    pub fn pending_releases(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// Start a transaction and enrol every participant in it
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if a transaction is already in progress or the
    /// context is closed, or the coordinator's error if it cannot start one.
    pub fn start(&self) -> StrataResult<Transaction> {
        {
            let state = self.state.lock();
            match &state.status {
                TransactionStatus::Active => {
                    return Err(StrataError::invalid_state("transaction already in progress"))
                }
                TransactionStatus::Closed => {
                    return Err(StrataError::invalid_state("transaction context is closed"))
                }
                _ => {}
            }
        }

        let tx = self.coordinator.start_short()?;
        let participants = {
            let mut state = self.state.lock();
            state.current = Some(tx.clone());
            state.status = TransactionStatus::Active;
            state.participants.clone()
        };
        for participant in &participants {
            participant.start_tx(&tx);
        }

        debug!(target: "strata::txn", txn_id = tx.txn_id, participants = participants.len(), "Context transaction started");
        Ok(tx)
    }

    /// Commit the transaction in progress
    ///
    /// Conflict check first, then participants persist, then the coordinator
    /// commits, then participants are notified. Any failure aborts.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if no transaction is in progress
    /// - `TransactionConflict` if the coordinator rejects the change set
    /// - `TransactionFailure` if a participant fails to persist
    pub fn finish(&self) -> StrataResult<()> {
        let (tx, participants) = self.active_transaction()?;

        let changes: Vec<Vec<u8>> = participants.iter().flat_map(|p| p.tx_changes()).collect();
        match self.coordinator.can_commit(&tx, &changes) {
            Ok(true) => {}
            Ok(false) => {
                self.abort_with("conflict detected")?;
                return Err(StrataError::TransactionConflict { txn_id: tx.txn_id });
            }
            Err(e) => {
                self.abort_with(format!("conflict check failed: {}", e))?;
                return Err(e);
            }
        }

        for participant in &participants {
            let reason = match participant.commit_tx() {
                Ok(true) => continue,
                Ok(false) => format!("participant '{}' refused to persist", participant.participant_name()),
                Err(e) => format!("participant '{}' failed to persist: {}", participant.participant_name(), e),
            };
            self.abort_with(reason.clone())?;
            return Err(StrataError::TransactionFailure {
                txn_id: tx.txn_id,
                reason,
            });
        }

        match self.coordinator.commit(&tx) {
            Ok(true) => {}
            Ok(false) => {
                self.abort_with("conflict detected at commit")?;
                return Err(StrataError::TransactionConflict { txn_id: tx.txn_id });
            }
            Err(e) => {
                self.abort_with(format!("commit failed: {}", e))?;
                return Err(e);
            }
        }

        for participant in &participants {
            participant.post_tx_commit();
        }

        let mut state = self.state.lock();
        state.current = None;
        state.status = TransactionStatus::Committed;
        Ok(())
    }

    /// Abort the transaction in progress; a no-op if there is none
    ///
    /// # Errors
    ///
    /// Returns `TransactionFailure` if a participant could not roll back. The
    /// transaction is invalidated with the coordinator in that case.
    pub fn abort(&self) -> StrataResult<()> {
        self.abort_with("aborted by caller")
    }

    /// Abort with a reason recorded in the status
    pub fn abort_with(&self, reason: impl Into<String>) -> StrataResult<()> {
        let reason = reason.into();
        let (tx, participants) = {
            let state = self.state.lock();
            match &state.current {
                Some(tx) => (tx.clone(), state.participants.clone()),
                None => return Ok(()),
            }
        };

        let mut failed: Vec<String> = Vec::new();
        for participant in &participants {
            match participant.rollback_tx() {
                Ok(true) => {}
                Ok(false) => failed.push(participant.participant_name()),
                Err(e) => {
                    warn!(target: "strata::txn", txn_id = tx.txn_id, participant = %participant.participant_name(), error = %e, "Rollback failed");
                    failed.push(participant.participant_name());
                }
            }
        }

        if failed.is_empty() {
            self.coordinator.abort(&tx);
        } else {
            self.coordinator.invalidate(&tx);
        }

        {
            let mut state = self.state.lock();
            state.current = None;
            state.status = TransactionStatus::Aborted {
                reason: reason.clone(),
            };
        }
        debug!(target: "strata::txn", txn_id = tx.txn_id, reason = %reason, "Context transaction aborted");

        if failed.is_empty() {
            Ok(())
        } else {
            Err(StrataError::TransactionFailure {
                txn_id: tx.txn_id,
                reason: format!("unable to roll back: {}", failed.join(", ")),
            })
        }
    }

    /// Close the context and hand every deferred release to `release`
    ///
    /// A transaction still in progress is aborted first; a failed abort is
    /// logged. After cleanup the context is inert: new participants are
    /// ignored and `start` is rejected. Running cleanup twice releases
    /// nothing twice.
    pub fn cleanup<F>(&self, mut release: F)
    where
        F: FnMut(&Arc<dyn TransactionParticipant>),
    {
        if self.status().is_active() {
            warn!(target: "strata::txn", "Cleaning up context with a transaction still in progress");
            if let Err(e) = self.abort_with("context cleaned up with transaction in progress") {
                warn!(target: "strata::txn", error = %e, "Abort during context cleanup did not complete");
            }
        }

        let deferred = {
            let mut state = self.state.lock();
            state.status = TransactionStatus::Closed;
            state.current = None;
            state.participants.clear();
            std::mem::take(&mut state.deferred)
        };
        for participant in &deferred {
            release(participant);
        }
    }

    /// Close the context, dropping deferred releases without running them
    ///
    /// Used for hard resets where the owner releases everything anyway.
    pub fn discard(&self) {
        self.cleanup(|_| {});
    }

    fn active_transaction(&self) -> StrataResult<(Transaction, Participants)> {
        let state = self.state.lock();
        match &state.current {
            Some(tx) => Ok((tx.clone(), state.participants.clone())),
            None => Err(StrataError::invalid_state("no transaction in progress")),
        }
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionContext")
            .field("status", &state.status)
            .field("participants", &state.participants.len())
            .field("deferred", &state.deferred.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::InMemoryCoordinator;
    use parking_lot::Mutex as PlMutex;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    assert_impl_all!(TransactionContext: Send, Sync, Clone);

    /// Participant that records every callback
    #[derive(Default)]
    struct Recorder {
        name: String,
        events: PlMutex<Vec<String>>,
        changes: PlMutex<Vec<Vec<u8>>>,
        refuse_commit: AtomicBool,
        fail_rollback: AtomicBool,
        started: AtomicU64,
    }

    impl Recorder {
        fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                ..Default::default()
            })
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn touch(&self, change: &str) {
            self.changes.lock().push(change.as_bytes().to_vec());
        }
    }

    impl TransactionParticipant for Recorder {
        fn participant_name(&self) -> String {
            self.name.clone()
        }
        fn start_tx(&self, tx: &Transaction) {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.changes.lock().clear();
            self.events.lock().push(format!("start:{}", tx.txn_id));
        }
        fn tx_changes(&self) -> Vec<Vec<u8>> {
            self.changes.lock().clone()
        }
        fn commit_tx(&self) -> StrataResult<bool> {
            self.events.lock().push("commit".to_string());
            Ok(!self.refuse_commit.load(Ordering::SeqCst))
        }
        fn post_tx_commit(&self) {
            self.events.lock().push("post".to_string());
        }
        fn rollback_tx(&self) -> StrataResult<bool> {
            self.events.lock().push("rollback".to_string());
            if self.fail_rollback.load(Ordering::SeqCst) {
                Err(StrataError::internal("rollback exploded"))
            } else {
                Ok(true)
            }
        }
    }

    fn context() -> (TransactionContext, Arc<InMemoryCoordinator>) {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        (TransactionContext::new(coordinator.clone()), coordinator)
    }

    fn as_participant(r: &Arc<Recorder>) -> Arc<dyn TransactionParticipant> {
        r.clone()
    }

    #[test]
    fn test_new_context_is_idle() {
        let (ctx, _) = context();
        assert_eq!(ctx.status(), TransactionStatus::Idle);
        assert!(ctx.participants().is_empty());
        assert!(ctx.current_transaction().is_none());
    }

    #[test]
    fn test_add_participant_is_identity_deduplicated() {
        let (ctx, _) = context();
        let a = Recorder::named("a");
        let twin = Recorder::named("a");
        assert!(ctx.add_participant(as_participant(&a)));
        assert!(!ctx.add_participant(as_participant(&a)));
        assert!(ctx.add_participant(as_participant(&twin)));
        assert_eq!(ctx.participants().len(), 2);
    }

    #[test]
    fn test_commit_sequence() {
        let (ctx, coordinator) = context();
        let a = Recorder::named("a");
        ctx.add_participant(as_participant(&a));

        let tx = ctx.start().unwrap();
        assert!(ctx.status().is_active());
        ctx.finish().unwrap();

        assert_eq!(ctx.status(), TransactionStatus::Committed);
        assert_eq!(a.events(), vec![format!("start:{}", tx.txn_id), "commit".into(), "post".into()]);
        assert_eq!(coordinator.metrics().total_committed, 1);
    }

    #[test]
    fn test_participant_added_mid_transaction_joins_it() {
        let (ctx, _) = context();
        let tx = ctx.start().unwrap();
        let late = Recorder::named("late");
        assert!(ctx.add_participant(as_participant(&late)));
        assert_eq!(late.events(), vec![format!("start:{}", tx.txn_id)]);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (ctx, _) = context();
        ctx.start().unwrap();
        assert!(matches!(ctx.start(), Err(StrataError::InvalidState { .. })));
    }

    #[test]
    fn test_context_is_reusable_after_commit_and_abort() {
        let (ctx, _) = context();
        ctx.start().unwrap();
        ctx.finish().unwrap();
        ctx.start().unwrap();
        ctx.abort().unwrap();
        assert!(matches!(ctx.status(), TransactionStatus::Aborted { .. }));
        ctx.start().unwrap();
        assert!(ctx.status().is_active());
    }

    #[test]
    fn test_finish_without_transaction_fails() {
        let (ctx, _) = context();
        assert!(matches!(ctx.finish(), Err(StrataError::InvalidState { .. })));
    }

    #[test]
    fn test_abort_without_transaction_is_noop() {
        let (ctx, coordinator) = context();
        ctx.abort().unwrap();
        assert_eq!(ctx.status(), TransactionStatus::Idle);
        assert_eq!(coordinator.metrics().total_aborted, 0);
    }

    #[test]
    fn test_conflict_aborts_and_rolls_back() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let first = TransactionContext::new(coordinator.clone());
        let second = TransactionContext::new(coordinator.clone());
        let a = Recorder::named("a");
        let b = Recorder::named("b");
        first.add_participant(as_participant(&a));
        second.add_participant(as_participant(&b));

        first.start().unwrap();
        second.start().unwrap();
        a.touch("row1");
        b.touch("row1");

        first.finish().unwrap();
        let err = second.finish().unwrap_err();
        assert!(matches!(err, StrataError::TransactionConflict { .. }));
        assert!(b.events().contains(&"rollback".to_string()));
        assert!(!b.events().contains(&"commit".to_string()));
        assert!(matches!(second.status(), TransactionStatus::Aborted { .. }));
    }

    #[test]
    fn test_refused_persist_aborts() {
        let (ctx, coordinator) = context();
        let a = Recorder::named("a");
        a.refuse_commit.store(true, Ordering::SeqCst);
        ctx.add_participant(as_participant(&a));

        ctx.start().unwrap();
        let err = ctx.finish().unwrap_err();
        assert!(matches!(err, StrataError::TransactionFailure { .. }));
        assert_eq!(a.events().last().map(String::as_str), Some("rollback"));
        assert_eq!(coordinator.metrics().total_aborted, 1);
    }

    #[test]
    fn test_failed_rollback_invalidates() {
        let (ctx, coordinator) = context();
        let a = Recorder::named("a");
        a.fail_rollback.store(true, Ordering::SeqCst);
        ctx.add_participant(as_participant(&a));

        let tx = ctx.start().unwrap();
        let err = ctx.abort().unwrap_err();
        assert!(matches!(err, StrataError::TransactionFailure { .. }));
        assert!(coordinator.is_invalid(tx.txn_id));
        assert!(ctx.current_transaction().is_none());
    }

    #[test]
    fn test_remove_participant_refused_while_active() {
        let (ctx, _) = context();
        let a = as_participant(&Recorder::named("a"));
        ctx.add_participant(a.clone());

        ctx.start().unwrap();
        assert!(ctx.remove_participant(&a).is_err());
        assert!(ctx.contains(&a));

        ctx.finish().unwrap();
        assert!(ctx.remove_participant(&a).unwrap());
        assert!(!ctx.remove_participant(&a).unwrap());
    }

    #[test]
    fn test_cleanup_releases_deferred_once() {
        let (ctx, _) = context();
        let a = as_participant(&Recorder::named("a"));
        ctx.add_participant(a.clone());
        ctx.dismiss_after_tx(a.clone());
        ctx.dismiss_after_tx(a.clone());
        assert_eq!(ctx.pending_releases(), 1);

        let mut released = Vec::new();
        ctx.cleanup(|p| released.push(p.participant_name()));
        ctx.cleanup(|p| released.push(p.participant_name()));

        assert_eq!(released, vec!["a".to_string()]);
        assert!(ctx.status().is_closed());
    }

    #[test]
    fn test_cleanup_aborts_transaction_in_progress() {
        let (ctx, coordinator) = context();
        let a = Recorder::named("a");
        ctx.add_participant(as_participant(&a));
        let tx = ctx.start().unwrap();

        ctx.discard();

        assert_eq!(a.events(), vec![format!("start:{}", tx.txn_id), "rollback".into()]);
        assert!(ctx.status().is_closed());
        let metrics = coordinator.metrics();
        assert_eq!(metrics.active_count, 0);
        assert_eq!(metrics.total_aborted, 1);
    }

    #[test]
    fn test_cleanup_with_failed_rollback_still_closes() {
        let (ctx, coordinator) = context();
        let a = Recorder::named("a");
        a.fail_rollback.store(true, Ordering::SeqCst);
        ctx.add_participant(as_participant(&a));
        let tx = ctx.start().unwrap();

        let mut released = 0;
        ctx.dismiss_after_tx(as_participant(&a));
        ctx.cleanup(|_| released += 1);

        assert!(ctx.status().is_closed());
        assert_eq!(released, 1);
        assert!(coordinator.is_invalid(tx.txn_id));
        assert_eq!(coordinator.metrics().active_count, 0);
    }

    #[test]
    fn test_closed_context_is_inert() {
        let (ctx, _) = context();
        ctx.discard();
        assert!(!ctx.add_participant(as_participant(&Recorder::named("a"))));
        assert!(ctx.participants().is_empty());
        assert!(matches!(ctx.start(), Err(StrataError::InvalidState { .. })));
    }

    #[test]
    fn test_clones_share_state() {
        let (ctx, _) = context();
        let other = ctx.clone();
        assert!(ctx.ptr_eq(&other));
        other.add_participant(as_participant(&Recorder::named("a")));
        assert_eq!(ctx.participants().len(), 1);

        let (unrelated, _) = context();
        assert!(!ctx.ptr_eq(&unrelated));
    }
}
