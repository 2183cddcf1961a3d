//! Active participant tracking
//!
//! Maps each key whose dataset is currently in use to that dataset's
//! transaction capability. Every new transaction context is seeded from
//! this map. A key maps to exactly the instance the `ResourceCache` holds for
//! it; a different instance under the same key means the two have diverged,
//! and that is reported as an `InternalConsistency` error.

use std::collections::BTreeMap;
use std::sync::Arc;
use strata_core::{same_instance, DatasetKey, StrataError, StrataResult, TransactionParticipant};
use tracing::error;

/// Key → participant map of datasets in use
#[derive(Default)]
pub struct ParticipantTracker {
    active: BTreeMap<DatasetKey, Arc<dyn TransactionParticipant>>,
}

impl ParticipantTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `participant` under `key`
    ///
    /// Returns `Ok(true)` if the key was not tracked before, `Ok(false)` if it
    /// already tracked this same instance.
    ///
    /// # Errors
    ///
    /// Returns `InternalConsistency` if a different instance is tracked
    /// under `key`. The tracker is left unchanged.
    pub fn track(
        &mut self,
        key: &DatasetKey,
        participant: Arc<dyn TransactionParticipant>,
    ) -> StrataResult<bool> {
        match self.active.get(key) {
            None => {
                self.active.insert(key.clone(), participant);
                Ok(true)
            }
            Some(existing) if same_instance(existing, &participant) => Ok(false),
            Some(existing) => {
                let message = format!(
                    "Cache returned '{}' for {}, which is different from the active participant '{}' for the same key",
                    participant.participant_name(),
                    key,
                    existing.participant_name()
                );
                error!(target: "strata::cache", key = %key, "{}", message);
                Err(StrataError::internal_consistency(message))
            }
        }
    }

    /// Stop tracking whichever key maps to this exact instance
    ///
    /// Linear scan; the map is expected to stay small. Returns the key that
    /// was untracked, if any.
    pub fn untrack_instance<T: ?Sized>(&mut self, handle: &Arc<T>) -> Option<DatasetKey> {
        let key = self
            .active
            .iter()
            .find(|(_, participant)| same_instance(participant, handle))
            .map(|(key, _)| key.clone())?;
        self.active.remove(&key);
        Some(key)
    }

    /// Participant tracked under `key`
    pub fn get(&self, key: &DatasetKey) -> Option<&Arc<dyn TransactionParticipant>> {
        self.active.get(key)
    }

    /// Whether this exact instance is tracked
    pub fn contains_instance<T: ?Sized>(&self, handle: &Arc<T>) -> bool {
        self.active.values().any(|participant| same_instance(participant, handle))
    }

    /// Tracked participants in key order
    pub fn participants(&self) -> impl Iterator<Item = &Arc<dyn TransactionParticipant>> {
        self.active.values()
    }

    /// Forget every tracked participant
    pub fn clear(&mut self) {
        self.active.clear();
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn force(&mut self, key: DatasetKey, participant: Arc<dyn TransactionParticipant>) {
        self.active.insert(key, participant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TableDataset;

    fn participant(name: &str) -> Arc<dyn TransactionParticipant> {
        TableDataset::new(name)
    }

    #[test]
    fn test_track_new_and_existing() {
        let mut tracker = ParticipantTracker::new();
        let key = DatasetKey::named("t1");
        let p = participant("t1");

        assert!(tracker.track(&key, p.clone()).unwrap());
        assert!(!tracker.track(&key, p.clone()).unwrap());
        assert_eq!(tracker.len(), 1);
        assert!(same_instance(tracker.get(&key).unwrap(), &p));
    }

    #[test]
    fn test_divergent_instance_is_consistency_fault() {
        let mut tracker = ParticipantTracker::new();
        let key = DatasetKey::named("t1");
        let original = participant("t1");
        tracker.track(&key, original.clone()).unwrap();

        let err = tracker.track(&key, participant("t1")).unwrap_err();
        assert!(err.is_fatal());
        assert!(same_instance(tracker.get(&key).unwrap(), &original));
    }

    #[test]
    fn test_untrack_by_identity() {
        let mut tracker = ParticipantTracker::new();
        let p1 = participant("t1");
        let p2 = participant("t2");
        tracker.track(&DatasetKey::named("t1"), p1.clone()).unwrap();
        tracker.track(&DatasetKey::named("t2"), p2.clone()).unwrap();

        // equal name, different instance
        assert!(tracker.untrack_instance(&participant("t1")).is_none());
        assert_eq!(tracker.untrack_instance(&p1), Some(DatasetKey::named("t1")));
        assert!(!tracker.contains_instance(&p1));
        assert!(tracker.contains_instance(&p2));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_participants_in_key_order() {
        let mut tracker = ParticipantTracker::new();
        tracker.track(&DatasetKey::named("b"), participant("b")).unwrap();
        tracker.track(&DatasetKey::named("a"), participant("a")).unwrap();

        let names: Vec<_> = tracker.participants().map(|p| p.participant_name()).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        tracker.clear();
        assert!(tracker.is_empty());
    }
}
