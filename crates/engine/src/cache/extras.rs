//! Extra participants
//!
//! Participants supplied by the caller that belong to no dataset key, e.g. a
//! message queue consumer that must commit together with datasets. Members
//! are compared by identity and survive every transaction context; they are
//! owned by the caller, so the cache only closes them when it closes itself.

use std::sync::Arc;
use strata_core::{same_instance, TransactionParticipant};
use tracing::warn;

/// Identity set of caller-supplied participants
#[derive(Default)]
pub struct ExtraParticipants {
    members: Vec<Arc<dyn TransactionParticipant>>,
}

impl ExtraParticipants {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant; returns `false` if this instance is already a member
    pub fn insert(&mut self, participant: Arc<dyn TransactionParticipant>) -> bool {
        if self.contains(&participant) {
            return false;
        }
        self.members.push(participant);
        true
    }

    /// Remove a participant; returns whether it was a member
    pub fn remove(&mut self, participant: &Arc<dyn TransactionParticipant>) -> bool {
        let before = self.members.len();
        self.members.retain(|member| !same_instance(member, participant));
        self.members.len() != before
    }

    /// Whether this exact instance is a member
    pub fn contains(&self, participant: &Arc<dyn TransactionParticipant>) -> bool {
        self.members.iter().any(|member| same_instance(member, participant))
    }

    /// Members in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TransactionParticipant>> {
        self.members.iter()
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Close every member that can be closed
    ///
    /// Best effort: continues past failures and returns one message per
    /// failed close. Members stay in the set.
    pub fn close_all(&self) -> Vec<String> {
        let mut failures = Vec::new();
        for member in &self.members {
            if let Some(closeable) = member.as_closeable() {
                if let Err(e) = closeable.close() {
                    let name = member.participant_name();
                    warn!(target: "strata::cache", participant = %name, error = %e, "Error closing extra participant");
                    failures.push(format!("extra participant '{}': {}", name, e));
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingParticipant;

    #[test]
    fn test_identity_membership() {
        let mut extras = ExtraParticipants::new();
        let a: Arc<dyn TransactionParticipant> = RecordingParticipant::new("queue");
        let twin: Arc<dyn TransactionParticipant> = RecordingParticipant::new("queue");

        assert!(extras.insert(a.clone()));
        assert!(!extras.insert(a.clone()));
        assert!(!extras.contains(&twin));
        assert!(extras.insert(twin.clone()));
        assert_eq!(extras.len(), 2);

        assert!(extras.remove(&a));
        assert!(!extras.remove(&a));
        assert!(extras.contains(&twin));
    }

    #[test]
    fn test_close_all_is_best_effort() {
        let mut extras = ExtraParticipants::new();
        let failing = RecordingParticipant::closeable("failing");
        failing.fail_close();
        let ok = RecordingParticipant::closeable("ok");
        let plain = RecordingParticipant::new("plain");
        extras.insert(failing.clone());
        extras.insert(ok.clone());
        extras.insert(plain.clone());

        let failures = extras.close_all();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("failing"));
        assert_eq!(ok.close_count(), 1);
        assert_eq!(failing.close_count(), 1);
        assert_eq!(plain.close_count(), 0);
        assert_eq!(extras.len(), 3);
    }
}
