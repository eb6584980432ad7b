//! Submission collector: accepts concurrent preference submissions for one
//! session and decides when collection closes.
//!
//! All writes go through a single mutex so that recording a submission and
//! evaluating the quorum happen in one step. Progress is published on a
//! `tokio::sync::watch` channel after every write; [`SubmissionCollector::status`]
//! reads that channel and never waits on the submission lock.
//!
//! ```text
//! Open --submit reaches quorum--> Closed(QuorumReached)
//! Open --deadline timer--------> Closed(DeadlineElapsed)
//! Open --organizer closes------> Closed(ManualOverride)
//! Open --organizer cancels-----> Aborted
//! ```
//!
//! The first transition out of `Open` wins; later `close` calls report the
//! original reason.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use huddle_db::models::{CloseReason, ParticipantId, PreferenceSet, Preferences, QuorumPolicy};

use crate::error::SubmissionError;
use crate::validate::{accept_preferences, validate_preferences};

/// Whether the collector still takes submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionPhase {
    Open,
    Closed(CloseReason),
    /// Cancelled by the organizer; no result will be produced.
    Aborted,
}

impl CollectionPhase {
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

/// Point-in-time progress of a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorStatus {
    pub submitted: usize,
    pub total: usize,
    pub phase: CollectionPhase,
    pub deadline: DateTime<Utc>,
}

impl CollectorStatus {
    /// Time left until the deadline, zero once it has passed or collection
    /// is no longer open.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        if !self.phase.is_open() {
            return Duration::ZERO;
        }
        (self.deadline - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Outcome of an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub submitted: usize,
    pub total: usize,
    /// Set when this submission satisfied the quorum and closed collection.
    pub closed: Option<CloseReason>,
}

/// Outcome of a [`SubmissionCollector::close`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// This call closed the collector.
    Closed(CloseReason),
    /// An earlier call already closed it, for this reason.
    AlreadyClosed(CloseReason),
    /// The collector was aborted and will never close.
    Aborted,
}

impl CloseOutcome {
    pub fn reason(self) -> Option<CloseReason> {
        match self {
            Self::Closed(reason) | Self::AlreadyClosed(reason) => Some(reason),
            Self::Aborted => None,
        }
    }
}

struct CollectorInner {
    collected: BTreeMap<ParticipantId, PreferenceSet>,
    phase: CollectionPhase,
}

/// Concurrency-safe collector for one session.
pub struct SubmissionCollector {
    invitees: BTreeSet<ParticipantId>,
    quorum: QuorumPolicy,
    deadline: DateTime<Utc>,
    inner: Mutex<CollectorInner>,
    progress: watch::Sender<CollectorStatus>,
}

impl SubmissionCollector {
    /// Start an open collector with no submissions.
    pub fn new(
        invitees: BTreeSet<ParticipantId>,
        quorum: QuorumPolicy,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self::restore(invitees, quorum, deadline, Vec::new())
    }

    /// Rebuild an open collector around submissions recorded earlier.
    ///
    /// Submissions from unknown or repeated participants are dropped. The
    /// quorum is not evaluated here; see [`Self::quorum_met`].
    pub fn restore(
        invitees: BTreeSet<ParticipantId>,
        quorum: QuorumPolicy,
        deadline: DateTime<Utc>,
        submissions: Vec<PreferenceSet>,
    ) -> Self {
        let mut collected = BTreeMap::new();
        for set in submissions {
            if invitees.contains(&set.participant) {
                collected.entry(set.participant.clone()).or_insert(set);
            }
        }
        let (progress, _) = watch::channel(CollectorStatus {
            submitted: collected.len(),
            total: invitees.len(),
            phase: CollectionPhase::Open,
            deadline,
        });
        Self {
            invitees,
            quorum,
            deadline,
            inner: Mutex::new(CollectorInner {
                collected,
                phase: CollectionPhase::Open,
            }),
            progress,
        }
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn quorum(&self) -> QuorumPolicy {
        self.quorum
    }

    pub fn total(&self) -> usize {
        self.invitees.len()
    }

    /// Record a participant's preferences.
    ///
    /// Rejections, in the order they are checked:
    /// - [`SubmissionError::InvalidPreferenceSet`] for a malformed payload,
    /// - [`SubmissionError::SubmissionAfterClose`] once collection stopped,
    /// - [`SubmissionError::UnknownParticipant`] for non-invitees,
    /// - [`SubmissionError::DuplicateSubmission`] for a second submission.
    pub fn submit(
        &self,
        participant: &str,
        preferences: &Preferences,
    ) -> Result<SubmitReceipt, SubmissionError> {
        validate_preferences(preferences).map_err(SubmissionError::InvalidPreferenceSet)?;
        let participant = participant.trim();

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if !inner.phase.is_open() {
            return Err(SubmissionError::SubmissionAfterClose);
        }
        if !self.invitees.contains(participant) {
            return Err(SubmissionError::UnknownParticipant(participant.to_string()));
        }
        if inner.collected.contains_key(participant) {
            return Err(SubmissionError::DuplicateSubmission(participant.to_string()));
        }

        let set = accept_preferences(participant, preferences, Utc::now());
        inner.collected.insert(participant.to_string(), set);

        let submitted = inner.collected.len();
        let total = self.total();
        let closed = if self.quorum.is_met(submitted, total) {
            inner.phase = CollectionPhase::Closed(CloseReason::QuorumReached);
            Some(CloseReason::QuorumReached)
        } else {
            None
        };

        self.publish(&inner);

        Ok(SubmitReceipt {
            submitted,
            total,
            closed,
        })
    }

    /// Stop collecting. Idempotent: only the first call changes anything.
    pub fn close(&self, reason: CloseReason) -> CloseOutcome {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.phase {
            CollectionPhase::Open => {
                inner.phase = CollectionPhase::Closed(reason);
                self.publish(&inner);
                CloseOutcome::Closed(reason)
            }
            CollectionPhase::Closed(original) => CloseOutcome::AlreadyClosed(original),
            CollectionPhase::Aborted => CloseOutcome::Aborted,
        }
    }

    /// Permanently refuse further submissions without producing a result.
    ///
    /// Returns `false` if the collector had already closed or aborted.
    pub fn abort(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.phase.is_open() {
            inner.phase = CollectionPhase::Aborted;
            self.publish(&inner);
            true
        } else {
            false
        }
    }

    /// Whether the recorded submissions already satisfy the quorum.
    pub fn quorum_met(&self) -> bool {
        let status = self.status();
        self.quorum.is_met(status.submitted, status.total)
    }

    /// Latest published progress.
    pub fn status(&self) -> CollectorStatus {
        *self.progress.borrow()
    }

    /// Receiver that observes every published progress change, including
    /// closure.
    pub fn subscribe(&self) -> watch::Receiver<CollectorStatus> {
        self.progress.subscribe()
    }

    /// Submissions recorded so far, ordered by participant id.
    pub fn submissions(&self) -> Vec<PreferenceSet> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.collected.values().cloned().collect()
    }

    fn publish(&self, inner: &CollectorInner) {
        self.progress.send_replace(CollectorStatus {
            submitted: inner.collected.len(),
            total: self.invitees.len(),
            phase: inner.phase,
            deadline: self.deadline,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use huddle_db::models::BudgetRange;

    fn invitees(ids: &[&str]) -> BTreeSet<ParticipantId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn prefs() -> Preferences {
        Preferences {
            activities: ["Dinner".to_string()].into(),
            times: ["Evening".to_string()].into(),
            budget: BudgetRange::new(20, 60),
        }
    }

    fn collector(quorum: QuorumPolicy) -> SubmissionCollector {
        SubmissionCollector::new(
            invitees(&["A", "B", "C"]),
            quorum,
            Utc::now() + chrono::Duration::hours(1),
        )
    }

    #[test]
    fn all_quorum_closes_on_last_submission() {
        let c = collector(QuorumPolicy::All);
        assert_eq!(c.submit("A", &prefs()).unwrap().closed, None);
        assert_eq!(c.submit("B", &prefs()).unwrap().closed, None);
        let last = c.submit("C", &prefs()).unwrap();
        assert_eq!(last.submitted, 3);
        assert_eq!(last.total, 3);
        assert_eq!(last.closed, Some(CloseReason::QuorumReached));
        assert_eq!(
            c.status().phase,
            CollectionPhase::Closed(CloseReason::QuorumReached)
        );
    }

    #[test]
    fn at_least_quorum_rejects_late_submission() {
        let c = collector(QuorumPolicy::AtLeast { count: 2 });
        c.submit("A", &prefs()).unwrap();
        let second = c.submit("B", &prefs()).unwrap();
        assert_eq!(second.closed, Some(CloseReason::QuorumReached));
        assert_eq!(
            c.submit("C", &prefs()),
            Err(SubmissionError::SubmissionAfterClose)
        );
        assert_eq!(c.submissions().len(), 2);
    }

    #[test]
    fn duplicate_and_unknown_participants_rejected() {
        let c = collector(QuorumPolicy::All);
        c.submit("A", &prefs()).unwrap();
        assert_eq!(
            c.submit("A", &prefs()),
            Err(SubmissionError::DuplicateSubmission("A".into()))
        );
        assert_eq!(
            c.submit("Z", &prefs()),
            Err(SubmissionError::UnknownParticipant("Z".into()))
        );
        assert_eq!(c.status().submitted, 1);
    }

    #[test]
    fn participant_ids_are_trimmed() {
        let c = collector(QuorumPolicy::All);
        c.submit(" A ", &prefs()).unwrap();
        assert_eq!(
            c.submit("A", &prefs()),
            Err(SubmissionError::DuplicateSubmission("A".into()))
        );
        assert_eq!(c.submissions()[0].participant, "A");
    }

    #[test]
    fn invalid_payload_rejected_before_recording() {
        let c = collector(QuorumPolicy::All);
        let mut bad = prefs();
        bad.budget = BudgetRange::new(70, 10);
        assert!(matches!(
            c.submit("A", &bad),
            Err(SubmissionError::InvalidPreferenceSet(_))
        ));
        // The participant may still submit corrected data.
        assert!(c.submit("A", &prefs()).is_ok());
    }

    #[test]
    fn close_is_idempotent_and_keeps_first_reason() {
        let c = collector(QuorumPolicy::All);
        assert_eq!(
            c.close(CloseReason::DeadlineElapsed),
            CloseOutcome::Closed(CloseReason::DeadlineElapsed)
        );
        assert_eq!(
            c.close(CloseReason::ManualOverride),
            CloseOutcome::AlreadyClosed(CloseReason::DeadlineElapsed)
        );
        assert_eq!(
            c.submit("A", &prefs()),
            Err(SubmissionError::SubmissionAfterClose)
        );
    }

    #[test]
    fn abort_blocks_submissions_and_closure() {
        let c = collector(QuorumPolicy::All);
        assert!(c.abort());
        assert!(!c.abort());
        assert_eq!(c.close(CloseReason::DeadlineElapsed), CloseOutcome::Aborted);
        assert_eq!(
            c.submit("A", &prefs()),
            Err(SubmissionError::SubmissionAfterClose)
        );
        assert_eq!(c.status().phase, CollectionPhase::Aborted);
    }

    #[test]
    fn remaining_time_is_zero_after_close() {
        let c = collector(QuorumPolicy::All);
        assert!(c.status().remaining(Utc::now()) > Duration::ZERO);
        c.close(CloseReason::ManualOverride);
        assert_eq!(c.status().remaining(Utc::now()), Duration::ZERO);
    }

    #[test]
    fn restore_drops_strangers_and_duplicates() {
        let now = Utc::now();
        let set = |who: &str| accept_preferences(who, &prefs(), now);
        let c = SubmissionCollector::restore(
            invitees(&["A", "B"]),
            QuorumPolicy::All,
            now + chrono::Duration::minutes(5),
            vec![set("A"), set("A"), set("X")],
        );
        assert_eq!(c.status().submitted, 1);
        assert!(!c.quorum_met());
        assert_eq!(
            c.submit("A", &prefs()),
            Err(SubmissionError::DuplicateSubmission("A".into()))
        );
    }

    #[tokio::test]
    async fn subscribers_see_closure() {
        let c = collector(QuorumPolicy::AtLeast { count: 1 });
        let mut rx = c.subscribe();
        c.submit("B", &prefs()).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow().phase,
            CollectionPhase::Closed(CloseReason::QuorumReached)
        );
    }

    #[test]
    fn racing_threads_record_every_distinct_participant() {
        let ids: Vec<String> = (0..32).map(|i| format!("p{i}")).collect();
        let c = Arc::new(SubmissionCollector::new(
            ids.iter().cloned().collect(),
            QuorumPolicy::All,
            Utc::now() + chrono::Duration::hours(1),
        ));

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || c.submit(&id, &prefs()))
            })
            .collect();
        let receipts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(receipts.iter().all(|r| r.is_ok()));
        let closers = receipts
            .iter()
            .filter(|r| r.as_ref().unwrap().closed.is_some())
            .count();
        assert_eq!(closers, 1, "exactly one submission closes collection");
        assert_eq!(c.submissions().len(), 32);
    }

    #[test]
    fn racing_threads_same_participant_accepted_once() {
        let c = Arc::new(collector(QuorumPolicy::All));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || c.submit("A", &prefs()))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(SubmissionError::DuplicateSubmission(_))))
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(duplicates, 15);
    }
}
