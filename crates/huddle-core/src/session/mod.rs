//! Event session state machine.
//!
//! A session owns the organizer's constraints, its submission collector
//! once opened, and the ranked result once ready. Every mutation bumps the
//! session version so snapshots can be persisted with last-writer-wins
//! semantics keyed on version.
//!
//! Lock order is always session, then collector. The collector never calls
//! back into the session.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use tokio::sync::watch;
use uuid::Uuid;

use huddle_db::models::{
    CandidateMatch, CloseReason, OrganizerConstraints, Preferences, QuorumPolicy,
    SessionSnapshot, SessionState,
};

use crate::collector::{CollectorStatus, SubmissionCollector, SubmitReceipt};
use crate::error::{EngineError, StateError, SubmissionError};
use crate::ranker::{self, RankerConfig};
use crate::store::SessionStore;
use crate::validate::{
    invitee_set, normalize_constraints, validate_constraints, validate_deadline, validate_quorum,
};

/// The session state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// draft                -> awaiting_submissions  (open)
/// draft                -> cancelled
/// awaiting_submissions -> ready                 (collection closed, result ranked)
/// awaiting_submissions -> cancelled
/// ```
pub struct SessionStateMachine;

impl SessionStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in the
    /// state graph.
    pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
        matches!(
            (from, to),
            (SessionState::Draft, SessionState::AwaitingSubmissions)
                | (SessionState::Draft, SessionState::Cancelled)
                | (SessionState::AwaitingSubmissions, SessionState::Ready)
                | (SessionState::AwaitingSubmissions, SessionState::Cancelled)
        )
    }
}

/// Progress report for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub id: Uuid,
    pub state: SessionState,
    pub submitted: usize,
    pub total: usize,
    /// Whole seconds until the deadline; zero unless collection is open.
    pub remaining_secs: u64,
    pub deadline: Option<DateTime<Utc>>,
    pub quorum: Option<QuorumPolicy>,
    pub close_reason: Option<CloseReason>,
    pub finalized: bool,
}

impl SessionStatus {
    pub fn remaining(&self) -> Duration {
        Duration::from_secs(self.remaining_secs)
    }
}

struct SessionInner {
    state: SessionState,
    collector: Option<Arc<SubmissionCollector>>,
    close_reason: Option<CloseReason>,
    result: Option<Vec<CandidateMatch>>,
    version: i64,
    updated_at: DateTime<Utc>,
    finalized_at: Option<DateTime<Utc>>,
}

impl SessionInner {
    fn transition(&mut self, to: SessionState) {
        debug_assert!(SessionStateMachine::is_valid_transition(self.state, to));
        self.state = to;
        self.touch();
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

/// One planned gathering moving through draft, collection, and result.
pub struct EventSession {
    id: Uuid,
    constraints: OrganizerConstraints,
    created_at: DateTime<Utc>,
    ranker: RankerConfig,
    inner: Mutex<SessionInner>,
    /// Serializes store writes; `true` once the session has been discarded.
    discarded: tokio::sync::Mutex<bool>,
}

impl EventSession {
    /// Create a draft session. Constraints are validated and trimmed.
    pub fn new(
        constraints: OrganizerConstraints,
        ranker: RankerConfig,
    ) -> Result<Self, EngineError> {
        validate_constraints(&constraints)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            constraints: normalize_constraints(constraints),
            created_at: now,
            ranker,
            inner: Mutex::new(SessionInner {
                state: SessionState::Draft,
                collector: None,
                close_reason: None,
                result: None,
                version: 1,
                updated_at: now,
                finalized_at: None,
            }),
            discarded: tokio::sync::Mutex::new(false),
        })
    }

    /// Rebuild a session from a persisted snapshot.
    ///
    /// An `awaiting_submissions` snapshot gets an open collector holding the
    /// recorded submissions; the caller decides whether it should close
    /// right away (see [`Self::pending_close`]).
    pub fn restore(snapshot: SessionSnapshot, ranker: RankerConfig) -> Self {
        let constraints = snapshot.constraints.0;
        let collector = match (snapshot.quorum, snapshot.deadline) {
            (Some(Json(quorum)), Some(deadline)) => {
                let collector = SubmissionCollector::restore(
                    invitee_set(&constraints),
                    quorum,
                    deadline,
                    snapshot.submissions.0,
                );
                match snapshot.state {
                    SessionState::Ready => {
                        let reason = snapshot.close_reason.unwrap_or(CloseReason::ManualOverride);
                        collector.close(reason);
                    }
                    SessionState::Cancelled => {
                        collector.abort();
                    }
                    SessionState::Draft | SessionState::AwaitingSubmissions => {}
                }
                Some(Arc::new(collector))
            }
            _ => None,
        };

        Self {
            id: snapshot.id,
            constraints,
            created_at: snapshot.created_at,
            ranker,
            inner: Mutex::new(SessionInner {
                state: snapshot.state,
                collector,
                close_reason: snapshot.close_reason,
                result: snapshot.result.map(|r| r.0),
                version: snapshot.version,
                updated_at: snapshot.updated_at,
                finalized_at: snapshot.finalized_at,
            }),
            discarded: tokio::sync::Mutex::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn constraints(&self) -> &OrganizerConstraints {
        &self.constraints
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn version(&self) -> i64 {
        self.lock().version
    }

    pub fn is_finalized(&self) -> bool {
        self.lock().finalized_at.is_some()
    }

    /// Collection deadline, once opened.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.lock().collector.as_ref().map(|c| c.deadline())
    }

    /// Watch collector progress. `None` before the session is opened.
    pub fn subscribe(&self) -> Option<watch::Receiver<CollectorStatus>> {
        self.lock().collector.as_ref().map(|c| c.subscribe())
    }

    /// Start collecting preferences under a quorum policy and deadline.
    pub fn open(
        &self,
        deadline: DateTime<Utc>,
        quorum: QuorumPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Draft {
            return Err(StateError::new("open", inner.state).into());
        }
        validate_quorum(quorum, self.constraints.invitees.len())?;
        validate_deadline(deadline, now)?;

        inner.collector = Some(Arc::new(SubmissionCollector::new(
            invitee_set(&self.constraints),
            quorum,
            deadline,
        )));
        inner.transition(SessionState::AwaitingSubmissions);
        Ok(())
    }

    /// Record a participant's preferences.
    ///
    /// The session lock is released while the collector records the
    /// submission so concurrent submitters only contend on the collector.
    /// If this submission satisfies the quorum, the session is ranked and
    /// moves to `ready` before this returns.
    pub fn submit(
        &self,
        participant: &str,
        preferences: &Preferences,
    ) -> Result<SubmitReceipt, EngineError> {
        let collector = {
            let inner = self.lock();
            match (inner.state, &inner.collector) {
                (SessionState::Draft, _) => {
                    return Err(StateError::new("submit to", SessionState::Draft).into());
                }
                (_, Some(collector)) => Arc::clone(collector),
                (_, None) => return Err(SubmissionError::SubmissionAfterClose.into()),
            }
        };

        let receipt = collector.submit(participant, preferences)?;

        match receipt.closed {
            Some(reason) => {
                if self.complete(reason) {
                    tracing::info!(
                        session_id = %self.id,
                        reason = %reason,
                        submitted = receipt.submitted,
                        "quorum reached, session ready"
                    );
                }
            }
            None => self.lock().touch(),
        }

        Ok(receipt)
    }

    /// Rank the collected submissions and move to `ready`.
    ///
    /// Only the first call after the collector closes does anything; it
    /// returns `true`. A session cancelled in the meantime stays cancelled.
    pub(crate) fn complete(&self, reason: CloseReason) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::AwaitingSubmissions {
            return false;
        }
        let submissions = inner
            .collector
            .as_ref()
            .map(|c| c.submissions())
            .unwrap_or_default();
        inner.result = Some(ranker::rank(&self.constraints, &submissions, &self.ranker));
        inner.close_reason = Some(reason);
        inner.transition(SessionState::Ready);
        true
    }

    /// Stop collection now and rank whatever was submitted.
    ///
    /// Returns the reason the session actually closed for, which differs
    /// from `reason` when it had already closed.
    pub fn close(&self, reason: CloseReason) -> Result<CloseReason, EngineError> {
        let collector = {
            let inner = self.lock();
            match (inner.state, &inner.collector) {
                (SessionState::Ready, _) => {
                    return Ok(inner.close_reason.unwrap_or(reason));
                }
                (SessionState::AwaitingSubmissions, Some(collector)) => Arc::clone(collector),
                (state, _) => return Err(StateError::new("close", state).into()),
            }
        };

        if let Some(closed_for) = collector.close(reason).reason() {
            self.complete(closed_for);
        }

        let inner = self.lock();
        match (inner.state, inner.close_reason) {
            (SessionState::Ready, Some(closed_for)) => Ok(closed_for),
            (state, _) => Err(StateError::new("close", state).into()),
        }
    }

    /// Close for the reason a restored session is already due for, if any.
    pub fn pending_close(&self, now: DateTime<Utc>) -> Option<CloseReason> {
        let inner = self.lock();
        if inner.state != SessionState::AwaitingSubmissions {
            return None;
        }
        let collector = inner.collector.as_ref()?;
        if collector.quorum_met() {
            Some(CloseReason::QuorumReached)
        } else if collector.deadline() <= now {
            Some(CloseReason::DeadlineElapsed)
        } else {
            None
        }
    }

    /// Cancel the session. Pending and future submissions are rejected and
    /// no result is produced.
    pub fn cancel(&self) -> Result<(), EngineError> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Draft | SessionState::AwaitingSubmissions => {
                if let Some(collector) = &inner.collector {
                    collector.abort();
                }
                inner.transition(SessionState::Cancelled);
                Ok(())
            }
            state => Err(StateError::new("cancel", state).into()),
        }
    }

    /// Archive a ready session. Finalizing twice is a no-op.
    pub fn finalize(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.state != SessionState::Ready {
            return Err(StateError::new("finalize", inner.state).into());
        }
        if inner.finalized_at.is_none() {
            inner.finalized_at = Some(now);
            inner.touch();
        }
        Ok(())
    }

    pub fn status(&self, now: DateTime<Utc>) -> SessionStatus {
        let inner = self.lock();
        let collected = inner.collector.as_ref().map(|c| c.status());
        SessionStatus {
            id: self.id,
            state: inner.state,
            submitted: collected.map_or(0, |s| s.submitted),
            total: self.constraints.invitees.len(),
            remaining_secs: collected.map_or(0, |s| s.remaining(now).as_secs()),
            deadline: collected.map(|s| s.deadline),
            quorum: inner.collector.as_ref().map(|c| c.quorum()),
            close_reason: inner.close_reason,
            finalized: inner.finalized_at.is_some(),
        }
    }

    /// Ranked candidates. Only available once the session is `ready`.
    pub fn result(&self) -> Result<Vec<CandidateMatch>, EngineError> {
        let inner = self.lock();
        match (inner.state, &inner.result) {
            (SessionState::Ready, Some(result)) => Ok(result.clone()),
            (state, _) => Err(EngineError::NotReady { id: self.id, state }),
        }
    }

    /// Persistable copy of the current state.
    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.lock();
        let collector = inner.collector.as_ref();
        SessionSnapshot {
            id: self.id,
            state: inner.state,
            constraints: Json(self.constraints.clone()),
            quorum: collector.map(|c| Json(c.quorum())),
            deadline: collector.map(|c| c.deadline()),
            submissions: Json(collector.map(|c| c.submissions()).unwrap_or_default()),
            close_reason: inner.close_reason,
            result: inner.result.clone().map(Json),
            version: inner.version,
            created_at: self.created_at,
            updated_at: inner.updated_at,
            finalized_at: inner.finalized_at,
        }
    }
}

impl EventSession {
    /// Save the current snapshot. Skipped once the session is discarded, so
    /// a late writer cannot bring a deleted session back.
    ///
    /// Returns whether the store accepted the snapshot.
    pub async fn persist(&self, store: &dyn SessionStore) -> anyhow::Result<bool> {
        let discarded = self.discarded.lock().await;
        if *discarded {
            return Ok(false);
        }
        store.save(&self.snapshot()).await
    }

    /// Delete the session from the store and refuse every later save.
    ///
    /// Returns `false` if the store held no row for it.
    pub async fn discard(&self, store: &dyn SessionStore) -> anyhow::Result<bool> {
        let mut discarded = self.discarded.lock().await;
        *discarded = true;
        store.delete(self.id).await
    }
}

impl std::fmt::Debug for EventSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("EventSession")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("version", &inner.version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use huddle_db::models::{ActivityPreference, BudgetRange};

    fn labels(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn constraints(invitees: &[&str]) -> OrganizerConstraints {
        OrganizerConstraints {
            days: labels(&["Sat"]),
            time_slots: labels(&["Evening"]),
            activity: ActivityPreference::Open,
            budget: BudgetRange::new(20, 80),
            invitees: invitees.iter().map(|s| s.to_string()).collect(),
            location: None,
            notes: None,
        }
    }

    fn prefs(activity: &str) -> Preferences {
        Preferences {
            activities: labels(&[activity]),
            times: labels(&["Evening"]),
            budget: BudgetRange::new(20, 60),
        }
    }

    fn opened(invitees: &[&str], quorum: QuorumPolicy) -> EventSession {
        let session = EventSession::new(constraints(invitees), RankerConfig::default()).unwrap();
        let now = Utc::now();
        session
            .open(now + chrono::Duration::hours(1), quorum, now)
            .unwrap();
        session
    }

    #[test]
    fn transition_table() {
        use SessionState::*;
        assert!(SessionStateMachine::is_valid_transition(Draft, AwaitingSubmissions));
        assert!(SessionStateMachine::is_valid_transition(Draft, Cancelled));
        assert!(SessionStateMachine::is_valid_transition(AwaitingSubmissions, Ready));
        assert!(SessionStateMachine::is_valid_transition(AwaitingSubmissions, Cancelled));
        assert!(!SessionStateMachine::is_valid_transition(Draft, Ready));
        assert!(!SessionStateMachine::is_valid_transition(Ready, AwaitingSubmissions));
        assert!(!SessionStateMachine::is_valid_transition(Cancelled, Draft));
        assert!(!SessionStateMachine::is_valid_transition(Ready, Cancelled));
    }

    #[test]
    fn submit_to_draft_is_a_state_error() {
        let session = EventSession::new(constraints(&["A"]), RankerConfig::default()).unwrap();
        let err = session.submit("A", &prefs("Dinner")).unwrap_err();
        assert!(matches!(err, EngineError::State(_)));
    }

    #[test]
    fn open_twice_is_a_state_error() {
        let session = opened(&["A"], QuorumPolicy::All);
        let now = Utc::now();
        let err = session
            .open(now + chrono::Duration::hours(1), QuorumPolicy::All, now)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
    }

    #[test]
    fn open_validates_quorum_and_deadline() {
        let session = EventSession::new(constraints(&["A", "B"]), RankerConfig::default()).unwrap();
        let now = Utc::now();
        let err = session
            .open(now + chrono::Duration::hours(1), QuorumPolicy::AtLeast { count: 3 }, now)
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = session
            .open(now - chrono::Duration::seconds(1), QuorumPolicy::All, now)
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(session.state(), SessionState::Draft);
    }

    #[test]
    fn quorum_moves_session_to_ready() {
        let session = opened(&["A", "B"], QuorumPolicy::All);
        let v0 = session.version();
        session.submit("A", &prefs("Dinner")).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingSubmissions);
        assert!(session.version() > v0);
        assert!(matches!(
            session.result(),
            Err(EngineError::NotReady { .. })
        ));

        session.submit("B", &prefs("Dinner")).unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        let status = session.status(Utc::now());
        assert_eq!(status.close_reason, Some(CloseReason::QuorumReached));
        assert_eq!(status.remaining_secs, 0);
        assert_eq!(session.result().unwrap()[0].activity, "Dinner");
    }

    #[test]
    fn cancel_rejects_later_submissions() {
        let session = opened(&["A", "B"], QuorumPolicy::All);
        session.cancel().unwrap();
        let err = session.submit("A", &prefs("Dinner")).unwrap_err();
        assert_eq!(err.kind(), "submission_after_close");
        assert_eq!(session.cancel().unwrap_err().kind(), "invalid_state");
    }

    #[test]
    fn draft_can_be_cancelled() {
        let session = EventSession::new(constraints(&["A"]), RankerConfig::default()).unwrap();
        session.cancel().unwrap();
        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(
            session.submit("A", &prefs("Dinner")).unwrap_err().kind(),
            "submission_after_close"
        );
    }

    #[test]
    fn close_keeps_first_reason() {
        let session = opened(&["A", "B"], QuorumPolicy::All);
        assert_eq!(
            session.close(CloseReason::ManualOverride).unwrap(),
            CloseReason::ManualOverride
        );
        assert_eq!(
            session.close(CloseReason::DeadlineElapsed).unwrap(),
            CloseReason::ManualOverride
        );
        // No submissions: the organizer's own constraints are ranked.
        assert_eq!(session.result().unwrap().len(), 5);
    }

    #[test]
    fn finalize_requires_ready() {
        let session = opened(&["A"], QuorumPolicy::All);
        assert!(session.finalize(Utc::now()).is_err());
        session.submit("A", &prefs("Movie")).unwrap();
        session.finalize(Utc::now()).unwrap();
        let v = session.version();
        session.finalize(Utc::now()).unwrap();
        assert_eq!(session.version(), v);
        assert!(session.is_finalized());
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let session = opened(&["A", "B", "C"], QuorumPolicy::AtLeast { count: 2 });
        session.submit("A", &prefs("Dinner")).unwrap();

        let restored = EventSession::restore(session.snapshot(), RankerConfig::default());
        assert_eq!(restored.id(), session.id());
        assert_eq!(restored.version(), session.version());
        assert_eq!(restored.state(), SessionState::AwaitingSubmissions);
        assert_eq!(restored.pending_close(Utc::now()), None);
        assert_eq!(
            restored.submit("A", &prefs("Dinner")).unwrap_err().kind(),
            "duplicate_submission"
        );
        restored.submit("B", &prefs("Movie")).unwrap();
        assert_eq!(restored.state(), SessionState::Ready);
    }

    #[test]
    fn restored_session_past_deadline_is_due() {
        let session = opened(&["A", "B"], QuorumPolicy::All);
        let mut snapshot = session.snapshot();
        snapshot.deadline = Some(Utc::now() - chrono::Duration::minutes(1));
        let restored = EventSession::restore(snapshot, RankerConfig::default());
        assert_eq!(
            restored.pending_close(Utc::now()),
            Some(CloseReason::DeadlineElapsed)
        );
    }

    #[test]
    fn concurrent_submitters_rank_exactly_once() {
        let ids: Vec<String> = (0..24).map(|i| format!("guest{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let session = Arc::new(opened(&refs, QuorumPolicy::AtLeast { count: 12 }));
        let start_version = session.version();

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || session.submit(&id, &prefs("Dinner")))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        let late = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.kind() == "submission_after_close"))
            .count();
        assert_eq!(accepted, 12);
        assert_eq!(late, 12);

        let closers = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .filter(|r| r.closed.is_some())
            .count();
        assert_eq!(closers, 1);

        assert_eq!(session.state(), SessionState::Ready);
        let result = session.result().unwrap();
        assert_eq!(result[0].evidence.participants, 12);
        // 11 plain submissions plus one submission that also ranked.
        assert_eq!(session.version(), start_version + 12);
    }

    #[tokio::test]
    async fn discarded_session_is_never_saved_again() {
        let store = crate::store::MemorySessionStore::new();
        let session = opened(&["A", "B"], QuorumPolicy::All);
        assert!(session.persist(&store).await.unwrap());

        assert!(session.discard(&store).await.unwrap());
        session.submit("A", &prefs("Dinner")).unwrap();
        assert!(!session.persist(&store).await.unwrap());
        assert!(store.load(session.id()).await.unwrap().is_none());
    }
}
