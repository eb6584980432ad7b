//! Consensus engine: the entry point the planning wizard talks to.
//!
//! The engine keeps live sessions in an in-memory registry, persists a
//! snapshot through the configured [`SessionStore`] after every mutation,
//! and runs one deadline timer per session that is collecting submissions.

mod timer;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use huddle_db::models::{
    CandidateMatch, CloseReason, OrganizerConstraints, Preferences, QuorumPolicy, SessionState,
};

use crate::collector::{CollectorStatus, SubmitReceipt};
use crate::error::EngineError;
use crate::ranker::{DEFAULT_MAX_CANDIDATES, RankerConfig};
use crate::session::{EventSession, SessionStatus};
use crate::store::SessionStore;

use self::timer::DeadlineTimers;

/// Engine tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of ranked candidates returned per session. Values
    /// below one are raised to one.
    pub max_candidates: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }
}

impl EngineConfig {
    fn ranker(&self) -> RankerConfig {
        RankerConfig {
            max_candidates: self.max_candidates.max(1),
        }
    }
}

/// Live sessions plus the ids discarded during this process's lifetime.
#[derive(Default)]
struct Registry {
    live: HashMap<Uuid, Arc<EventSession>>,
    discarded: HashSet<Uuid>,
}

/// Outcome of offering a loaded session to the registry.
enum Claim {
    /// This caller's copy is now the live one.
    Inserted(Arc<EventSession>),
    /// Another caller registered the session first.
    Existing(Arc<EventSession>),
    Discarded,
}

/// Session lifecycle service.
pub struct ConsensusEngine {
    store: Arc<dyn SessionStore>,
    config: EngineConfig,
    registry: RwLock<Registry>,
    timers: DeadlineTimers,
}

impl ConsensusEngine {
    pub fn new(store: Arc<dyn SessionStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            registry: RwLock::new(Registry::default()),
            timers: DeadlineTimers::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Number of sessions held in the live registry.
    pub fn live_sessions(&self) -> usize {
        self.read().live.len()
    }

    /// Number of armed deadline timers.
    pub fn armed_timers(&self) -> usize {
        self.timers.armed()
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Create a draft session from the organizer's constraints.
    pub async fn create_session(
        &self,
        constraints: OrganizerConstraints,
    ) -> Result<Uuid, EngineError> {
        let session = Arc::new(EventSession::new(constraints, self.config.ranker())?);
        let id = session.id();
        session.persist(self.store.as_ref()).await?;
        self.claim(session);

        tracing::info!(session_id = %id, "session created");
        Ok(id)
    }

    /// Open a draft session for submissions and arm its deadline timer.
    pub async fn open_for_submissions(
        &self,
        id: Uuid,
        deadline: DateTime<Utc>,
        quorum: QuorumPolicy,
    ) -> Result<(), EngineError> {
        let session = self.session(id).await?;
        session.open(deadline, quorum, Utc::now())?;
        self.persist(&session).await;
        self.timers.arm(Arc::clone(&session), Arc::clone(&self.store));

        tracing::info!(
            session_id = %id,
            quorum = %quorum,
            deadline = %deadline,
            "session open for submissions"
        );
        Ok(())
    }

    /// Record one participant's preferences.
    ///
    /// Once the submission is recorded the receipt is returned even if the
    /// snapshot could not be written; the failure is logged.
    pub async fn submit_preferences(
        &self,
        id: Uuid,
        participant: &str,
        preferences: Preferences,
    ) -> Result<SubmitReceipt, EngineError> {
        let session = self.session(id).await?;
        let receipt = match session.submit(participant, &preferences) {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::warn!(
                    session_id = %id,
                    participant = %participant,
                    kind = e.kind(),
                    error = %e,
                    "submission rejected"
                );
                return Err(e);
            }
        };

        tracing::debug!(
            session_id = %id,
            participant = %participant,
            submitted = receipt.submitted,
            total = receipt.total,
            "submission accepted"
        );

        if receipt.closed.is_some() {
            self.timers.disarm(id);
        }
        self.persist(&session).await;
        Ok(receipt)
    }

    pub async fn get_status(&self, id: Uuid) -> Result<SessionStatus, EngineError> {
        Ok(self.session(id).await?.status(Utc::now()))
    }

    /// Ranked candidates for a ready session.
    pub async fn get_result(&self, id: Uuid) -> Result<Vec<CandidateMatch>, EngineError> {
        self.session(id).await?.result()
    }

    /// Progress updates for a session that has been opened.
    pub async fn subscribe(
        &self,
        id: Uuid,
    ) -> Result<Option<watch::Receiver<CollectorStatus>>, EngineError> {
        Ok(self.session(id).await?.subscribe())
    }

    /// Cancel a draft or collecting session.
    pub async fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        let session = self.session(id).await?;
        session.cancel()?;
        self.timers.disarm(id);
        self.persist(&session).await;

        tracing::info!(session_id = %id, "session cancelled");
        Ok(())
    }

    /// End collection early and rank what has been submitted.
    ///
    /// Returns the reason the session closed for; that is the original
    /// reason when it had already closed.
    pub async fn close_now(&self, id: Uuid) -> Result<CloseReason, EngineError> {
        let session = self.session(id).await?;
        let reason = session.close(CloseReason::ManualOverride)?;
        self.timers.disarm(id);
        self.persist(&session).await;

        tracing::info!(session_id = %id, reason = %reason, "session closed by organizer");
        Ok(reason)
    }

    /// Archive a ready session and drop it from the live registry. It can
    /// still be read back from the store.
    ///
    /// A session whose archived snapshot could not be written stays live.
    pub async fn finalize(&self, id: Uuid) -> Result<(), EngineError> {
        let session = self.session(id).await?;
        session.finalize(Utc::now())?;
        if self.persist(&session).await {
            self.unregister(id);
        }

        tracing::info!(session_id = %id, "session finalized");
        Ok(())
    }

    /// Delete a session in any state, from the registry and the store.
    ///
    /// The id stays retired: writers still holding the session skip their
    /// saves and later lookups report it as not found.
    pub async fn discard(&self, id: Uuid) -> Result<(), EngineError> {
        self.timers.disarm(id);
        let live = self.retire(id);
        let stored = match &live {
            Some(session) => {
                // Rejects submitters still holding the session.
                let _ = session.cancel();
                session.discard(self.store.as_ref()).await?
            }
            None => self.store.delete(id).await?,
        };
        if live.is_none() && !stored {
            return Err(EngineError::SessionNotFound(id));
        }

        tracing::info!(session_id = %id, "session discarded");
        Ok(())
    }

    /// Reload sessions that were collecting when the process last stopped.
    ///
    /// Sessions whose quorum is already met or whose deadline has passed
    /// are closed right away; the rest get their deadline timer re-armed.
    /// Returns the number of sessions recovered.
    pub async fn recover_open_sessions(&self) -> Result<usize, EngineError> {
        let snapshots = self.store.list_open().await?;
        let mut recovered = 0;
        for snapshot in snapshots {
            let session = Arc::new(EventSession::restore(snapshot, self.config.ranker()));
            let closed = Self::settle(&session);
            if let Claim::Inserted(session) = self.claim(session) {
                self.adopt(&session, closed).await;
                recovered += 1;
            }
        }

        if recovered > 0 {
            tracing::info!(count = recovered, "recovered open sessions");
        }
        Ok(recovered)
    }

    /// Stop every deadline timer. Sessions stay in the store and can be
    /// recovered by the next process.
    pub fn shutdown(&self) {
        self.timers.disarm_all();
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Look a session up in the registry, falling back to the store.
    ///
    /// Finalized sessions are returned but not cached. When several callers
    /// load the same session at once only the first copy is registered and
    /// adopted; the others get that copy back.
    async fn session(&self, id: Uuid) -> Result<Arc<EventSession>, EngineError> {
        if let Some(session) = self.registered(id)? {
            return Ok(session);
        }

        let snapshot = self
            .store
            .load(id)
            .await?
            .ok_or(EngineError::SessionNotFound(id))?;
        let session = Arc::new(EventSession::restore(snapshot, self.config.ranker()));
        if session.is_finalized() {
            return Ok(session);
        }

        let closed = Self::settle(&session);
        match self.claim(session) {
            Claim::Inserted(session) => {
                self.adopt(&session, closed).await;
                Ok(session)
            }
            Claim::Existing(session) => Ok(session),
            Claim::Discarded => Err(EngineError::SessionNotFound(id)),
        }
    }

    /// Close a restored session whose quorum is met or whose deadline has
    /// passed. Returns the reason it closed for.
    fn settle(session: &EventSession) -> Option<CloseReason> {
        let reason = session.pending_close(Utc::now())?;
        session.close(reason).ok()
    }

    /// Finish taking over a freshly registered session: persist a close that
    /// happened on load, or arm the deadline timer.
    async fn adopt(&self, session: &Arc<EventSession>, closed: Option<CloseReason>) {
        match closed {
            Some(reason) => {
                self.persist(session).await;
                tracing::info!(
                    session_id = %session.id(),
                    reason = %reason,
                    "restored session closed on load"
                );
            }
            None if session.state() == SessionState::AwaitingSubmissions => {
                self.timers
                    .arm(Arc::clone(session), Arc::clone(&self.store));
            }
            None => {}
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    fn registered(&self, id: Uuid) -> Result<Option<Arc<EventSession>>, EngineError> {
        let registry = self.read();
        if registry.discarded.contains(&id) {
            return Err(EngineError::SessionNotFound(id));
        }
        Ok(registry.live.get(&id).cloned())
    }

    /// Register `session` unless its id is already live or was discarded.
    fn claim(&self, session: Arc<EventSession>) -> Claim {
        let mut registry = self.write();
        let id = session.id();
        if registry.discarded.contains(&id) {
            return Claim::Discarded;
        }
        match registry.live.get(&id) {
            Some(existing) => Claim::Existing(Arc::clone(existing)),
            None => {
                registry.live.insert(id, Arc::clone(&session));
                Claim::Inserted(session)
            }
        }
    }

    fn unregister(&self, id: Uuid) -> Option<Arc<EventSession>> {
        self.write().live.remove(&id)
    }

    /// Drop a session from the registry and refuse to load it again.
    fn retire(&self, id: Uuid) -> Option<Arc<EventSession>> {
        let mut registry = self.write();
        registry.discarded.insert(id);
        registry.live.remove(&id)
    }

    /// Write the session's snapshot after an in-memory transition. The
    /// transition stands either way; a store failure is logged.
    async fn persist(&self, session: &EventSession) -> bool {
        match session.persist(self.store.as_ref()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id(),
                    state = %session.state(),
                    error = %e,
                    "failed to persist session"
                );
                false
            }
        }
    }
}

impl Drop for ConsensusEngine {
    fn drop(&mut self) {
        self.timers.disarm_all();
    }
}
