//! Deadline timers: one tokio task per open session that closes collection
//! with `DeadlineElapsed` when the deadline passes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use huddle_db::models::CloseReason;

use crate::session::EventSession;
use crate::store::SessionStore;

/// An armed timer. The generation tells a finished task whether its slot
/// was re-armed in the meantime.
#[derive(Debug)]
struct Armed {
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct Slots {
    next_generation: u64,
    armed: HashMap<Uuid, Armed>,
}

/// Cancellation handles for armed deadline timers, keyed by session.
#[derive(Debug, Default, Clone)]
pub(crate) struct DeadlineTimers {
    slots: Arc<Mutex<Slots>>,
}

impl DeadlineTimers {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the timer task for `session`. Re-arming replaces (and stops)
    /// any timer already running for the same session.
    pub(crate) fn arm(&self, session: Arc<EventSession>, store: Arc<dyn SessionStore>) {
        let Some(deadline) = session.deadline() else {
            return;
        };
        let id = session.id();
        let token = CancellationToken::new();

        let generation = {
            let mut slots = self.lock();
            slots.next_generation += 1;
            let generation = slots.next_generation;
            let armed = Armed {
                generation,
                token: token.clone(),
            };
            if let Some(previous) = slots.armed.insert(id, armed) {
                previous.token.cancel();
            }
            generation
        };

        let timers = self.clone();
        tokio::spawn(async move {
            let wait = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = token.cancelled() => {
                    tracing::debug!(session_id = %id, "deadline timer stopped");
                    return;
                }
            }

            match session.close(CloseReason::DeadlineElapsed) {
                Ok(CloseReason::DeadlineElapsed) => {
                    tracing::info!(
                        session_id = %id,
                        reason = %CloseReason::DeadlineElapsed,
                        "deadline elapsed, session ready"
                    );
                }
                Ok(reason) => {
                    tracing::debug!(session_id = %id, reason = %reason, "session already closed");
                }
                Err(e) => {
                    tracing::debug!(session_id = %id, error = %e, "deadline fired on inactive session");
                }
            }

            if let Err(e) = session.persist(store.as_ref()).await {
                tracing::warn!(
                    session_id = %id,
                    error = %e,
                    "failed to persist session after deadline"
                );
            }

            let mut slots = timers.lock();
            if slots.armed.get(&id).is_some_and(|a| a.generation == generation) {
                slots.armed.remove(&id);
            }
        });
    }

    /// Stop the timer for a session, if one is armed.
    pub(crate) fn disarm(&self, id: Uuid) -> bool {
        match self.lock().armed.remove(&id) {
            Some(armed) => {
                armed.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop every armed timer.
    pub(crate) fn disarm_all(&self) {
        for (_, armed) in self.lock().armed.drain() {
            armed.token.cancel();
        }
    }

    pub(crate) fn armed(&self) -> usize {
        self.lock().armed.len()
    }
}
