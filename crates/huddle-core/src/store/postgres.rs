//! PostgreSQL-backed session store.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use huddle_db::models::{SessionSnapshot, SessionState};
use huddle_db::queries::sessions as db;

use super::SessionStore;

/// Stores snapshots in the `event_sessions` table.
#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<bool> {
        db::upsert_session(&self.pool, snapshot).await
    }

    async fn load(&self, id: Uuid) -> Result<Option<SessionSnapshot>> {
        db::get_session(&self.pool, id).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        db::delete_session(&self.pool, id).await
    }

    async fn list_open(&self) -> Result<Vec<SessionSnapshot>> {
        db::list_sessions_in_state(&self.pool, SessionState::AwaitingSubmissions).await
    }
}
