//! In-process session store.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use huddle_db::models::{SessionSnapshot, SessionState};

use super::SessionStore;

/// Keeps snapshots in a map. Nothing survives the process; used for tests
/// and `huddle serve --memory`.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    snapshots: RwLock<HashMap<Uuid, SessionSnapshot>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<bool> {
        let mut snapshots = self.snapshots.write().await;
        match snapshots.get(&snapshot.id) {
            Some(existing) if existing.version >= snapshot.version => Ok(false),
            _ => {
                snapshots.insert(snapshot.id, snapshot.clone());
                Ok(true)
            }
        }
    }

    async fn load(&self, id: Uuid) -> Result<Option<SessionSnapshot>> {
        Ok(self.snapshots.read().await.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.snapshots.write().await.remove(&id).is_some())
    }

    async fn list_open(&self) -> Result<Vec<SessionSnapshot>> {
        let mut open: Vec<SessionSnapshot> = self
            .snapshots
            .read()
            .await
            .values()
            .filter(|s| s.state == SessionState::AwaitingSubmissions && s.finalized_at.is_none())
            .cloned()
            .collect();
        open.sort_by_key(|s| s.created_at);
        Ok(open)
    }
}
