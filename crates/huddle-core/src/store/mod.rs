//! Persistence seam for event sessions.
//!
//! The engine keeps live sessions in memory and writes a snapshot through a
//! [`SessionStore`] after every mutation. Stores must keep the snapshot with
//! the highest version: a save carrying an older version is dropped.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use huddle_db::models::SessionSnapshot;

pub use memory::MemorySessionStore;
pub use postgres::PgSessionStore;

/// Durable home for session snapshots.
///
/// Object-safe so the engine can hold an `Arc<dyn SessionStore>`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a snapshot. Returns `false` if a snapshot with the same or a
    /// newer version was already stored.
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<bool>;

    /// Fetch the latest snapshot of a session.
    async fn load(&self, id: Uuid) -> Result<Option<SessionSnapshot>>;

    /// Remove a session. Returns `false` if it was not stored.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Sessions still collecting submissions and not finalized, oldest first.
    async fn list_open(&self) -> Result<Vec<SessionSnapshot>>;
}
