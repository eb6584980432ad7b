//! Database query functions for the `event_sessions` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{SessionSnapshot, SessionState};

/// Insert or replace a session snapshot.
///
/// The write only lands when `snapshot.version` is newer than the stored
/// row's version. Returns `true` if the row was written, `false` if a newer
/// (or equal) version was already present.
pub async fn upsert_session(pool: &PgPool, snapshot: &SessionSnapshot) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO event_sessions \
             (id, state, constraints, quorum, deadline, submissions, close_reason, \
              result, version, created_at, updated_at, finalized_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now(), $11) \
         ON CONFLICT (id) DO UPDATE SET \
             state = EXCLUDED.state, \
             constraints = EXCLUDED.constraints, \
             quorum = EXCLUDED.quorum, \
             deadline = EXCLUDED.deadline, \
             submissions = EXCLUDED.submissions, \
             close_reason = EXCLUDED.close_reason, \
             result = EXCLUDED.result, \
             version = EXCLUDED.version, \
             updated_at = now(), \
             finalized_at = EXCLUDED.finalized_at \
         WHERE event_sessions.version < EXCLUDED.version",
    )
    .bind(snapshot.id)
    .bind(snapshot.state)
    .bind(&snapshot.constraints)
    .bind(&snapshot.quorum)
    .bind(snapshot.deadline)
    .bind(&snapshot.submissions)
    .bind(snapshot.close_reason)
    .bind(&snapshot.result)
    .bind(snapshot.version)
    .bind(snapshot.created_at)
    .bind(snapshot.finalized_at)
    .execute(pool)
    .await
    .with_context(|| format!("failed to upsert session {}", snapshot.id))?;

    Ok(result.rows_affected() == 1)
}

/// Fetch a session by ID.
pub async fn get_session(pool: &PgPool, id: Uuid) -> Result<Option<SessionSnapshot>> {
    let session =
        sqlx::query_as::<_, SessionSnapshot>("SELECT * FROM event_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch session")?;

    Ok(session)
}

/// Delete a session and everything collected for it. Returns `false` if no
/// such session existed.
pub async fn delete_session(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM event_sessions WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete session")?;

    Ok(result.rows_affected() > 0)
}

/// List all sessions, newest first.
pub async fn list_sessions(pool: &PgPool) -> Result<Vec<SessionSnapshot>> {
    let sessions = sqlx::query_as::<_, SessionSnapshot>(
        "SELECT * FROM event_sessions ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list sessions")?;

    Ok(sessions)
}

/// List sessions in a given state that have not been finalized, oldest first.
pub async fn list_sessions_in_state(
    pool: &PgPool,
    state: SessionState,
) -> Result<Vec<SessionSnapshot>> {
    let sessions = sqlx::query_as::<_, SessionSnapshot>(
        "SELECT * FROM event_sessions \
         WHERE state = $1 AND finalized_at IS NULL \
         ORDER BY created_at ASC",
    )
    .bind(state)
    .fetch_all(pool)
    .await
    .context("failed to list sessions by state")?;

    Ok(sessions)
}

/// Count sessions per lifecycle state.
pub async fn count_by_state(pool: &PgPool) -> Result<Vec<(SessionState, i64)>> {
    let rows: Vec<(SessionState, i64)> = sqlx::query_as(
        "SELECT state, COUNT(*) FROM event_sessions GROUP BY state ORDER BY state",
    )
    .fetch_all(pool)
    .await
    .context("failed to count sessions by state")?;

    Ok(rows)
}
