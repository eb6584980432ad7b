//! `huddle status` and `huddle result` commands: inspect stored sessions.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use huddle_db::models::{SessionSnapshot, SessionState};
use huddle_db::queries::sessions as session_db;

/// Run the status command.
///
/// When `session_id` is `Some`, shows detailed status for that session.
/// When `None`, lists all sessions.
pub async fn run_status(pool: &PgPool, session_id: Option<&str>) -> Result<()> {
    match session_id {
        Some(id_str) => run_session_status(pool, id_str).await,
        None => run_overview(pool).await,
    }
}

/// Print the ranked result of a ready session.
pub async fn run_result(pool: &PgPool, session_id: &str) -> Result<()> {
    let session = fetch(pool, session_id).await?;

    let Some(result) = session.result.as_ref().map(|r| &r.0) else {
        println!("Session {} has no result yet (state {}).", session.id, session.state);
        return Ok(());
    };

    println!(
        "{:<5} {:<24} {:>6} {:>10} {:>6} {:>8}",
        "RANK", "ACTIVITY", "SCORE", "ACTIVITY", "TIME", "BUDGET"
    );
    println!("{}", "-".repeat(64));
    for candidate in result {
        let e = candidate.evidence;
        println!(
            "{:<5} {:<24} {:>6.3} {:>10} {:>6} {:>8}",
            candidate.rank,
            candidate.activity,
            candidate.score,
            format!("{}/{}", e.activity_supporters, e.participants),
            format!("{}/{}", e.time_supporters, e.participants),
            format!("{}/{}", e.budget_supporters, e.participants),
        );
    }

    Ok(())
}

async fn fetch(pool: &PgPool, id_str: &str) -> Result<SessionSnapshot> {
    let id = Uuid::parse_str(id_str).with_context(|| format!("invalid session ID: {id_str}"))?;
    session_db::get_session(pool, id)
        .await?
        .with_context(|| format!("session {id} not found"))
}

/// Show detailed status for a single session.
async fn run_session_status(pool: &PgPool, id_str: &str) -> Result<()> {
    let session = fetch(pool, id_str).await?;
    let constraints = &session.constraints.0;

    println!("Session: {}", session.id);
    println!("State: {}", session.state);
    println!(
        "Created: {}",
        session.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(finalized_at) = session.finalized_at {
        println!(
            "Finalized: {}",
            finalized_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    println!();

    let days: Vec<&str> = constraints.days.iter().map(String::as_str).collect();
    let slots: Vec<&str> = constraints.time_slots.iter().map(String::as_str).collect();
    println!("Days: {}", days.join(", "));
    println!("Time slots: {}", slots.join(", "));
    println!("Budget: {}", constraints.budget);
    if let Some(location) = &constraints.location {
        println!("Location: {location}");
    }
    println!();

    let submitted = session.submissions.0.len();
    let total = constraints.invitees.len();
    println!("Submissions: {submitted}/{total}");
    if let Some(quorum) = &session.quorum {
        println!("Quorum: {}", quorum.0);
    }
    if let Some(deadline) = session.deadline {
        let note = if session.state == SessionState::AwaitingSubmissions {
            let left = deadline - Utc::now();
            if left.num_seconds() > 0 {
                format!(" ({}m left)", left.num_minutes())
            } else {
                " (passed)".to_string()
            }
        } else {
            String::new()
        };
        println!(
            "Deadline: {}{note}",
            deadline.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(reason) = session.close_reason {
        println!("Closed: {reason}");
    }
    println!();

    println!("Invitees:");
    for invitee in &constraints.invitees {
        let mark = if session
            .submissions
            .0
            .iter()
            .any(|s| &s.participant == invitee)
        {
            "+"
        } else {
            "."
        };
        println!("  [{mark}] {invitee}");
    }

    Ok(())
}

/// List all sessions with a submission summary.
async fn run_overview(pool: &PgPool) -> Result<()> {
    let sessions = session_db::list_sessions(pool).await?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<22} {:>11} {:<20}",
        "ID", "STATE", "SUBMITTED", "CREATED"
    );
    println!("{}", "-".repeat(94));

    for session in &sessions {
        let state = if session.finalized_at.is_some() {
            format!("{} (final)", session.state)
        } else {
            session.state.to_string()
        };
        println!(
            "{:<38} {:<22} {:>11} {:<20}",
            session.id,
            state,
            format!(
                "{}/{}",
                session.submissions.0.len(),
                session.constraints.0.invitees.len()
            ),
            session.created_at.format("%Y-%m-%d %H:%M"),
        );
    }

    let counts = session_db::count_by_state(pool).await?;
    let summary: Vec<String> = counts
        .iter()
        .map(|(state, n)| format!("{state}={n}"))
        .collect();
    println!();
    println!("Totals: {}", summary.join(" "));

    Ok(())
}
