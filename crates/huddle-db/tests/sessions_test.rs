//! Integration tests for the `event_sessions` queries.
//!
//! Each test gets its own migrated database from `huddle-test-utils`.

use std::collections::BTreeSet;

use chrono::{Duration, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use huddle_db::models::{
    ActivityPreference, BudgetRange, CandidateMatch, CloseReason, MatchEvidence,
    OrganizerConstraints, PreferenceSet, QuorumPolicy, SessionSnapshot, SessionState,
};
use huddle_db::queries::sessions;
use huddle_test_utils::{create_test_db, drop_test_db};

fn labels(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn draft_snapshot() -> SessionSnapshot {
    let now = Utc::now();
    SessionSnapshot {
        id: Uuid::new_v4(),
        state: SessionState::Draft,
        constraints: Json(OrganizerConstraints {
            days: labels(&["Sat"]),
            time_slots: labels(&["Evening"]),
            activity: ActivityPreference::Open,
            budget: BudgetRange::new(20, 80),
            invitees: vec!["amy".into(), "ben".into()],
            location: Some("Downtown".into()),
            notes: None,
        }),
        quorum: None,
        deadline: None,
        submissions: Json(Vec::new()),
        close_reason: None,
        result: None,
        version: 1,
        created_at: now,
        updated_at: now,
        finalized_at: None,
    }
}

#[tokio::test]
async fn upsert_then_get_roundtrips_json_columns() {
    let (pool, db_name) = create_test_db().await;

    let snapshot = draft_snapshot();
    let written = sessions::upsert_session(&pool, &snapshot)
        .await
        .expect("upsert should succeed");
    assert!(written);

    let loaded = sessions::get_session(&pool, snapshot.id)
        .await
        .expect("get should succeed")
        .expect("session should exist");
    assert_eq!(loaded.state, SessionState::Draft);
    assert_eq!(loaded.constraints.0, snapshot.constraints.0);
    assert!(loaded.submissions.0.is_empty());
    assert_eq!(loaded.version, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn stale_version_does_not_overwrite() {
    let (pool, db_name) = create_test_db().await;

    let mut snapshot = draft_snapshot();
    sessions::upsert_session(&pool, &snapshot).await.unwrap();

    snapshot.state = SessionState::AwaitingSubmissions;
    snapshot.quorum = Some(Json(QuorumPolicy::All));
    snapshot.deadline = Some(Utc::now() + Duration::hours(1));
    snapshot.version = 3;
    assert!(sessions::upsert_session(&pool, &snapshot).await.unwrap());

    // A write computed before version 3 arrives late.
    let mut stale = snapshot.clone();
    stale.state = SessionState::Draft;
    stale.version = 2;
    let written = sessions::upsert_session(&pool, &stale).await.unwrap();
    assert!(!written, "older snapshot must be ignored");

    let loaded = sessions::get_session(&pool, snapshot.id).await.unwrap().unwrap();
    assert_eq!(loaded.state, SessionState::AwaitingSubmissions);
    assert_eq!(loaded.quorum.map(|q| q.0), Some(QuorumPolicy::All));
    assert_eq!(loaded.version, 3);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn ready_snapshot_keeps_result_and_reason() {
    let (pool, db_name) = create_test_db().await;

    let mut snapshot = draft_snapshot();
    snapshot.state = SessionState::Ready;
    snapshot.close_reason = Some(CloseReason::DeadlineElapsed);
    snapshot.submissions = Json(vec![PreferenceSet {
        participant: "amy".into(),
        activities: labels(&["Dinner"]),
        times: labels(&["Evening"]),
        budget: BudgetRange::new(10, 60),
        submitted_at: Utc::now(),
    }]);
    snapshot.result = Some(Json(vec![CandidateMatch {
        activity: "Dinner".into(),
        score: 1.0,
        rank: 1,
        evidence: MatchEvidence {
            participants: 1,
            activity_supporters: 1,
            time_supporters: 1,
            budget_supporters: 1,
        },
    }]));
    sessions::upsert_session(&pool, &snapshot).await.unwrap();

    let loaded = sessions::get_session(&pool, snapshot.id).await.unwrap().unwrap();
    assert_eq!(loaded.close_reason, Some(CloseReason::DeadlineElapsed));
    assert_eq!(loaded.submissions.0.len(), 1);
    let result = loaded.result.expect("result should be stored").0;
    assert_eq!(result[0].activity, "Dinner");
    assert_eq!(result[0].rank, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_in_state_skips_finalized_and_other_states() {
    let (pool, db_name) = create_test_db().await;

    let mut open = draft_snapshot();
    open.state = SessionState::AwaitingSubmissions;
    sessions::upsert_session(&pool, &open).await.unwrap();

    let draft = draft_snapshot();
    sessions::upsert_session(&pool, &draft).await.unwrap();

    let mut archived = draft_snapshot();
    archived.state = SessionState::AwaitingSubmissions;
    archived.finalized_at = Some(Utc::now());
    sessions::upsert_session(&pool, &archived).await.unwrap();

    let listed = sessions::list_sessions_in_state(&pool, SessionState::AwaitingSubmissions)
        .await
        .unwrap();
    let ids: Vec<Uuid> = listed.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![open.id]);

    let all = sessions::list_sessions(&pool).await.unwrap();
    assert_eq!(all.len(), 3);

    let counts = sessions::count_by_state(&pool).await.unwrap();
    let awaiting = counts
        .iter()
        .find(|(state, _)| *state == SessionState::AwaitingSubmissions)
        .map(|(_, n)| *n);
    assert_eq!(awaiting, Some(2));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn delete_reports_missing_rows() {
    let (pool, db_name) = create_test_db().await;

    let snapshot = draft_snapshot();
    sessions::upsert_session(&pool, &snapshot).await.unwrap();

    assert!(sessions::delete_session(&pool, snapshot.id).await.unwrap());
    assert!(!sessions::delete_session(&pool, snapshot.id).await.unwrap());
    assert!(sessions::get_session(&pool, snapshot.id).await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}
