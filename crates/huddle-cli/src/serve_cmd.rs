use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use huddle_core::collector::SubmitReceipt;
use huddle_core::session::SessionStatus;
use huddle_core::{ConsensusEngine, EngineError, SubmissionError};
use huddle_db::models::{
    CandidateMatch, CloseReason, OrganizerConstraints, ParticipantId, Preferences, QuorumPolicy,
};

type Engine = Arc<ConsensusEngine>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Validation(_)
            | EngineError::Submission(SubmissionError::UnknownParticipant(_))
            | EngineError::Submission(SubmissionError::InvalidPreferenceSet(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::State(_)
            | EngineError::Submission(SubmissionError::DuplicateSubmission(_))
            | EngineError::Submission(SubmissionError::SubmissionAfterClose)
            | EngineError::NotReady { .. } => StatusCode::CONFLICT,
            EngineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Store(e) => {
                tracing::error!(error = %format!("{e:#}"), "session store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            kind: err.kind(),
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message, "kind": self.kind });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct OpenRequest {
    pub deadline: DateTime<Utc>,
    #[serde(default = "default_quorum")]
    pub quorum: QuorumPolicy,
}

fn default_quorum() -> QuorumPolicy {
    QuorumPolicy::All
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub participant: ParticipantId,
    #[serde(flatten)]
    pub preferences: Preferences,
}

#[derive(Debug, Serialize)]
pub struct ReceiptResponse {
    pub submitted: usize,
    pub total: usize,
    pub closed: Option<CloseReason>,
}

impl From<SubmitReceipt> for ReceiptResponse {
    fn from(r: SubmitReceipt) -> Self {
        Self {
            submitted: r.submitted,
            total: r.total,
            closed: r.closed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CloseResponse {
    pub close_reason: CloseReason,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(engine: Engine) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route(
            "/api/sessions/{id}",
            get(get_status).delete(discard_session),
        )
        .route("/api/sessions/{id}/open", post(open_session))
        .route("/api/sessions/{id}/submissions", post(submit_preferences))
        .route("/api/sessions/{id}/result", get(get_result))
        .route("/api/sessions/{id}/cancel", post(cancel_session))
        .route("/api/sessions/{id}/close", post(close_session))
        .route("/api/sessions/{id}/finalize", post(finalize_session))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(engine: Engine, bind: &str, port: u16) -> Result<()> {
    let recovered = engine.recover_open_sessions().await?;
    if recovered > 0 {
        tracing::info!(count = recovered, "resumed sessions from store");
    }

    let app = build_router(Arc::clone(&engine));
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("huddle serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown();
    tracing::info!("huddle serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn create_session(
    State(engine): State<Engine>,
    Json(constraints): Json<OrganizerConstraints>,
) -> Result<impl IntoResponse, AppError> {
    let id = engine.create_session(constraints).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

async fn open_session(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
    Json(req): Json<OpenRequest>,
) -> Result<Json<SessionStatus>, AppError> {
    engine
        .open_for_submissions(id, req.deadline, req.quorum)
        .await?;
    Ok(Json(engine.get_status(id).await?))
}

async fn submit_preferences(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<ReceiptResponse>, AppError> {
    let receipt = engine
        .submit_preferences(id, &req.participant, req.preferences)
        .await?;
    Ok(Json(receipt.into()))
}

async fn get_status(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionStatus>, AppError> {
    Ok(Json(engine.get_status(id).await?))
}

async fn get_result(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<CandidateMatch>>, AppError> {
    Ok(Json(engine.get_result(id).await?))
}

async fn cancel_session(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    engine.cancel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn close_session(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
) -> Result<Json<CloseResponse>, AppError> {
    let close_reason = engine.close_now(id).await?;
    Ok(Json(CloseResponse { close_reason }))
}

async fn finalize_session(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    engine.finalize(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn discard_session(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    engine.discard(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
