//! Error taxonomy for the consensus engine.
//!
//! Every error is returned to the caller; the engine never retries on its own.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use huddle_db::models::{ParticipantId, SessionState};

/// Malformed organizer constraints or preference payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} contains a blank label")]
    BlankLabel { field: &'static str },

    #[error("unknown weekday label {0:?}")]
    UnknownWeekday(String),

    #[error("budget range [{min}, {max}] is inverted")]
    InvertedBudget { min: u32, max: u32 },

    #[error("invitee {0:?} is listed more than once")]
    DuplicateInvitee(ParticipantId),

    #[error("quorum of {count} is outside 1..={invitees}")]
    QuorumOutOfRange { count: usize, invitees: usize },

    #[error("deadline {0} is not in the future")]
    DeadlineNotInFuture(DateTime<Utc>),
}

/// Rejections from the submission collector.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    #[error("participant {0:?} is not on the invitee list")]
    UnknownParticipant(ParticipantId),

    #[error("participant {0:?} has already submitted")]
    DuplicateSubmission(ParticipantId),

    #[error("submissions are closed for this session")]
    SubmissionAfterClose,

    #[error("invalid preference set: {0}")]
    InvalidPreferenceSet(ValidationError),
}

/// An operation that is not allowed in the session's current state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {operation} a session in state {state}")]
pub struct StateError {
    pub operation: &'static str,
    pub state: SessionState,
}

impl StateError {
    pub fn new(operation: &'static str, state: SessionState) -> Self {
        Self { operation, state }
    }
}

/// Top-level error returned by [`crate::engine::ConsensusEngine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Submission(SubmissionError),

    #[error("session {id} has no result yet (state {state})")]
    NotReady { id: Uuid, state: SessionState },

    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<SubmissionError> for EngineError {
    /// A malformed payload is a validation problem regardless of which
    /// component noticed it.
    fn from(err: SubmissionError) -> Self {
        match err {
            SubmissionError::InvalidPreferenceSet(inner) => Self::Validation(inner),
            other => Self::Submission(other),
        }
    }
}

impl EngineError {
    /// Stable snake_case name of the error kind, for API consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::State(_) => "invalid_state",
            Self::Submission(SubmissionError::UnknownParticipant(_)) => "unknown_participant",
            Self::Submission(SubmissionError::DuplicateSubmission(_)) => "duplicate_submission",
            Self::Submission(SubmissionError::SubmissionAfterClose) => "submission_after_close",
            Self::Submission(SubmissionError::InvalidPreferenceSet(_)) => "validation",
            Self::NotReady { .. } => "not_ready",
            Self::SessionNotFound(_) => "not_found",
            Self::Store(_) => "store",
        }
    }
}
