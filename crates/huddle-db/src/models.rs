use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

/// Identifier of an invitee. Opaque to the engine; the wizard decides what
/// goes in here (a nickname, an email, a contact id).
pub type ParticipantId = String;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of an event session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Draft,
    AwaitingSubmissions,
    Ready,
    Cancelled,
}

impl SessionState {
    /// `Ready` and `Cancelled` have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::AwaitingSubmissions => "awaiting_submissions",
            Self::Ready => "ready",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionState {
    type Err = SessionStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "awaiting_submissions" => Ok(Self::AwaitingSubmissions),
            "ready" => Ok(Self::Ready),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(SessionStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SessionState`] string.
#[derive(Debug, Clone)]
pub struct SessionStateParseError(pub String);

impl fmt::Display for SessionStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session state: {:?}", self.0)
    }
}

impl std::error::Error for SessionStateParseError {}

// ---------------------------------------------------------------------------

/// Why submission collection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    QuorumReached,
    DeadlineElapsed,
    ManualOverride,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::QuorumReached => "quorum_reached",
            Self::DeadlineElapsed => "deadline_elapsed",
            Self::ManualOverride => "manual_override",
        };
        f.write_str(s)
    }
}

impl FromStr for CloseReason {
    type Err = CloseReasonParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quorum_reached" => Ok(Self::QuorumReached),
            "deadline_elapsed" => Ok(Self::DeadlineElapsed),
            "manual_override" => Ok(Self::ManualOverride),
            other => Err(CloseReasonParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CloseReason`] string.
#[derive(Debug, Clone)]
pub struct CloseReasonParseError(pub String);

impl fmt::Display for CloseReasonParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid close reason: {:?}", self.0)
    }
}

impl std::error::Error for CloseReasonParseError {}

// ---------------------------------------------------------------------------

/// How many submissions allow collection to close before the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Every invitee must submit.
    All,
    /// At least `count` invitees must submit.
    AtLeast { count: usize },
}

impl QuorumPolicy {
    /// Number of submissions that satisfies this policy for `total` invitees.
    pub fn required(self, total: usize) -> usize {
        match self {
            Self::All => total,
            Self::AtLeast { count } => count,
        }
    }

    pub fn is_met(self, submitted: usize, total: usize) -> bool {
        submitted >= self.required(total)
    }
}

impl fmt::Display for QuorumPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all invitees"),
            Self::AtLeast { count } => write!(f, "at least {count}"),
        }
    }
}

// ---------------------------------------------------------------------------

/// The organizer's activity preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPreference {
    /// Let the group decide.
    Open,
    /// A single preferred category, e.g. `Dinner`.
    Specific(String),
}

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Inclusive per-person budget interval in whole currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BudgetRange {
    pub min: u32,
    pub max: u32,
}

impl BudgetRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// A range is well-formed when it is non-empty (`min <= max`).
    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }

    /// Overlap of two ranges, or `None` when they are disjoint.
    pub fn intersection(&self, other: &BudgetRange) -> Option<BudgetRange> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        (min <= max).then_some(BudgetRange { min, max })
    }

    pub fn intersects(&self, other: &BudgetRange) -> bool {
        self.intersection(other).is_some()
    }
}

impl fmt::Display for BudgetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Constraints fixed by the organizer when a session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizerConstraints {
    /// Candidate weekday labels (`Sat`, `Sunday`, ...).
    pub days: BTreeSet<String>,
    /// Candidate time slots: buckets (`Evening`) or clock times (`6:00 PM`).
    pub time_slots: BTreeSet<String>,
    pub activity: ActivityPreference,
    pub budget: BudgetRange,
    /// Invitees in the order the organizer added them.
    pub invitees: Vec<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A participant's preference payload, before it has been accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub activities: BTreeSet<String>,
    pub times: BTreeSet<String>,
    pub budget: BudgetRange,
}

/// An accepted submission. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceSet {
    pub participant: ParticipantId,
    pub activities: BTreeSet<String>,
    pub times: BTreeSet<String>,
    pub budget: BudgetRange,
    pub submitted_at: DateTime<Utc>,
}

/// How many participants backed a candidate on each scoring dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEvidence {
    pub participants: usize,
    pub activity_supporters: usize,
    pub time_supporters: usize,
    pub budget_supporters: usize,
}

/// A ranked activity proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMatch {
    pub activity: String,
    /// Composite score in `[0, 1]`.
    pub score: f64,
    /// 1-based position in the ranked list.
    pub rank: u32,
    pub evidence: MatchEvidence,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// Persisted image of an event session.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub state: SessionState,
    pub constraints: Json<OrganizerConstraints>,
    pub quorum: Option<Json<QuorumPolicy>>,
    pub deadline: Option<DateTime<Utc>>,
    pub submissions: Json<Vec<PreferenceSet>>,
    pub close_reason: Option<CloseReason>,
    pub result: Option<Json<Vec<CandidateMatch>>>,
    /// Incremented on every state change; stores keep the highest version.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
