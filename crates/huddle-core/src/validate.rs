//! Validation of organizer constraints and participant preferences, plus
//! normalization of time labels into time-of-day buckets.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, NaiveTime, Timelike, Utc, Weekday};

use huddle_db::models::{
    ActivityPreference, BudgetRange, OrganizerConstraints, ParticipantId, PreferenceSet,
    Preferences, QuorumPolicy,
};

use crate::error::ValidationError;

/// Coarse part of the day that participants pick from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeBucket {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeBucket {
    /// Bucket for a clock time. Night wraps past midnight until 05:00.
    pub fn for_time(time: NaiveTime) -> Self {
        match time.hour() {
            5..=11 => Self::Morning,
            12..=16 => Self::Afternoon,
            17..=20 => Self::Evening,
            _ => Self::Night,
        }
    }

    /// Recognize a bucket name (`evening`) or a clock time (`6:00 PM`,
    /// `18:00`). Returns `None` for anything else.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        match label.to_ascii_lowercase().as_str() {
            "morning" => return Some(Self::Morning),
            "afternoon" => return Some(Self::Afternoon),
            "evening" => return Some(Self::Evening),
            "night" => return Some(Self::Night),
            _ => {}
        }
        ["%I:%M %p", "%I:%M%p", "%H:%M"]
            .iter()
            .find_map(|fmt| NaiveTime::parse_from_str(label, fmt).ok())
            .map(Self::for_time)
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Morning => "Morning",
            Self::Afternoon => "Afternoon",
            Self::Evening => "Evening",
            Self::Night => "Night",
        };
        f.write_str(s)
    }
}

/// Map time labels onto comparable keys: recognized labels become their
/// bucket name, anything else is kept trimmed as-is.
pub fn normalize_times<'a>(labels: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
    labels
        .into_iter()
        .map(|label| match TimeBucket::from_label(label) {
            Some(bucket) => bucket.to_string(),
            None => label.trim().to_string(),
        })
        .collect()
}

fn check_labels(labels: &BTreeSet<String>, field: &'static str) -> Result<(), ValidationError> {
    if labels.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if labels.iter().any(|l| l.trim().is_empty()) {
        return Err(ValidationError::BlankLabel { field });
    }
    Ok(())
}

fn check_budget(budget: &BudgetRange) -> Result<(), ValidationError> {
    if budget.is_valid() {
        Ok(())
    } else {
        Err(ValidationError::InvertedBudget {
            min: budget.min,
            max: budget.max,
        })
    }
}

fn trimmed(labels: &BTreeSet<String>) -> BTreeSet<String> {
    labels.iter().map(|l| l.trim().to_string()).collect()
}

/// Validate constraints supplied when a session is created.
pub fn validate_constraints(constraints: &OrganizerConstraints) -> Result<(), ValidationError> {
    check_labels(&constraints.days, "days")?;
    for day in &constraints.days {
        if day.trim().parse::<Weekday>().is_err() {
            return Err(ValidationError::UnknownWeekday(day.clone()));
        }
    }

    check_labels(&constraints.time_slots, "time_slots")?;

    if let ActivityPreference::Specific(label) = &constraints.activity {
        if label.trim().is_empty() {
            return Err(ValidationError::BlankLabel { field: "activity" });
        }
    }

    check_budget(&constraints.budget)?;

    if constraints.invitees.is_empty() {
        return Err(ValidationError::Empty { field: "invitees" });
    }
    let mut seen: HashSet<&str> = HashSet::with_capacity(constraints.invitees.len());
    for invitee in &constraints.invitees {
        let id = invitee.trim();
        if id.is_empty() {
            return Err(ValidationError::BlankLabel { field: "invitees" });
        }
        if !seen.insert(id) {
            return Err(ValidationError::DuplicateInvitee(invitee.clone()));
        }
    }

    Ok(())
}

/// Constraints as stored on a session: labels and invitee ids trimmed.
pub fn normalize_constraints(constraints: OrganizerConstraints) -> OrganizerConstraints {
    OrganizerConstraints {
        days: trimmed(&constraints.days),
        time_slots: trimmed(&constraints.time_slots),
        activity: match constraints.activity {
            ActivityPreference::Specific(label) => {
                ActivityPreference::Specific(label.trim().to_string())
            }
            ActivityPreference::Open => ActivityPreference::Open,
        },
        invitees: constraints
            .invitees
            .iter()
            .map(|id| id.trim().to_string())
            .collect(),
        ..constraints
    }
}

/// Validate a participant's payload.
pub fn validate_preferences(preferences: &Preferences) -> Result<(), ValidationError> {
    check_labels(&preferences.activities, "activities")?;
    check_labels(&preferences.times, "times")?;
    check_budget(&preferences.budget)
}

/// Build the immutable record for an accepted submission.
pub fn accept_preferences(
    participant: &str,
    preferences: &Preferences,
    submitted_at: DateTime<Utc>,
) -> PreferenceSet {
    PreferenceSet {
        participant: participant.to_string(),
        activities: trimmed(&preferences.activities),
        times: trimmed(&preferences.times),
        budget: preferences.budget,
        submitted_at,
    }
}

/// Validate a quorum policy against the invitee count.
pub fn validate_quorum(quorum: QuorumPolicy, invitees: usize) -> Result<(), ValidationError> {
    match quorum {
        QuorumPolicy::All => Ok(()),
        QuorumPolicy::AtLeast { count } if count >= 1 && count <= invitees => Ok(()),
        QuorumPolicy::AtLeast { count } => {
            Err(ValidationError::QuorumOutOfRange { count, invitees })
        }
    }
}

/// The deadline must lie strictly after `now`.
pub fn validate_deadline(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), ValidationError> {
    if deadline > now {
        Ok(())
    } else {
        Err(ValidationError::DeadlineNotInFuture(deadline))
    }
}

/// Invitee ids as a set, for membership checks.
pub fn invitee_set(constraints: &OrganizerConstraints) -> BTreeSet<ParticipantId> {
    constraints.invitees.iter().cloned().collect()
}
