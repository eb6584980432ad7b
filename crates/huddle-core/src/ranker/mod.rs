//! Match ranker: turns organizer constraints plus collected preference sets
//! into an ordered list of candidate activities.
//!
//! Ranking is a pure function. For the same constraints and the same *set*
//! of submissions it returns the same list, whatever order the submissions
//! arrive in.
//!
//! Each candidate activity gets three component scores in `[0, 1]`:
//!
//! ```text
//! activity  = participants selecting the activity       / participants
//! time      = participants sharing a slot with organizer / participants
//! budget    = participants whose range meets organizer's / participants
//! composite = 0.5 * activity + 0.3 * time + 0.2 * budget
//! ```
//!
//! Candidates are ordered by composite score (descending), then by the raw
//! number of participants selecting the activity (descending), then by label.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use huddle_db::models::{
    ActivityPreference, BudgetRange, CandidateMatch, MatchEvidence, OrganizerConstraints,
    PreferenceSet,
};

use crate::validate::normalize_times;

pub const ACTIVITY_WEIGHT: f64 = 0.5;
pub const TIME_WEIGHT: f64 = 0.3;
pub const BUDGET_WEIGHT: f64 = 0.2;

pub const DEFAULT_MAX_CANDIDATES: usize = 5;

/// Activities offered when nobody submitted and the organizer left the
/// activity open.
pub const DEFAULT_ACTIVITY_CATALOG: [&str; 7] = [
    "Arts", "Coffee", "Concert", "Dinner", "Gaming", "Movie", "Picnic",
];

/// Tunables for [`rank`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankerConfig {
    /// Upper bound on the number of returned candidates. Zero is treated
    /// as one.
    pub max_candidates: usize,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }
}

/// One voter's view of the constraints, with time labels normalized.
struct Ballot<'a> {
    activities: BTreeSet<&'a str>,
    times: BTreeSet<String>,
    budget: BudgetRange,
}

impl<'a> Ballot<'a> {
    fn from_preferences(set: &'a PreferenceSet) -> Self {
        Self {
            activities: set.activities.iter().map(String::as_str).collect(),
            times: normalize_times(&set.times),
            budget: set.budget,
        }
    }

    /// The organizer standing in for an empty group.
    fn synthetic(constraints: &'a OrganizerConstraints) -> Self {
        let activities = match &constraints.activity {
            ActivityPreference::Specific(label) => BTreeSet::from([label.as_str()]),
            ActivityPreference::Open => DEFAULT_ACTIVITY_CATALOG.into_iter().collect(),
        };
        Self {
            activities,
            times: normalize_times(&constraints.time_slots),
            budget: constraints.budget,
        }
    }
}

/// Rank candidate activities for a session.
///
/// With no submissions, the organizer is treated as the only participant,
/// so the result is never empty.
pub fn rank(
    constraints: &OrganizerConstraints,
    submissions: &[PreferenceSet],
    config: &RankerConfig,
) -> Vec<CandidateMatch> {
    let ballots: Vec<Ballot<'_>> = if submissions.is_empty() {
        vec![Ballot::synthetic(constraints)]
    } else {
        submissions.iter().map(Ballot::from_preferences).collect()
    };
    let participants = ballots.len();

    let organizer_slots = normalize_times(&constraints.time_slots);
    let time_supporters = ballots
        .iter()
        .filter(|b| !b.times.is_disjoint(&organizer_slots))
        .count();
    let budget_supporters = ballots
        .iter()
        .filter(|b| b.budget.intersects(&constraints.budget))
        .count();

    let mut candidates: BTreeSet<&str> = BTreeSet::new();
    if let ActivityPreference::Specific(label) = &constraints.activity {
        candidates.insert(label.as_str());
    }
    for ballot in &ballots {
        candidates.extend(ballot.activities.iter().copied());
    }

    let fraction = |count: usize| count as f64 / participants as f64;
    let time_score = fraction(time_supporters);
    let budget_score = fraction(budget_supporters);

    let mut scored: Vec<CandidateMatch> = candidates
        .into_iter()
        .map(|activity| {
            let activity_supporters = ballots
                .iter()
                .filter(|b| b.activities.contains(activity))
                .count();
            let score = ACTIVITY_WEIGHT * fraction(activity_supporters)
                + TIME_WEIGHT * time_score
                + BUDGET_WEIGHT * budget_score;
            CandidateMatch {
                activity: activity.to_string(),
                score: score.clamp(0.0, 1.0),
                rank: 0,
                evidence: MatchEvidence {
                    participants,
                    activity_supporters,
                    time_supporters,
                    budget_supporters,
                },
            }
        })
        .collect();

    scored.sort_by(compare_candidates);
    scored.truncate(config.max_candidates.max(1));
    for (index, candidate) in scored.iter_mut().enumerate() {
        candidate.rank = index as u32 + 1;
    }
    scored
}

/// Total order: score desc, activity supporters desc, label asc.
fn compare_candidates(a: &CandidateMatch, b: &CandidateMatch) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| {
            b.evidence
                .activity_supporters
                .cmp(&a.evidence.activity_supporters)
        })
        .then_with(|| a.activity.cmp(&b.activity))
}
