//! Role-scoped listing of the live queue.
//!
//! The visibility predicate runs before any user-supplied filter: admins
//! see everything, team leaders see their teams' submissions, users see
//! their own. Derived counts are computed over the filtered result, so the
//! panel stat cards always describe exactly the rows on screen.

use serde::{Deserialize, Serialize};

use crate::identity::{Role, UserIdentity};
use crate::submission::{Submission, SubmissionState};

/// Sort order for listed submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortKey {
    /// Newest submissions first (the default).
    #[default]
    SubmittedAt,
    /// Alphabetical by original filename.
    Filename,
    /// Alphabetical by submitter.
    Submitter,
    /// Grouped by state wire string.
    State,
}

/// User-supplied filter, applied after the visibility predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Keep only this state.
    pub state: Option<SubmissionState>,
    /// Keep only this team (intersected with visibility).
    pub team: Option<String>,
    /// Keep only this submitter.
    pub submitter: Option<String>,
    /// Case-insensitive substring match over filename, description, and
    /// submitter.
    pub text: Option<String>,
    /// Sort order.
    pub sort: SortKey,
}

/// Counts over a filtered listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    /// All listed submissions.
    pub total: usize,
    /// In `PENDING_TEAM_LEADER`.
    pub pending_team_leader: usize,
    /// In `PENDING_ADMIN`.
    pub pending_admin: usize,
    /// In `APPROVED`.
    pub approved: usize,
    /// In either rejected state.
    pub rejected: usize,
    /// In `WITHDRAWN`.
    pub withdrawn: usize,
}

impl StateCounts {
    /// Tallies a slice of submissions.
    #[must_use]
    pub fn tally(submissions: &[Submission]) -> Self {
        let mut counts = Self::default();
        for sub in submissions {
            counts.total += 1;
            match sub.state {
                SubmissionState::PendingTeamLeader => counts.pending_team_leader += 1,
                SubmissionState::PendingAdmin => counts.pending_admin += 1,
                SubmissionState::Approved => counts.approved += 1,
                SubmissionState::RejectedByTeamLeader | SubmissionState::RejectedByAdmin => {
                    counts.rejected += 1;
                },
                SubmissionState::Withdrawn => counts.withdrawn += 1,
                SubmissionState::Draft => {},
            }
        }
        counts
    }
}

/// A filtered, sorted listing with its derived counts.
#[derive(Debug, Clone, PartialEq)]
pub struct ListResult {
    /// The visible, filtered submissions in sort order.
    pub submissions: Vec<Submission>,
    /// Counts over exactly those submissions.
    pub counts: StateCounts,
}

/// The role-scoped visibility predicate.
#[must_use]
pub fn visible_to(identity: &UserIdentity, submission: &Submission) -> bool {
    match identity.role {
        Role::Admin => true,
        Role::TeamLeader => identity.has_team(&submission.submitter_team),
        Role::User => identity.username == submission.submitter_username,
    }
}

/// Applies visibility, then the filter, then the sort.
#[must_use]
pub fn apply(identity: &UserIdentity, filter: &ListFilter, all: Vec<Submission>) -> ListResult {
    let needle = filter.text.as_deref().map(str::to_lowercase);
    let mut visible: Vec<Submission> = all
        .into_iter()
        .filter(|sub| visible_to(identity, sub))
        .filter(|sub| filter.state.is_none_or(|s| sub.state == s))
        .filter(|sub| {
            filter
                .team
                .as_deref()
                .is_none_or(|t| sub.submitter_team == t)
        })
        .filter(|sub| {
            filter
                .submitter
                .as_deref()
                .is_none_or(|u| sub.submitter_username == u)
        })
        .filter(|sub| {
            needle.as_deref().is_none_or(|needle| {
                sub.original_filename.to_lowercase().contains(needle)
                    || sub.description.to_lowercase().contains(needle)
                    || sub.submitter_username.to_lowercase().contains(needle)
            })
        })
        .collect();

    match filter.sort {
        SortKey::SubmittedAt => {
            visible.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        },
        SortKey::Filename => {
            visible.sort_by(|a, b| a.original_filename.cmp(&b.original_filename));
        },
        SortKey::Submitter => {
            visible.sort_by(|a, b| a.submitter_username.cmp(&b.submitter_username));
        },
        SortKey::State => visible.sort_by_key(|s| s.state.as_str()),
    }

    let counts = StateCounts::tally(&visible);
    ListResult {
        submissions: visible,
        counts,
    }
}
