//! Submission types and the approval state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum accepted length of a rejection reason, in characters.
pub const MAX_REASON_CHARS: usize = 2000;

/// Maximum accepted length of a comment body, in characters.
pub const MAX_COMMENT_CHARS: usize = 4000;

/// Maximum accepted length of an original filename, in bytes.
pub const MAX_FILENAME_BYTES: usize = 255;

/// The lifecycle state of a submission.
///
/// Wire form is the uppercase underscore string (`PENDING_TEAM_LEADER`,
/// ...); the serde representation and [`SubmissionState::as_str`] agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionState {
    /// Created but not yet submitted for review.
    Draft,
    /// Awaiting triage by a team leader of the submitter's team.
    PendingTeamLeader,
    /// Forwarded by a team leader, awaiting the final admin decision.
    PendingAdmin,
    /// Approved by an admin (terminal).
    Approved,
    /// Rejected at the team-leader stage (terminal).
    RejectedByTeamLeader,
    /// Rejected at the admin stage (terminal).
    RejectedByAdmin,
    /// Withdrawn by the submitter (terminal).
    Withdrawn,
}

impl SubmissionState {
    /// Parses a state from its wire string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "DRAFT" => Some(Self::Draft),
            "PENDING_TEAM_LEADER" => Some(Self::PendingTeamLeader),
            "PENDING_ADMIN" => Some(Self::PendingAdmin),
            "APPROVED" => Some(Self::Approved),
            "REJECTED_BY_TEAM_LEADER" => Some(Self::RejectedByTeamLeader),
            "REJECTED_BY_ADMIN" => Some(Self::RejectedByAdmin),
            "WITHDRAWN" => Some(Self::Withdrawn),
            _ => None,
        }
    }

    /// Wire string for this state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::PendingTeamLeader => "PENDING_TEAM_LEADER",
            Self::PendingAdmin => "PENDING_ADMIN",
            Self::Approved => "APPROVED",
            Self::RejectedByTeamLeader => "REJECTED_BY_TEAM_LEADER",
            Self::RejectedByAdmin => "REJECTED_BY_ADMIN",
            Self::Withdrawn => "WITHDRAWN",
        }
    }

    /// Returns true if no further transition is permitted from this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Approved | Self::RejectedByTeamLeader | Self::RejectedByAdmin | Self::Withdrawn
        )
    }

    /// Checks whether the transition graph permits `self → target`.
    ///
    /// Only these edges are legal; anything else is an illegal transition
    /// regardless of actor:
    ///
    /// ```text
    /// DRAFT               → PENDING_TEAM_LEADER            (submit)
    /// PENDING_TEAM_LEADER → PENDING_ADMIN                  (tl_approve)
    /// PENDING_TEAM_LEADER → REJECTED_BY_TEAM_LEADER        (tl_reject)
    /// PENDING_TEAM_LEADER → WITHDRAWN                      (withdraw)
    /// PENDING_ADMIN       → APPROVED                       (admin_approve)
    /// PENDING_ADMIN       → REJECTED_BY_ADMIN              (admin_reject)
    /// ```
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Draft, Self::PendingTeamLeader)
                | (
                    Self::PendingTeamLeader,
                    Self::PendingAdmin | Self::RejectedByTeamLeader | Self::Withdrawn
                )
                | (Self::PendingAdmin, Self::Approved | Self::RejectedByAdmin)
        )
    }
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the placement pipeline for an approved submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlacementOutcome {
    /// The artifact sits at its final project path.
    Delivered,
    /// Direct placement was denied; the artifact is parked in staging.
    Staged,
    /// Neither placement nor staging succeeded; a manual request is open.
    ManualRequested,
}

impl PlacementOutcome {
    /// Wire string for this outcome.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "DELIVERED",
            Self::Staged => "STAGED",
            Self::ManualRequested => "MANUAL_REQUESTED",
        }
    }
}

/// One entry in a submission's ordered state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateHistoryEntry {
    /// State entered.
    pub state: SubmissionState,
    /// When the transition was committed (observed inside the submission
    /// lock, so entries are non-decreasing per submission).
    pub at: DateTime<Utc>,
    /// Acting username, when the transition had an actor.
    #[serde(default)]
    pub actor: Option<String>,
    /// Free-form note (rejection reason, placement detail, ...).
    #[serde(default)]
    pub note: Option<String>,
}

/// A single artifact flowing through approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Submission {
    /// Opaque stable identifier.
    pub id: String,

    /// Submitting username, captured at submission time.
    pub submitter_username: String,
    /// Submitter's team at submission time. Never rewritten, even if the
    /// submitter's team assignment later changes.
    pub submitter_team: String,

    /// Filename as uploaded (already validated path-safe).
    pub original_filename: String,
    /// Where the uploaded artifact currently sits.
    pub upload_path: std::path::PathBuf,
    /// Artifact size in bytes at submission time.
    pub size_bytes: u64,
    /// Optional media-type hint from the uploader.
    #[serde(default)]
    pub content_type_hint: Option<String>,

    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Current lifecycle state.
    pub state: SubmissionState,

    /// When the submission record was created.
    pub created_at: DateTime<Utc>,
    /// When the submission entered review.
    pub submitted_at: DateTime<Utc>,
    /// When the team-leader decision landed.
    #[serde(default)]
    pub tl_decided_at: Option<DateTime<Utc>>,
    /// When the admin decision landed.
    #[serde(default)]
    pub admin_decided_at: Option<DateTime<Utc>>,
    /// When the record was copied to its archive.
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,

    /// Team leader who decided, if the team-leader stage has run.
    #[serde(default)]
    pub tl_reviewer: Option<String>,
    /// Reason recorded by a team-leader rejection.
    #[serde(default)]
    pub tl_rejection_reason: Option<String>,
    /// Admin who decided, if the admin stage has run.
    #[serde(default)]
    pub admin_reviewer: Option<String>,
    /// Reason recorded by an admin rejection.
    #[serde(default)]
    pub admin_rejection_reason: Option<String>,

    /// Placement outcome, set after admin approval.
    #[serde(default)]
    pub placement_outcome: Option<PlacementOutcome>,
    /// Final path for `DELIVERED`, staging path for `STAGED`.
    #[serde(default)]
    pub placement_target_path: Option<std::path::PathBuf>,

    /// Ordered transition history.
    #[serde(default)]
    pub state_history: Vec<StateHistoryEntry>,

    /// Post-commit side effects that failed and await the retrier or an
    /// operator. Never reverses a committed transition.
    #[serde(default)]
    pub side_effect_failures: Vec<String>,
}

impl Submission {
    /// Creates a draft submission with its initial history entry.
    #[must_use]
    pub fn new_draft(
        id: String,
        submitter: &str,
        team: &str,
        original_filename: String,
        upload_path: std::path::PathBuf,
        size_bytes: u64,
        description: String,
        tags: Vec<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            submitter_username: submitter.to_string(),
            submitter_team: team.to_string(),
            original_filename,
            upload_path,
            size_bytes,
            content_type_hint: None,
            description,
            tags,
            state: SubmissionState::Draft,
            created_at,
            submitted_at: created_at,
            tl_decided_at: None,
            admin_decided_at: None,
            archived_at: None,
            tl_reviewer: None,
            tl_rejection_reason: None,
            admin_reviewer: None,
            admin_rejection_reason: None,
            placement_outcome: None,
            placement_target_path: None,
            state_history: vec![StateHistoryEntry {
                state: SubmissionState::Draft,
                at: created_at,
                actor: Some(submitter.to_string()),
                note: None,
            }],
            side_effect_failures: Vec::new(),
        }
    }

    /// Applies a legal transition, appending the history entry.
    ///
    /// The caller has already verified actor authorization; this only
    /// enforces the transition graph.
    ///
    /// # Errors
    ///
    /// Returns the current state when the graph forbids the edge.
    pub fn transition_to(
        &mut self,
        target: SubmissionState,
        at: DateTime<Utc>,
        actor: Option<&str>,
        note: Option<String>,
    ) -> Result<(), SubmissionState> {
        if !self.state.can_transition_to(target) {
            return Err(self.state);
        }
        self.state = target;
        self.state_history.push(StateHistoryEntry {
            state: target,
            at,
            actor: actor.map(ToString::to_string),
            note,
        });
        Ok(())
    }

    /// Returns true if the submission is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Validates an original filename for path safety.
///
/// Rejects empty names, names over [`MAX_FILENAME_BYTES`], path separators,
/// NUL bytes, and parent references — before a submission is accepted, so
/// nothing later in the pipeline can be steered outside its team/year
/// directory.
///
/// # Errors
///
/// Returns a human-readable description of the first violation.
pub fn validate_filename(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("filename is empty".to_string());
    }
    if name.len() > MAX_FILENAME_BYTES {
        return Err(format!(
            "filename exceeds {MAX_FILENAME_BYTES} bytes ({} given)",
            name.len()
        ));
    }
    if name.contains('/') || name.contains('\\') {
        return Err("filename contains a path separator".to_string());
    }
    if name.contains('\0') {
        return Err("filename contains a NUL byte".to_string());
    }
    if name == "." || name == ".." {
        return Err("filename is a directory reference".to_string());
    }
    Ok(())
}

/// Validates and trims a rejection reason.
///
/// # Errors
///
/// Returns a description when the trimmed reason is empty or over
/// [`MAX_REASON_CHARS`].
pub fn validate_reason(reason: &str) -> Result<String, String> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Err("rejection requires a non-empty reason".to_string());
    }
    if trimmed.chars().count() > MAX_REASON_CHARS {
        return Err(format!("reason exceeds {MAX_REASON_CHARS} characters"));
    }
    Ok(trimmed.to_string())
}
