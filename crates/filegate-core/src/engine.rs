//! The approval engine: public operations over the submission queue.
//!
//! Every operation takes the acting username (authentication happened
//! outside), resolves it through the identity provider, enforces the
//! role/team authorization table and the transition graph, and commits by
//! rewriting the queue document. Derived effects — archive records,
//! notifications, artifact placement, metadata — run after the commit and
//! never reverse it; an effect failure is recorded on the submission's
//! `side_effect_failures` and retried or surfaced out of band.
//!
//! # Locking
//!
//! Two layers, always in the same order: the per-submission in-process
//! mutex first, then the document's advisory file lock inside
//! [`DocumentStore::modify`]. No operation holds more than one submission
//! lock; there are no multi-submission transactions. Timestamps are
//! observed inside the lock, so `state_history` stamps are non-decreasing
//! per submission.
//!
//! # Retries
//!
//! The caller-facing wrapper retries `STORE_UNAVAILABLE` up to three
//! times with exponential backoff, bounded by the operation's deadline.
//! Authorization and state errors are final.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveKind, ArchiveStore};
use crate::comments::{can_view_thread, Comment, CommentStore, MigrationStats};
use crate::config::EngineConfig;
use crate::deadline::Deadline;
use crate::error::EngineError;
use crate::identity::{FileIdentityProvider, IdentityProvider, Role, UserIdentity};
use crate::listing::{self, ListFilter, ListResult};
use crate::metadata::MetadataStore;
use crate::notify::{
    notification_id, Notification, NotificationKind, NotificationService,
};
use crate::paths::PathResolver;
use crate::placement::{PlacementPipeline, PlacementRequest, SweepStats};
use crate::store::{DocumentStore, StoreError};
use crate::submission::{
    validate_filename, validate_reason, PlacementOutcome, Submission, SubmissionState,
    MAX_COMMENT_CHARS,
};

/// Document holding the live submission queue.
pub const QUEUE_DOC: &str = "approvals/queue.json";

/// Retry attempts for transport-like failures.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Initial backoff between retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

type Queue = BTreeMap<String, Submission>;

/// A derived effect that ran (or was attempted) after a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// The submission was copied into an archive ring.
    Archived(&'static str),
    /// A notification was appended to a user's inbox.
    Notified {
        /// Inbox owner.
        recipient: String,
        /// Notification kind.
        kind: NotificationKind,
    },
    /// The placement pipeline ran with this outcome.
    PlacementAttempted(PlacementOutcome),
    /// A comment was recorded.
    CommentRecorded(String),
}

/// A committed operation and its derived effects.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationOutcome {
    /// The submission as committed (including any recorded effect
    /// failures).
    pub submission: Submission,
    /// Effects that ran, in order.
    pub effects: Vec<Effect>,
}

/// The approval engine.
pub struct ApprovalEngine {
    config: EngineConfig,
    resolver: Arc<PathResolver>,
    store: DocumentStore,
    identity: Arc<dyn IdentityProvider>,
    archive: ArchiveStore,
    notify: NotificationService,
    comments: CommentStore,
    placement: PlacementPipeline,
    submission_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ApprovalEngine {
    /// Builds an engine with an injected identity provider.
    #[must_use]
    pub fn new(config: EngineConfig, identity: Arc<dyn IdentityProvider>) -> Self {
        let resolver = Arc::new(PathResolver::new(&config));
        let store = DocumentStore::new(Arc::clone(&resolver));
        let metadata = MetadataStore::new(Arc::clone(&resolver));
        let archive = ArchiveStore::new(store.clone(), config.archive_cap);
        let notify = NotificationService::new(store.clone());
        let comments = CommentStore::new(store.clone());
        let placement =
            PlacementPipeline::new(Arc::clone(&resolver), store.clone(), metadata);
        Self {
            config,
            resolver,
            store,
            identity,
            archive,
            notify,
            comments,
            placement,
            submission_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Builds an engine with the file-backed identity provider from the
    /// configured source.
    #[must_use]
    pub fn with_file_identity(config: EngineConfig) -> Self {
        let identity = Arc::new(FileIdentityProvider::new(config.identity_source()));
        Self::new(config, identity)
    }

    /// Returns true while the resolver is serving from the local fallback.
    #[must_use]
    pub fn degraded(&self) -> bool {
        // Touch the base so a stale probe refreshes.
        let _ = self.resolver.shared_base();
        self.resolver.degraded()
    }

    // -----------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------

    /// Submits an uploaded file for team-leader review.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_USER`, `FORBIDDEN` (non-user role), `BAD_INPUT` (unsafe
    /// filename, missing upload), `STORE_UNAVAILABLE`, `CORRUPT`,
    /// `DEADLINE`.
    pub fn submit(
        &self,
        actor: &str,
        upload_path: &Path,
        description: &str,
        tags: Vec<String>,
        deadline: Deadline,
    ) -> Result<OperationOutcome, EngineError> {
        let identity = self.require_identity(actor)?;
        if identity.role != Role::User {
            return Err(EngineError::Forbidden {
                detail: format!("role {} cannot submit files", identity.role),
            });
        }

        let filename = upload_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| EngineError::BadInput {
                detail: "upload path has no usable filename".to_string(),
            })?
            .to_string();
        validate_filename(&filename).map_err(|detail| EngineError::BadInput { detail })?;

        let meta = std::fs::symlink_metadata(upload_path).map_err(|_| EngineError::BadInput {
            detail: format!("upload not found: {}", upload_path.display()),
        })?;
        if !meta.is_file() {
            return Err(EngineError::BadInput {
                detail: "upload is not a regular file".to_string(),
            });
        }

        let team = identity.primary_team().to_string();
        let id = Uuid::new_v4().to_string();

        self.with_retries(deadline, || {
            self.ensure_writable()?;
            let lock = self.submission_lock(&id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            let submission = self.with_queue(deadline, |queue| {
                let now = Utc::now();
                let mut sub = Submission::new_draft(
                    id.clone(),
                    &identity.username,
                    &team,
                    filename.clone(),
                    upload_path.to_path_buf(),
                    meta.len(),
                    description.to_string(),
                    tags.clone(),
                    now,
                );
                sub.transition_to(
                    SubmissionState::PendingTeamLeader,
                    now,
                    Some(&identity.username),
                    None,
                )
                .map_err(|state| EngineError::IllegalTransition {
                    action: "submit",
                    state: state.to_string(),
                })?;
                sub.submitted_at = now;
                queue.insert(id.clone(), sub.clone());
                Ok::<Submission, EngineError>(sub)
            })??;

            info!(id = %submission.id, submitter = %actor, team = %team, "submission entered review");

            let mut effects = Vec::new();
            let mut failures = Vec::new();
            let stamp = submission.submitted_at.to_rfc3339();
            let payload = format!("{} submitted for review", submission.original_filename);

            self.notify_user(
                &identity.username,
                NotificationKind::SubmittedToTl,
                &submission,
                &stamp,
                payload.clone(),
                deadline,
                &mut effects,
                &mut failures,
            );
            match self.identity.team_leaders(&team) {
                Ok(leaders) => {
                    for leader in leaders {
                        self.notify_user(
                            &leader,
                            NotificationKind::SubmittedToTl,
                            &submission,
                            &stamp,
                            payload.clone(),
                            deadline,
                            &mut effects,
                            &mut failures,
                        );
                    }
                },
                Err(e) => failures.push(format!("team leader fan-out: {e}")),
            }

            Ok(self.finish(submission, effects, failures, deadline))
        })
    }

    /// Withdraws a submission awaiting team-leader review.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_USER`, `NOT_FOUND`, `FORBIDDEN` (not the submitter),
    /// `ILLEGAL_TRANSITION`, `STORE_UNAVAILABLE`, `CORRUPT`, `DEADLINE`.
    pub fn withdraw(
        &self,
        actor: &str,
        id: &str,
        deadline: Deadline,
    ) -> Result<OperationOutcome, EngineError> {
        let identity = self.require_identity(actor)?;
        if identity.role != Role::User {
            return Err(EngineError::Forbidden {
                detail: format!("role {} cannot withdraw submissions", identity.role),
            });
        }

        self.with_retries(deadline, || {
            self.ensure_writable()?;
            let lock = self.submission_lock(id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let submission = self.commit_transition(id, deadline, "withdraw", |sub, now| {
                if sub.submitter_username != identity.username {
                    return Err(EngineError::Forbidden {
                        detail: "only the submitter may withdraw a submission".to_string(),
                    });
                }
                sub.transition_to(
                    SubmissionState::Withdrawn,
                    now,
                    Some(&identity.username),
                    Some("withdrawn by submitter".to_string()),
                )
                .map_err(|state| EngineError::IllegalTransition {
                    action: "withdraw",
                    state: state.to_string(),
                })
            })?;

            let mut effects = Vec::new();
            let mut failures = Vec::new();
            self.archive_terminal(&submission, deadline, &mut effects, &mut failures);
            let stamp = stamp_of(&submission);
            self.notify_user(
                &submission.submitter_username,
                NotificationKind::Withdrawn,
                &submission,
                &stamp,
                format!("{} withdrawn", submission.original_filename),
                deadline,
                &mut effects,
                &mut failures,
            );
            Ok(self.finish(submission, effects, failures, deadline))
        })
    }

    /// Team-leader approval: forwards the submission to the admin stage.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_USER`, `NOT_FOUND`, `FORBIDDEN` (wrong role or team),
    /// `ILLEGAL_TRANSITION`, `STORE_UNAVAILABLE`, `CORRUPT`, `DEADLINE`.
    pub fn tl_approve(
        &self,
        actor: &str,
        id: &str,
        deadline: Deadline,
    ) -> Result<OperationOutcome, EngineError> {
        let identity = self.require_team_leader(actor)?;

        self.with_retries(deadline, || {
            self.ensure_writable()?;
            let lock = self.submission_lock(id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let submission = self.commit_transition(id, deadline, "tl_approve", |sub, now| {
                require_team(&identity, sub)?;
                sub.transition_to(
                    SubmissionState::PendingAdmin,
                    now,
                    Some(&identity.username),
                    None,
                )
                .map_err(|state| EngineError::IllegalTransition {
                    action: "tl_approve",
                    state: state.to_string(),
                })?;
                sub.tl_reviewer = Some(identity.username.clone());
                sub.tl_decided_at = Some(now);
                Ok(())
            })?;

            let mut effects = Vec::new();
            let mut failures = Vec::new();
            let stamp = submission
                .tl_decided_at
                .map_or_else(String::new, |t| t.to_rfc3339());
            self.notify_user(
                &submission.submitter_username,
                NotificationKind::TlApproved,
                &submission,
                &stamp,
                format!(
                    "{} approved by team leader {}",
                    submission.original_filename, identity.username
                ),
                deadline,
                &mut effects,
                &mut failures,
            );
            Ok(self.finish(submission, effects, failures, deadline))
        })
    }

    /// Team-leader rejection (terminal).
    ///
    /// # Errors
    ///
    /// As [`ApprovalEngine::tl_approve`], plus `BAD_INPUT` for a missing
    /// or oversized reason.
    pub fn tl_reject(
        &self,
        actor: &str,
        id: &str,
        reason: &str,
        deadline: Deadline,
    ) -> Result<OperationOutcome, EngineError> {
        let identity = self.require_team_leader(actor)?;
        let reason = validate_reason(reason).map_err(|detail| EngineError::BadInput { detail })?;

        self.with_retries(deadline, || {
            self.ensure_writable()?;
            let lock = self.submission_lock(id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let submission = self.commit_transition(id, deadline, "tl_reject", |sub, now| {
                require_team(&identity, sub)?;
                sub.transition_to(
                    SubmissionState::RejectedByTeamLeader,
                    now,
                    Some(&identity.username),
                    Some(reason.clone()),
                )
                .map_err(|state| EngineError::IllegalTransition {
                    action: "tl_reject",
                    state: state.to_string(),
                })?;
                sub.tl_reviewer = Some(identity.username.clone());
                sub.tl_decided_at = Some(now);
                sub.tl_rejection_reason = Some(reason.clone());
                Ok(())
            })?;

            let mut effects = Vec::new();
            let mut failures = Vec::new();
            self.archive_terminal(&submission, deadline, &mut effects, &mut failures);
            let stamp = stamp_of(&submission);
            self.notify_user(
                &submission.submitter_username,
                NotificationKind::TlRejected,
                &submission,
                &stamp,
                format!(
                    "{} rejected by team leader {}: {}",
                    submission.original_filename, identity.username, reason
                ),
                deadline,
                &mut effects,
                &mut failures,
            );
            Ok(self.finish(submission, effects, failures, deadline))
        })
    }

    /// Final admin approval (terminal). Triggers artifact placement and
    /// the metadata sidecar.
    ///
    /// Placement failures never fail this operation: the submission stays
    /// approved with a `STAGED` or `MANUAL_REQUESTED` outcome for the
    /// background retrier.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_USER`, `NOT_FOUND`, `FORBIDDEN` (non-admin),
    /// `ILLEGAL_TRANSITION`, `STORE_UNAVAILABLE`, `CORRUPT`, `DEADLINE`.
    pub fn admin_approve(
        &self,
        actor: &str,
        id: &str,
        deadline: Deadline,
    ) -> Result<OperationOutcome, EngineError> {
        let identity = self.require_admin(actor)?;

        self.with_retries(deadline, || {
            self.ensure_writable()?;
            let lock = self.submission_lock(id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut submission =
                self.commit_transition(id, deadline, "admin_approve", |sub, now| {
                    sub.transition_to(
                        SubmissionState::Approved,
                        now,
                        Some(&identity.username),
                        None,
                    )
                    .map_err(|state| EngineError::IllegalTransition {
                        action: "admin_approve",
                        state: state.to_string(),
                    })?;
                    sub.admin_reviewer = Some(identity.username.clone());
                    sub.admin_decided_at = Some(now);
                    Ok(())
                })?;

            let mut effects = Vec::new();
            let mut failures = Vec::new();

            let decided_at = submission.admin_decided_at.unwrap_or(submission.submitted_at);
            match self.placement.place(&submission, decided_at, deadline) {
                Ok(result) => {
                    submission.placement_outcome = Some(result.outcome);
                    submission.placement_target_path = result.path;
                    if let Some(detail) = result.detail {
                        warn!(id = %submission.id, detail = %detail, "placement did not deliver");
                    }
                    effects.push(Effect::PlacementAttempted(result.outcome));
                },
                Err(e) => {
                    // Leave the record retryable: the sweep re-attempts
                    // anything not delivered.
                    submission.placement_outcome = Some(PlacementOutcome::ManualRequested);
                    failures.push(format!("placement: {e}"));
                },
            }

            self.archive_terminal(&submission, deadline, &mut effects, &mut failures);
            let stamp = stamp_of(&submission);
            self.notify_user(
                &submission.submitter_username,
                NotificationKind::AdminApproved,
                &submission,
                &stamp,
                format!(
                    "{} approved by {}",
                    submission.original_filename, identity.username
                ),
                deadline,
                &mut effects,
                &mut failures,
            );
            Ok(self.finish(submission, effects, failures, deadline))
        })
    }

    /// Final admin rejection (terminal).
    ///
    /// # Errors
    ///
    /// As [`ApprovalEngine::admin_approve`], plus `BAD_INPUT` for a
    /// missing or oversized reason.
    pub fn admin_reject(
        &self,
        actor: &str,
        id: &str,
        reason: &str,
        deadline: Deadline,
    ) -> Result<OperationOutcome, EngineError> {
        let identity = self.require_admin(actor)?;
        let reason = validate_reason(reason).map_err(|detail| EngineError::BadInput { detail })?;

        self.with_retries(deadline, || {
            self.ensure_writable()?;
            let lock = self.submission_lock(id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let submission = self.commit_transition(id, deadline, "admin_reject", |sub, now| {
                sub.transition_to(
                    SubmissionState::RejectedByAdmin,
                    now,
                    Some(&identity.username),
                    Some(reason.clone()),
                )
                .map_err(|state| EngineError::IllegalTransition {
                    action: "admin_reject",
                    state: state.to_string(),
                })?;
                sub.admin_reviewer = Some(identity.username.clone());
                sub.admin_decided_at = Some(now);
                sub.admin_rejection_reason = Some(reason.clone());
                Ok(())
            })?;

            let mut effects = Vec::new();
            let mut failures = Vec::new();
            self.archive_terminal(&submission, deadline, &mut effects, &mut failures);
            let stamp = stamp_of(&submission);
            self.notify_user(
                &submission.submitter_username,
                NotificationKind::AdminRejected,
                &submission,
                &stamp,
                format!(
                    "{} rejected by {}: {}",
                    submission.original_filename, identity.username, reason
                ),
                deadline,
                &mut effects,
                &mut failures,
            );
            Ok(self.finish(submission, effects, failures, deadline))
        })
    }

    /// Adds a comment to a live submission and fans out notifications to
    /// the other participants.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_USER`, `NOT_FOUND`, `FORBIDDEN` (no standing on the
    /// thread), `BAD_INPUT` (empty or oversized body),
    /// `STORE_UNAVAILABLE`, `CORRUPT`, `DEADLINE`.
    pub fn add_comment(
        &self,
        actor: &str,
        id: &str,
        body: &str,
        deadline: Deadline,
    ) -> Result<OperationOutcome, EngineError> {
        let identity = self.require_identity(actor)?;
        let body = body.trim();
        if body.is_empty() {
            return Err(EngineError::BadInput {
                detail: "comment body is empty".to_string(),
            });
        }
        if body.chars().count() > MAX_COMMENT_CHARS {
            return Err(EngineError::BadInput {
                detail: format!("comment exceeds {MAX_COMMENT_CHARS} characters"),
            });
        }

        self.with_retries(deadline, || {
            self.ensure_writable()?;
            let queue: Queue = self.store.read(QUEUE_DOC)?.unwrap_or_default();
            let submission = queue.get(id).cloned().ok_or_else(|| EngineError::NotFound {
                id: id.to_string(),
            })?;

            let participants = self.comments.participants(id)?;
            if !can_view_thread(&identity, &submission, &participants) {
                return Err(EngineError::Forbidden {
                    detail: "no standing to comment on this submission".to_string(),
                });
            }

            let comment = self
                .comments
                .append(id, &identity, body, Utc::now(), deadline)?;
            info!(id = %id, author = %identity.username, "comment recorded");

            let mut effects = vec![Effect::CommentRecorded(comment.id.clone())];
            let mut failures = Vec::new();
            for recipient in comment_recipients(&submission, &participants, &identity.username) {
                self.notify_user(
                    &recipient,
                    NotificationKind::CommentAdded,
                    &submission,
                    &comment.id,
                    format!(
                        "{} commented on {}",
                        identity.username, submission.original_filename
                    ),
                    deadline,
                    &mut effects,
                    &mut failures,
                );
            }
            Ok(self.finish(submission, effects, failures, deadline))
        })
    }

    /// Role-scoped listing of the live queue.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_USER`, `STORE_UNAVAILABLE`, `CORRUPT`, `DEADLINE`.
    pub fn list(
        &self,
        actor: &str,
        filter: &ListFilter,
        deadline: Deadline,
    ) -> Result<ListResult, EngineError> {
        let identity = self.require_identity(actor)?;
        if deadline.is_expired() {
            return Err(EngineError::Deadline);
        }
        let queue: Queue = self.store.read(QUEUE_DOC)?.unwrap_or_default();
        Ok(listing::apply(
            &identity,
            filter,
            queue.into_values().collect(),
        ))
    }

    /// Fetches one submission the actor is allowed to see, searching the
    /// live queue first and the archives second.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_USER`, `NOT_FOUND` (including submissions outside the
    /// actor's visibility), `STORE_UNAVAILABLE`, `CORRUPT`.
    pub fn get(&self, actor: &str, id: &str) -> Result<Submission, EngineError> {
        let identity = self.require_identity(actor)?;
        let queue: Queue = self.store.read(QUEUE_DOC)?.unwrap_or_default();
        let found = match queue.get(id) {
            Some(sub) => Some(sub.clone()),
            None => {
                let mut found = None;
                for kind in ArchiveKind::all() {
                    if let Some(sub) = self.archive.find(kind, id)? {
                        found = Some(sub);
                        break;
                    }
                }
                found
            },
        };
        found
            .filter(|sub| listing::visible_to(&identity, sub))
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })
    }

    /// The actor's archived submissions of one kind, visibility-scoped.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_USER`, `STORE_UNAVAILABLE`, `CORRUPT`.
    pub fn archived(&self, actor: &str, kind: ArchiveKind) -> Result<Vec<Submission>, EngineError> {
        let identity = self.require_identity(actor)?;
        let mut records = self.archive.list(kind)?;
        records.retain(|sub| listing::visible_to(&identity, sub));
        Ok(records)
    }

    /// The actor's inbox, newest first.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_USER`, `STORE_UNAVAILABLE`, `CORRUPT`.
    pub fn get_inbox(
        &self,
        actor: &str,
        unread_only: bool,
    ) -> Result<Vec<Notification>, EngineError> {
        let identity = self.require_identity(actor)?;
        Ok(self.notify.list(&identity.username, unread_only)?)
    }

    /// Marks one of the actor's notifications read.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_USER`, `NOT_FOUND`, `STORE_UNAVAILABLE`, `CORRUPT`,
    /// `DEADLINE`.
    pub fn mark_read(
        &self,
        actor: &str,
        notification_id: &str,
        deadline: Deadline,
    ) -> Result<(), EngineError> {
        let identity = self.require_identity(actor)?;
        let found = self
            .notify
            .mark_read(&identity.username, notification_id, deadline)?;
        if found {
            Ok(())
        } else {
            Err(EngineError::NotFound {
                id: notification_id.to_string(),
            })
        }
    }

    /// Marks the actor's whole inbox read, returning how many flipped.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_USER`, `STORE_UNAVAILABLE`, `CORRUPT`, `DEADLINE`.
    pub fn mark_all_read(&self, actor: &str, deadline: Deadline) -> Result<usize, EngineError> {
        let identity = self.require_identity(actor)?;
        Ok(self.notify.mark_all_read(&identity.username, deadline)?)
    }

    /// One placement retry sweep over the approved archive.
    ///
    /// # Errors
    ///
    /// `STORE_UNAVAILABLE`, `CORRUPT`, `DEADLINE`.
    pub fn retry_placements(&self, deadline: Deadline) -> Result<SweepStats, EngineError> {
        Ok(self.placement.retry_sweep(&self.archive, deadline)?)
    }

    /// Open manual-placement requests.
    ///
    /// # Errors
    ///
    /// `STORE_UNAVAILABLE`, `CORRUPT`.
    pub fn placement_requests(&self) -> Result<Vec<PlacementRequest>, EngineError> {
        Ok(self.placement.open_requests()?)
    }

    /// One-shot ingest of a legacy monolithic comments document.
    ///
    /// # Errors
    ///
    /// `STORE_UNAVAILABLE`, `CORRUPT`, `DEADLINE`.
    pub fn migrate_legacy_comments(
        &self,
        legacy_path: &Path,
        deadline: Deadline,
    ) -> Result<MigrationStats, EngineError> {
        Ok(self.comments.migrate_legacy(legacy_path, deadline)?)
    }

    /// The comment thread for a submission the actor may see.
    ///
    /// # Errors
    ///
    /// `UNKNOWN_USER`, `NOT_FOUND`, `FORBIDDEN`, `STORE_UNAVAILABLE`,
    /// `CORRUPT`.
    pub fn get_comments(&self, actor: &str, id: &str) -> Result<Vec<Comment>, EngineError> {
        let identity = self.require_identity(actor)?;
        let submission = self.get(actor, id)?;
        let participants = self.comments.participants(id)?;
        if !can_view_thread(&identity, &submission, &participants) {
            return Err(EngineError::Forbidden {
                detail: "no standing to read this thread".to_string(),
            });
        }
        Ok(self.comments.list(id)?)
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn require_identity(&self, actor: &str) -> Result<UserIdentity, EngineError> {
        Ok(self.identity.get(actor)?)
    }

    fn require_team_leader(&self, actor: &str) -> Result<UserIdentity, EngineError> {
        let identity = self.require_identity(actor)?;
        if identity.role != Role::TeamLeader {
            return Err(EngineError::Forbidden {
                detail: format!("role {} cannot review at the team-leader stage", identity.role),
            });
        }
        Ok(identity)
    }

    fn require_admin(&self, actor: &str) -> Result<UserIdentity, EngineError> {
        let identity = self.require_identity(actor)?;
        if identity.role != Role::Admin {
            return Err(EngineError::Forbidden {
                detail: format!("role {} cannot render admin decisions", identity.role),
            });
        }
        Ok(identity)
    }

    /// Refuses state-changing operations in degraded mode unless degraded
    /// writes are explicitly enabled.
    fn ensure_writable(&self) -> Result<(), EngineError> {
        if self.degraded() && !self.config.allow_degraded_writes {
            return Err(EngineError::StoreUnavailable {
                detail: "shared store unreachable (degraded mode, writes disabled)".to_string(),
            });
        }
        Ok(())
    }

    fn submission_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut table = self
            .submission_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(table.entry(id.to_string()).or_default())
    }

    fn with_queue<R>(
        &self,
        deadline: Deadline,
        f: impl FnOnce(&mut Queue) -> R,
    ) -> Result<R, StoreError> {
        // The queue is the source of truth; it is never salvaged. A corrupt
        // queue refuses writes until an operator intervenes.
        self.store.modify(QUEUE_DOC, deadline, f)
    }

    /// Runs a transition commit: re-reads the live state under the queue
    /// document lock, validates, applies, and removes terminal submissions
    /// from the queue in the same document write.
    ///
    /// The caller holds the per-submission lock for the whole transition,
    /// effects included.
    fn commit_transition(
        &self,
        id: &str,
        deadline: Deadline,
        action: &'static str,
        apply: impl FnOnce(&mut Submission, DateTime<Utc>) -> Result<(), EngineError>,
    ) -> Result<Submission, EngineError> {
        let committed = self.with_queue(deadline, |queue| {
            let Some(sub) = queue.get_mut(id) else {
                return Err(EngineError::NotFound { id: id.to_string() });
            };
            let now = Utc::now();
            apply(sub, now)?;
            let mut committed = sub.clone();
            if committed.is_terminal() {
                committed.archived_at = Some(now);
                queue.remove(id);
            }
            Ok(committed)
        })??;

        info!(id = %id, action, state = %committed.state, "transition committed");
        Ok(committed)
    }

    fn archive_terminal(
        &self,
        submission: &Submission,
        deadline: Deadline,
        effects: &mut Vec<Effect>,
        failures: &mut Vec<String>,
    ) {
        let Some(kind) = ArchiveKind::for_state(submission.state) else {
            return;
        };
        match self.archive.append(kind, submission, deadline) {
            Ok(()) => effects.push(Effect::Archived(kind.doc())),
            Err(e) => failures.push(format!("archive {}: {e}", kind.doc())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn notify_user(
        &self,
        recipient: &str,
        kind: NotificationKind,
        submission: &Submission,
        discriminator: &str,
        payload: String,
        deadline: Deadline,
        effects: &mut Vec<Effect>,
        failures: &mut Vec<String>,
    ) {
        let notification = Notification {
            id: notification_id(&submission.id, kind, discriminator),
            recipient_username: recipient.to_string(),
            kind,
            submission_id: Some(submission.id.clone()),
            payload,
            at: Utc::now(),
            read: false,
        };
        match self.notify.append(notification, deadline) {
            Ok(()) => effects.push(Effect::Notified {
                recipient: recipient.to_string(),
                kind,
            }),
            Err(e) => failures.push(format!("notify {recipient}: {e}")),
        }
    }

    /// Persists recorded effect failures and assembles the outcome.
    fn finish(
        &self,
        mut submission: Submission,
        effects: Vec<Effect>,
        failures: Vec<String>,
        deadline: Deadline,
    ) -> OperationOutcome {
        if !failures.is_empty() {
            warn!(id = %submission.id, ?failures, "side effects failed after commit");
            submission.side_effect_failures.extend(failures.clone());
            let id = submission.id.clone();
            let persist = if submission.is_terminal() {
                ArchiveKind::for_state(submission.state)
                    .map(|kind| {
                        self.archive
                            .update(kind, &id, deadline, |record| {
                                record.side_effect_failures.extend(failures.clone());
                            })
                            .map(|_| ())
                    })
                    .unwrap_or(Ok(()))
            } else {
                self.with_queue(deadline, |queue| {
                    if let Some(entry) = queue.get_mut(&id) {
                        entry.side_effect_failures.extend(failures.clone());
                    }
                })
            };
            if let Err(e) = persist {
                warn!(id = %id, error = %e, "could not record side-effect failures");
            }
        }
        OperationOutcome {
            submission,
            effects,
        }
    }

    fn with_retries<T>(
        &self,
        deadline: Deadline,
        mut op: impl FnMut() -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut backoff = RETRY_BACKOFF;
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_retryable() && attempt < MAX_RETRY_ATTEMPTS => {
                    if deadline.is_expired() {
                        return Err(EngineError::Deadline);
                    }
                    warn!(attempt, error = %e, "retrying after transient store failure");
                    let nap = deadline.remaining().map_or(backoff, |r| r.min(backoff));
                    std::thread::sleep(nap);
                    backoff *= 2;
                    attempt += 1;
                },
                other => return other,
            }
        }
    }
}

fn require_team(identity: &UserIdentity, submission: &Submission) -> Result<(), EngineError> {
    if identity.has_team(&submission.submitter_team) {
        Ok(())
    } else {
        Err(EngineError::Forbidden {
            detail: format!(
                "team leader {} has no authority over team {}",
                identity.username, submission.submitter_team
            ),
        })
    }
}

/// Decision stamp used as the notification discriminator.
fn stamp_of(submission: &Submission) -> String {
    submission
        .state_history
        .last()
        .map_or_else(String::new, |entry| entry.at.to_rfc3339())
}

/// Recipients of a comment notification: the submitter plus every distinct
/// prior commenter, never the comment's author.
fn comment_recipients(
    submission: &Submission,
    participants: &[String],
    author: &str,
) -> Vec<String> {
    let mut recipients = Vec::new();
    if submission.submitter_username != author {
        recipients.push(submission.submitter_username.clone());
    }
    for participant in participants {
        if participant != author && !recipients.contains(participant) {
            recipients.push(participant.clone());
        }
    }
    recipients
}
