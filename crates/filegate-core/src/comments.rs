//! Per-submission comment threads.
//!
//! One document per submission, ordered oldest first. Comment ids are
//! derived from the comment's content and stamp, which both deduplicates
//! effect replays and gives the notification fan-out a stable key.
//!
//! Earlier deployments kept a single monolithic comments document; that
//! format is ingested once by [`CommentStore::migrate_legacy`] and never
//! read at display time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::deadline::Deadline;
use crate::identity::{Role, UserIdentity};
use crate::notify::hex_prefix;
use crate::store::{DocumentStore, StoreError, read_json_bounded};
use crate::submission::Submission;

/// Domain separator for derived comment ids.
const COMMENT_ID_DOMAIN: &[u8] = b"filegate.comment.v1";

/// Size cap for a legacy monolithic comments document.
const MAX_LEGACY_DOC_BYTES: u64 = 32 * 1024 * 1024;

/// One comment on a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Comment {
    /// Derived identifier, stable across replays.
    pub id: String,
    /// The submission commented on.
    pub submission_id: String,
    /// Commenting username.
    pub author_username: String,
    /// The author's role at the time of the comment.
    pub author_role: Role,
    /// Comment text.
    pub body: String,
    /// When the comment was recorded.
    pub at: DateTime<Utc>,
}

/// Derives the deduplicating id for a comment.
#[must_use]
pub fn comment_id(submission_id: &str, at: DateTime<Utc>, author: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(COMMENT_ID_DOMAIN);
    hasher.update([0]);
    hasher.update(submission_id.as_bytes());
    hasher.update([0]);
    hasher.update(at.to_rfc3339().as_bytes());
    hasher.update([0]);
    hasher.update(author.as_bytes());
    hasher.update([0]);
    hasher.update(body.as_bytes());
    hex_prefix(&hasher.finalize(), 16)
}

/// Result of a legacy comment migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStats {
    /// Threads touched.
    pub threads: usize,
    /// Comments written into per-submission documents.
    pub imported: usize,
    /// Entries skipped (already present, or unparseable stamps).
    pub skipped: usize,
}

/// On-disk shape of one legacy comment entry.
#[derive(Debug, Deserialize)]
struct LegacyComment {
    admin_id: String,
    comment: String,
    timestamp: String,
}

/// Comment thread access.
#[derive(Debug, Clone)]
pub struct CommentStore {
    store: DocumentStore,
}

impl CommentStore {
    /// Builds the store.
    #[must_use]
    pub const fn new(store: DocumentStore) -> Self {
        Self { store }
    }

    fn thread_doc(submission_id: &str) -> Result<String, StoreError> {
        if submission_id.is_empty()
            || submission_id.contains('/')
            || submission_id.contains('\\')
            || submission_id.contains('\0')
            || submission_id.starts_with('.')
        {
            return Err(StoreError::InvalidDocPath {
                doc: std::path::PathBuf::from(submission_id),
            });
        }
        Ok(format!("approvals/comments/{submission_id}.json"))
    }

    /// Appends a comment, stamping `at` and assigning the derived id.
    ///
    /// # Errors
    ///
    /// Propagates document store failures.
    pub fn append(
        &self,
        submission_id: &str,
        author: &UserIdentity,
        body: &str,
        at: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<Comment, StoreError> {
        let comment = Comment {
            id: comment_id(submission_id, at, &author.username, body),
            submission_id: submission_id.to_string(),
            author_username: author.username.clone(),
            author_role: author.role,
            body: body.to_string(),
            at,
        };
        let doc = Self::thread_doc(submission_id)?;
        let stored = comment.clone();
        self.store
            .modify_salvage(&doc, deadline, |thread: &mut Vec<Comment>| {
                if !thread.iter().any(|c| c.id == stored.id) {
                    thread.push(stored);
                }
            })?;
        Ok(comment)
    }

    /// The thread for a submission, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates document store failures.
    pub fn list(&self, submission_id: &str) -> Result<Vec<Comment>, StoreError> {
        let doc = Self::thread_doc(submission_id)?;
        Ok(self.store.read(&doc)?.unwrap_or_default())
    }

    /// Distinct authors that have commented on a submission, in first-post
    /// order.
    ///
    /// # Errors
    ///
    /// Propagates document store failures.
    pub fn participants(&self, submission_id: &str) -> Result<Vec<String>, StoreError> {
        let mut authors = Vec::new();
        for comment in self.list(submission_id)? {
            if !authors.contains(&comment.author_username) {
                authors.push(comment.author_username);
            }
        }
        Ok(authors)
    }

    /// One-shot ingest of a legacy monolithic comments document.
    ///
    /// The legacy document maps submission id to a list of
    /// `{admin_id, comment, timestamp}` entries. Each entry is appended to
    /// the per-submission thread unless its derived id is already present.
    /// On success the legacy file is renamed aside with a `.migrated`
    /// suffix so the migration cannot run twice.
    ///
    /// # Errors
    ///
    /// Propagates read, parse, and store failures. A missing legacy file
    /// reports zero-stat success.
    pub fn migrate_legacy(
        &self,
        legacy_path: &std::path::Path,
        deadline: Deadline,
    ) -> Result<MigrationStats, StoreError> {
        type LegacyDoc = std::collections::BTreeMap<String, Vec<LegacyComment>>;
        let Some(legacy): Option<LegacyDoc> =
            read_json_bounded(legacy_path, MAX_LEGACY_DOC_BYTES)?
        else {
            return Ok(MigrationStats::default());
        };

        let mut stats = MigrationStats::default();
        for (submission_id, entries) in legacy {
            let doc = match Self::thread_doc(&submission_id) {
                Ok(doc) => doc,
                Err(_) => {
                    stats.skipped += entries.len();
                    continue;
                },
            };
            stats.threads += 1;

            let mut converted = Vec::new();
            for entry in entries {
                let Ok(at) = entry.timestamp.parse::<DateTime<Utc>>() else {
                    stats.skipped += 1;
                    continue;
                };
                converted.push(Comment {
                    id: comment_id(&submission_id, at, &entry.admin_id, &entry.comment),
                    submission_id: submission_id.clone(),
                    author_username: entry.admin_id,
                    // Legacy entries carry no role; they were written from
                    // the review panels.
                    author_role: Role::Admin,
                    body: entry.comment,
                    at,
                });
            }

            let (imported, skipped) =
                self.store
                    .modify_salvage(&doc, deadline, |thread: &mut Vec<Comment>| {
                        let mut imported = 0;
                        let mut skipped = 0;
                        for comment in converted {
                            if thread.iter().any(|c| c.id == comment.id) {
                                skipped += 1;
                            } else {
                                thread.push(comment);
                                imported += 1;
                            }
                        }
                        thread.sort_by_key(|c| c.at);
                        (imported, skipped)
                    })?;
            stats.imported += imported;
            stats.skipped += skipped;
        }

        let aside = legacy_path.with_extension("json.migrated");
        std::fs::rename(legacy_path, &aside).map_err(|e| {
            StoreError::io(format!("renaming {} aside", legacy_path.display()), e)
        })?;
        info!(
            legacy = %legacy_path.display(),
            threads = stats.threads,
            imported = stats.imported,
            skipped = stats.skipped,
            "migrated legacy comments"
        );
        Ok(stats)
    }
}

/// Comment visibility for one user on one submission.
///
/// Admins see every thread; team leaders see threads of their teams'
/// submissions; other users see threads they submitted or have already
/// commented in.
#[must_use]
pub fn can_view_thread(
    identity: &UserIdentity,
    submission: &Submission,
    participants: &[String],
) -> bool {
    match identity.role {
        Role::Admin => true,
        Role::TeamLeader => identity.has_team(&submission.submitter_team),
        Role::User => {
            identity.username == submission.submitter_username
                || participants.contains(&identity.username)
        },
    }
}
