//! Per-user durable notification inboxes.
//!
//! Panels have no push channel; they poll their inbox and track the unread
//! flag. Each inbox is one JSON document, newest first, capped at the most
//! recent 100 entries.
//!
//! Notification ids are derived from what the notification describes
//! (submission, kind, decision time — or the comment id for comment
//! notifications), and appends deduplicate on the id. Transition effects
//! replay on crash recovery, so the same notification may be appended more
//! than once; the derived id makes every replay a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::deadline::Deadline;
use crate::store::{DocumentStore, StoreError};

/// Most recent notifications retained per inbox.
pub const MAX_INBOX_ENTRIES: usize = 100;

/// Domain separator for derived notification ids.
const NOTIFICATION_ID_DOMAIN: &[u8] = b"filegate.notification.v1";

/// What a notification announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// A team leader forwarded the submission to the admin stage.
    TlApproved,
    /// A team leader rejected the submission.
    TlRejected,
    /// An admin approved the submission.
    AdminApproved,
    /// An admin rejected the submission.
    AdminRejected,
    /// A comment was added to a submission the recipient participates in.
    CommentAdded,
    /// A submission entered the team-leader review queue.
    SubmittedToTl,
    /// The submitter withdrew the submission.
    Withdrawn,
}

impl NotificationKind {
    /// Wire string for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TlApproved => "TL_APPROVED",
            Self::TlRejected => "TL_REJECTED",
            Self::AdminApproved => "ADMIN_APPROVED",
            Self::AdminRejected => "ADMIN_REJECTED",
            Self::CommentAdded => "COMMENT_ADDED",
            Self::SubmittedToTl => "SUBMITTED_TO_TL",
            Self::Withdrawn => "WITHDRAWN",
        }
    }
}

/// One inbox entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Notification {
    /// Derived, deduplicating identifier.
    pub id: String,
    /// Inbox owner.
    pub recipient_username: String,
    /// What happened.
    pub kind: NotificationKind,
    /// Subject submission, when there is one.
    #[serde(default)]
    pub submission_id: Option<String>,
    /// Human-readable summary for the panel list.
    pub payload: String,
    /// When the notification was produced.
    pub at: DateTime<Utc>,
    /// Whether the recipient has seen it.
    pub read: bool,
}

/// Derives the deduplicating id for a notification.
///
/// `discriminator` distinguishes otherwise-identical notifications: the
/// decision timestamp for transition notifications, the comment id for
/// comment notifications.
#[must_use]
pub fn notification_id(submission_id: &str, kind: NotificationKind, discriminator: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(NOTIFICATION_ID_DOMAIN);
    hasher.update([0]);
    hasher.update(submission_id.as_bytes());
    hasher.update([0]);
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(discriminator.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

pub(crate) fn hex_prefix(digest: &[u8], bytes: usize) -> String {
    digest
        .iter()
        .take(bytes)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Inbox access for every user.
#[derive(Debug, Clone)]
pub struct NotificationService {
    store: DocumentStore,
}

impl NotificationService {
    /// Builds the service over a document store.
    #[must_use]
    pub const fn new(store: DocumentStore) -> Self {
        Self { store }
    }

    fn inbox_doc(username: &str) -> Result<String, StoreError> {
        if username.is_empty()
            || username.contains('/')
            || username.contains('\\')
            || username.contains('\0')
            || username == "."
            || username == ".."
        {
            return Err(StoreError::InvalidDocPath {
                doc: std::path::PathBuf::from(username),
            });
        }
        Ok(format!("notifications/{username}/inbox.json"))
    }

    /// Appends one notification to its recipient's inbox.
    ///
    /// A notification whose id is already present is dropped; the inbox is
    /// then truncated to [`MAX_INBOX_ENTRIES`].
    ///
    /// # Errors
    ///
    /// Propagates document store failures.
    pub fn append(&self, notification: Notification, deadline: Deadline) -> Result<(), StoreError> {
        let doc = Self::inbox_doc(&notification.recipient_username)?;
        self.store
            .modify_salvage(&doc, deadline, |inbox: &mut Vec<Notification>| {
                if inbox.iter().any(|n| n.id == notification.id) {
                    return;
                }
                inbox.insert(0, notification);
                inbox.truncate(MAX_INBOX_ENTRIES);
            })
    }

    /// A user's inbox, newest first.
    ///
    /// # Errors
    ///
    /// Propagates document store failures.
    pub fn list(&self, username: &str, unread_only: bool) -> Result<Vec<Notification>, StoreError> {
        let doc = Self::inbox_doc(username)?;
        let mut inbox: Vec<Notification> = self.store.read(&doc)?.unwrap_or_default();
        if unread_only {
            inbox.retain(|n| !n.read);
        }
        Ok(inbox)
    }

    /// Count of unread notifications.
    ///
    /// # Errors
    ///
    /// Propagates document store failures.
    pub fn unread_count(&self, username: &str) -> Result<usize, StoreError> {
        Ok(self.list(username, true)?.len())
    }

    /// Flips one notification's read flag. Returns false when the id is
    /// not in the inbox.
    ///
    /// # Errors
    ///
    /// Propagates document store failures.
    pub fn mark_read(
        &self,
        username: &str,
        notification_id: &str,
        deadline: Deadline,
    ) -> Result<bool, StoreError> {
        let doc = Self::inbox_doc(username)?;
        self.store
            .modify_salvage(&doc, deadline, |inbox: &mut Vec<Notification>| {
                match inbox.iter_mut().find(|n| n.id == notification_id) {
                    Some(n) => {
                        n.read = true;
                        true
                    },
                    None => false,
                }
            })
    }

    /// Marks the whole inbox read, returning how many entries flipped.
    ///
    /// # Errors
    ///
    /// Propagates document store failures.
    pub fn mark_all_read(&self, username: &str, deadline: Deadline) -> Result<usize, StoreError> {
        let doc = Self::inbox_doc(username)?;
        self.store
            .modify_salvage(&doc, deadline, |inbox: &mut Vec<Notification>| {
                let mut flipped = 0;
                for n in inbox.iter_mut() {
                    if !n.read {
                        n.read = true;
                        flipped += 1;
                    }
                }
                flipped
            })
    }
}
