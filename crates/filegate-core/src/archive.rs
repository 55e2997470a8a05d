//! Ring-buffered archives of terminal submissions.
//!
//! One append-only (from the repository's viewpoint) log per terminal
//! outcome, newest first, capped at the configured size. Eviction drops the
//! chronologically oldest records. Appends deduplicate by submission id so
//! an at-least-once effect replay cannot double-archive.
//!
//! The placement retrier is the one writer that reaches back into an
//! archived record: it rewrites the placement fields of an approved record
//! when a staged artifact is finally delivered.

use tracing::debug;

use crate::deadline::Deadline;
use crate::store::{DocumentStore, StoreError};
use crate::submission::{Submission, SubmissionState};

/// Which archive ring a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// Admin-approved submissions.
    Approved,
    /// Submissions rejected at the admin stage.
    RejectedByAdmin,
    /// Submissions rejected at the team-leader stage.
    RejectedByTeamLeader,
    /// Submissions withdrawn by their submitter.
    Withdrawn,
}

impl ArchiveKind {
    /// Document name backing this ring.
    #[must_use]
    pub const fn doc(self) -> &'static str {
        match self {
            Self::Approved => "approvals/archive/approved.json",
            Self::RejectedByAdmin => "approvals/archive/rejected_admin.json",
            Self::RejectedByTeamLeader => "approvals/archive/rejected_tl.json",
            Self::Withdrawn => "approvals/archive/withdrawn.json",
        }
    }

    /// The ring matching a terminal state, `None` for live states.
    #[must_use]
    pub const fn for_state(state: SubmissionState) -> Option<Self> {
        match state {
            SubmissionState::Approved => Some(Self::Approved),
            SubmissionState::RejectedByAdmin => Some(Self::RejectedByAdmin),
            SubmissionState::RejectedByTeamLeader => Some(Self::RejectedByTeamLeader),
            SubmissionState::Withdrawn => Some(Self::Withdrawn),
            _ => None,
        }
    }

    /// All rings, for sweeps and audits.
    #[must_use]
    pub const fn all() -> [Self; 4] {
        [
            Self::Approved,
            Self::RejectedByAdmin,
            Self::RejectedByTeamLeader,
            Self::Withdrawn,
        ]
    }
}

/// Capped archive of terminal submissions.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    store: DocumentStore,
    cap: usize,
}

impl ArchiveStore {
    /// Builds an archive store with the given ring cap.
    #[must_use]
    pub const fn new(store: DocumentStore, cap: usize) -> Self {
        Self { store, cap }
    }

    /// Appends a record to the matching ring, newest first.
    ///
    /// A record whose id is already present is left untouched: archive
    /// writes replay on crash recovery and must be idempotent.
    ///
    /// # Errors
    ///
    /// Propagates document store failures.
    pub fn append(
        &self,
        kind: ArchiveKind,
        submission: &Submission,
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        let record = submission.clone();
        let cap = self.cap;
        let appended = self
            .store
            .modify_salvage(kind.doc(), deadline, |ring: &mut Vec<Submission>| {
                if ring.iter().any(|r| r.id == record.id) {
                    return false;
                }
                ring.insert(0, record);
                ring.truncate(cap);
                true
            })?;
        if appended {
            debug!(doc = kind.doc(), id = %submission.id, "archived submission");
        }
        Ok(())
    }

    /// Snapshot of a ring, newest first.
    ///
    /// # Errors
    ///
    /// Propagates document store failures.
    pub fn list(&self, kind: ArchiveKind) -> Result<Vec<Submission>, StoreError> {
        Ok(self.store.read(kind.doc())?.unwrap_or_default())
    }

    /// Finds one archived record by id.
    ///
    /// # Errors
    ///
    /// Propagates document store failures.
    pub fn find(&self, kind: ArchiveKind, id: &str) -> Result<Option<Submission>, StoreError> {
        Ok(self.list(kind)?.into_iter().find(|r| r.id == id))
    }

    /// Rewrites one archived record in place.
    ///
    /// Returns false when no record with the id exists in the ring.
    ///
    /// # Errors
    ///
    /// Propagates document store failures.
    pub fn update<F>(
        &self,
        kind: ArchiveKind,
        id: &str,
        deadline: Deadline,
        f: F,
    ) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Submission),
    {
        self.store
            .modify_salvage(kind.doc(), deadline, |ring: &mut Vec<Submission>| {
                match ring.iter_mut().find(|r| r.id == id) {
                    Some(record) => {
                        f(record);
                        true
                    },
                    None => false,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::paths::PathResolver;
    use crate::submission::PlacementOutcome;

    fn archive_in(tmp: &std::path::Path, cap: usize) -> ArchiveStore {
        let config = EngineConfig {
            network_root: tmp.join("share"),
            local_fallback_root: tmp.join("local"),
            ..EngineConfig::default()
        };
        let store = DocumentStore::new(Arc::new(PathResolver::new(&config)));
        ArchiveStore::new(store, cap)
    }

    fn terminal_submission(id: &str, state: SubmissionState) -> Submission {
        let mut sub = Submission::new_draft(
            id.into(),
            "alice",
            "AGCC",
            format!("{id}.pdf"),
            format!("/uploads/alice/{id}.pdf").into(),
            10,
            String::new(),
            Vec::new(),
            Utc::now(),
        );
        sub.state = state;
        sub
    }

    #[test]
    fn kind_for_state_covers_terminals_only() {
        assert_eq!(
            ArchiveKind::for_state(SubmissionState::Approved),
            Some(ArchiveKind::Approved)
        );
        assert_eq!(
            ArchiveKind::for_state(SubmissionState::RejectedByAdmin),
            Some(ArchiveKind::RejectedByAdmin)
        );
        assert_eq!(
            ArchiveKind::for_state(SubmissionState::RejectedByTeamLeader),
            Some(ArchiveKind::RejectedByTeamLeader)
        );
        assert_eq!(
            ArchiveKind::for_state(SubmissionState::Withdrawn),
            Some(ArchiveKind::Withdrawn)
        );
        assert_eq!(ArchiveKind::for_state(SubmissionState::PendingAdmin), None);
        assert_eq!(ArchiveKind::for_state(SubmissionState::Draft), None);
    }

    #[test]
    fn append_is_newest_first() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let archive = archive_in(tmp.path(), 10);

        for i in 0..3 {
            let sub = terminal_submission(&format!("sub-{i}"), SubmissionState::Approved);
            archive
                .append(ArchiveKind::Approved, &sub, Deadline::none())
                .expect("append");
        }

        let ring = archive.list(ArchiveKind::Approved).expect("list");
        let ids: Vec<_> = ring.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["sub-2", "sub-1", "sub-0"]);
    }

    #[test]
    fn append_deduplicates_by_id() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let archive = archive_in(tmp.path(), 10);
        let sub = terminal_submission("sub-1", SubmissionState::Approved);

        archive
            .append(ArchiveKind::Approved, &sub, Deadline::none())
            .expect("first append");
        archive
            .append(ArchiveKind::Approved, &sub, Deadline::none())
            .expect("replayed append");

        assert_eq!(archive.list(ArchiveKind::Approved).expect("list").len(), 1);
    }

    #[test]
    fn cap_evicts_oldest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let archive = archive_in(tmp.path(), 5);

        for i in 0..8 {
            let sub =
                terminal_submission(&format!("sub-{i}"), SubmissionState::RejectedByAdmin);
            archive
                .append(ArchiveKind::RejectedByAdmin, &sub, Deadline::none())
                .expect("append");
        }

        let ring = archive.list(ArchiveKind::RejectedByAdmin).expect("list");
        assert_eq!(ring.len(), 5);
        let ids: Vec<_> = ring.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["sub-7", "sub-6", "sub-5", "sub-4", "sub-3"]);
        // The three oldest were evicted.
        assert!(archive
            .find(ArchiveKind::RejectedByAdmin, "sub-0")
            .expect("find")
            .is_none());
    }

    #[test]
    fn update_rewrites_in_place() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let archive = archive_in(tmp.path(), 10);
        let mut sub = terminal_submission("sub-1", SubmissionState::Approved);
        sub.placement_outcome = Some(PlacementOutcome::Staged);
        archive
            .append(ArchiveKind::Approved, &sub, Deadline::none())
            .expect("append");

        let touched = archive
            .update(ArchiveKind::Approved, "sub-1", Deadline::none(), |record| {
                record.placement_outcome = Some(PlacementOutcome::Delivered);
            })
            .expect("update");
        assert!(touched);

        let back = archive
            .find(ArchiveKind::Approved, "sub-1")
            .expect("find")
            .expect("present");
        assert_eq!(back.placement_outcome, Some(PlacementOutcome::Delivered));

        let missed = archive
            .update(ArchiveKind::Approved, "ghost", Deadline::none(), |_| ())
            .expect("update");
        assert!(!missed);
    }

    #[test]
    fn rings_are_independent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let archive = archive_in(tmp.path(), 10);

        let approved = terminal_submission("sub-a", SubmissionState::Approved);
        let withdrawn = terminal_submission("sub-w", SubmissionState::Withdrawn);
        archive
            .append(ArchiveKind::Approved, &approved, Deadline::none())
            .expect("append approved");
        archive
            .append(ArchiveKind::Withdrawn, &withdrawn, Deadline::none())
            .expect("append withdrawn");

        assert_eq!(archive.list(ArchiveKind::Approved).expect("list").len(), 1);
        assert_eq!(archive.list(ArchiveKind::Withdrawn).expect("list").len(), 1);
        assert!(archive
            .list(ArchiveKind::RejectedByAdmin)
            .expect("list")
            .is_empty());
    }
}
