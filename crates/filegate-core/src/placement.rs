//! Artifact placement: upload tree → final project tree.
//!
//! Invoked after an admin approval. The pipeline computes
//! `PROJECT_ROOT/{team}/{YYYY}/{filename}` from the submission and the
//! decision year, then walks a fixed fallback chain:
//!
//! 1. Direct delivery into the project tree. The target filename gets a
//!    ` (n)` collision suffix; targets are reserved with `create_new` so an
//!    existing file is never overwritten. The move itself is a rename when
//!    the upload and project trees share a filesystem, and a
//!    copy + fsync + remove otherwise.
//! 2. On failure (typically a permission denial on the project export), a
//!    copy into the staging tree with the same collision policy.
//! 3. If staging also fails, an open manual-placement request record.
//!
//! The approval itself is never rolled back; a non-delivered outcome is
//! recorded on the submission and the background [`retry sweep`] keeps
//! re-attempting direct delivery until permissions allow it.
//!
//! Placement never follows symlinks: a symlinked source, team directory,
//! or year directory aborts the attempt.
//!
//! [`retry sweep`]: PlacementPipeline::retry_sweep

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::archive::{ArchiveKind, ArchiveStore};
use crate::deadline::Deadline;
use crate::metadata::{MetadataRecord, MetadataStore};
use crate::paths::{PathResolver, StoreRoot};
use crate::store::{DocumentStore, StoreError};
use crate::submission::{PlacementOutcome, Submission, validate_filename};

/// Document holding open manual-placement requests.
pub const PLACEMENT_REQUESTS_DOC: &str = "approvals/placement_requests.json";

/// Collision suffix attempts before giving up on a directory.
const MAX_COLLISION_SUFFIX: u32 = 9999;

/// An open request for an operator to place an artifact by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementRequest {
    /// The approved submission whose artifact needs placing.
    pub submission_id: String,
    /// Where the artifact currently sits.
    pub from: PathBuf,
    /// The directory it should land in.
    pub to: PathBuf,
    /// Why automatic placement failed.
    pub reason: String,
    /// When the request was opened.
    pub requested_at: DateTime<Utc>,
}

/// What one placement attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementResult {
    /// The outcome to record on the submission.
    pub outcome: PlacementOutcome,
    /// Final path for delivered, staging path for staged.
    pub path: Option<PathBuf>,
    /// Failure detail for non-delivered outcomes.
    pub detail: Option<String>,
}

/// Counters from one retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Records with a non-delivered outcome that were examined.
    pub scanned: usize,
    /// Records promoted to delivered.
    pub promoted: usize,
    /// Records whose retry failed and remain pending.
    pub failed: usize,
}

/// The placement pipeline.
#[derive(Debug, Clone)]
pub struct PlacementPipeline {
    resolver: Arc<PathResolver>,
    store: DocumentStore,
    metadata: MetadataStore,
}

impl PlacementPipeline {
    /// Builds the pipeline.
    #[must_use]
    pub const fn new(
        resolver: Arc<PathResolver>,
        store: DocumentStore,
        metadata: MetadataStore,
    ) -> Self {
        Self {
            resolver,
            store,
            metadata,
        }
    }

    /// Places an approved submission's artifact, walking the fallback
    /// chain. Writes the metadata sidecar for delivered and staged
    /// outcomes.
    ///
    /// # Errors
    ///
    /// Only document-store failures (recording a manual request) surface;
    /// filesystem failures are absorbed into the returned outcome.
    pub fn place(
        &self,
        submission: &Submission,
        decided_at: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<PlacementResult, StoreError> {
        let year = decided_at.year();
        let team = submission.submitter_team.as_str();
        if let Err(detail) = validate_filename(team) {
            return self.open_manual_request(
                submission,
                &self.resolver.resolve(StoreRoot::Project),
                format!("team tag unusable as a directory name: {detail}"),
                deadline,
            );
        }

        let project_dir = self
            .resolver
            .resolve(StoreRoot::Project)
            .join(team)
            .join(format!("{year:04}"));

        match deliver_into(&submission.upload_path, &project_dir, &submission.original_filename) {
            Ok(final_path) => {
                info!(id = %submission.id, path = %final_path.display(), "artifact delivered");
                self.write_sidecar(submission, decided_at, year, &final_path, true);
                return Ok(PlacementResult {
                    outcome: PlacementOutcome::Delivered,
                    path: Some(final_path),
                    detail: None,
                });
            },
            Err(direct_err) => {
                warn!(
                    id = %submission.id,
                    dir = %project_dir.display(),
                    error = %direct_err,
                    "direct placement failed, trying staging"
                );

                let staging_dir = self
                    .resolver
                    .resolve(StoreRoot::Staging)
                    .join(team)
                    .join(format!("{year:04}"));
                match stage_into(
                    &submission.upload_path,
                    &staging_dir,
                    &submission.original_filename,
                ) {
                    Ok(staged_path) => {
                        info!(id = %submission.id, path = %staged_path.display(), "artifact staged");
                        self.write_sidecar(submission, decided_at, year, &staged_path, false);
                        Ok(PlacementResult {
                            outcome: PlacementOutcome::Staged,
                            path: Some(staged_path),
                            detail: Some(direct_err.to_string()),
                        })
                    },
                    Err(staging_err) => self.open_manual_request(
                        submission,
                        &project_dir,
                        format!("direct: {direct_err}; staging: {staging_err}"),
                        deadline,
                    ),
                }
            },
        }
    }

    /// Re-attempts direct delivery for every approved-archive record with a
    /// non-delivered outcome.
    ///
    /// Idempotent: the target is computed fresh each attempt, a promoted
    /// record is rewritten in the archive, and its staged copy and open
    /// manual request are cleaned up.
    ///
    /// # Errors
    ///
    /// Propagates document store failures; per-record filesystem failures
    /// are counted in [`SweepStats::failed`] instead.
    pub fn retry_sweep(
        &self,
        archive: &ArchiveStore,
        deadline: Deadline,
    ) -> Result<SweepStats, StoreError> {
        let mut stats = SweepStats::default();
        for record in archive.list(ArchiveKind::Approved)? {
            let pending = matches!(
                record.placement_outcome,
                Some(PlacementOutcome::Staged | PlacementOutcome::ManualRequested)
            );
            if !pending {
                continue;
            }
            stats.scanned += 1;

            match self.retry_one(&record, deadline) {
                Ok(final_path) => {
                    archive.update(ArchiveKind::Approved, &record.id, deadline, |r| {
                        r.placement_outcome = Some(PlacementOutcome::Delivered);
                        r.placement_target_path = Some(final_path.clone());
                        r.side_effect_failures.clear();
                    })?;
                    self.close_manual_request(&record.id, deadline)?;
                    info!(id = %record.id, path = %final_path.display(), "staged artifact promoted");
                    stats.promoted += 1;
                },
                Err(e) => {
                    debug!(id = %record.id, error = %e, "placement retry failed");
                    stats.failed += 1;
                },
            }
        }
        Ok(stats)
    }

    /// Open manual-placement requests, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates document store failures.
    pub fn open_requests(&self) -> Result<Vec<PlacementRequest>, StoreError> {
        Ok(self.store.read(PLACEMENT_REQUESTS_DOC)?.unwrap_or_default())
    }

    fn retry_one(&self, record: &Submission, _deadline: Deadline) -> io::Result<PathBuf> {
        let decided_at = record.admin_decided_at.unwrap_or(record.submitted_at);
        let year = decided_at.year();
        let project_dir = self
            .resolver
            .resolve(StoreRoot::Project)
            .join(&record.submitter_team)
            .join(format!("{year:04}"));

        // Prefer the original upload; fall back to the staged copy.
        let staged = record
            .placement_target_path
            .as_deref()
            .filter(|p| p.exists());
        let source = if record.upload_path.exists() {
            record.upload_path.as_path()
        } else if let Some(staged) = staged {
            staged
        } else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "neither upload nor staged copy exists",
            ));
        };

        let final_path = deliver_into(source, &project_dir, &record.original_filename)?;
        self.write_sidecar(record, decided_at, year, &final_path, true);

        // The delivery consumed `source`; remove the other copy if it still
        // exists so nothing lingers in staging.
        if let Some(staged) = record.placement_target_path.as_deref() {
            if staged != final_path && staged.exists() {
                let _ = std::fs::remove_file(staged);
            }
        }
        Ok(final_path)
    }

    fn open_manual_request(
        &self,
        submission: &Submission,
        target_dir: &Path,
        reason: String,
        deadline: Deadline,
    ) -> Result<PlacementResult, StoreError> {
        warn!(id = %submission.id, reason = %reason, "placement requires manual intervention");
        let request = PlacementRequest {
            submission_id: submission.id.clone(),
            from: submission.upload_path.clone(),
            to: target_dir.to_path_buf(),
            reason: reason.clone(),
            requested_at: Utc::now(),
        };
        self.store.modify_salvage(
            PLACEMENT_REQUESTS_DOC,
            deadline,
            |requests: &mut Vec<PlacementRequest>| {
                if !requests
                    .iter()
                    .any(|r| r.submission_id == request.submission_id)
                {
                    requests.push(request);
                }
            },
        )?;
        Ok(PlacementResult {
            outcome: PlacementOutcome::ManualRequested,
            path: None,
            detail: Some(reason),
        })
    }

    fn close_manual_request(&self, submission_id: &str, deadline: Deadline) -> Result<(), StoreError> {
        self.store.modify_salvage(
            PLACEMENT_REQUESTS_DOC,
            deadline,
            |requests: &mut Vec<PlacementRequest>| {
                requests.retain(|r| r.submission_id != submission_id);
            },
        )
    }

    fn write_sidecar(
        &self,
        submission: &Submission,
        decided_at: DateTime<Utc>,
        year: i32,
        artifact_path: &Path,
        delivered: bool,
    ) {
        let filename = artifact_path
            .file_name()
            .map_or_else(|| submission.original_filename.clone(), |n| {
                n.to_string_lossy().into_owned()
            });
        let mut approver_chain = Vec::new();
        if let Some(tl) = &submission.tl_reviewer {
            approver_chain.push(tl.clone());
        }
        if let Some(admin) = &submission.admin_reviewer {
            approver_chain.push(admin.clone());
        }
        let record = MetadataRecord {
            filename,
            team: submission.submitter_team.clone(),
            year,
            submitter: submission.submitter_username.clone(),
            approver_chain,
            approved_at: decided_at,
            description: submission.description.clone(),
            tags: submission.tags.clone(),
            source_upload_path: submission.upload_path.clone(),
            final_path: delivered.then(|| artifact_path.to_path_buf()),
        };
        if let Err(e) = self.metadata.put(&record) {
            warn!(id = %submission.id, error = %e, "metadata sidecar write failed");
        }
    }
}

/// Moves `source` into `dir` under `filename`, applying the collision
/// suffix.
///
/// A free target name is reserved with `create_new` first, so an existing
/// file is never overwritten; the move then renames over the engine's own
/// reservation. When the rename crosses filesystems (upload tree and
/// project tree on different mounts) it degrades to copy + fsync + remove.
/// On any failure the reservation is removed, so a half-finished move
/// never leaves an orphan occupying a project filename.
fn deliver_into(source: &Path, dir: &Path, filename: &str) -> io::Result<PathBuf> {
    refuse_symlink(source)?;
    std::fs::create_dir_all(dir)?;
    refuse_symlink(dir)?;
    if let Some(parent) = dir.parent() {
        refuse_symlink(parent)?;
    }

    let target = reserve_target(dir, filename)?;
    let moved = match std::fs::rename(source, &target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            copy_contents(source, &target).and_then(|()| std::fs::remove_file(source))
        },
        Err(e) => Err(e),
    };
    match moved {
        Ok(()) => Ok(target),
        Err(e) => {
            let _ = std::fs::remove_file(&target);
            Err(e)
        },
    }
}

/// Copies `source` into `dir` under `filename`, leaving the source in
/// place. Used for the staging fallback so the retrier can still attempt a
/// direct move from the upload tree. The reservation is removed on a
/// failed copy.
fn stage_into(source: &Path, dir: &Path, filename: &str) -> io::Result<PathBuf> {
    refuse_symlink(source)?;
    std::fs::create_dir_all(dir)?;
    refuse_symlink(dir)?;
    if let Some(parent) = dir.parent() {
        refuse_symlink(parent)?;
    }

    let target = reserve_target(dir, filename)?;
    match copy_contents(source, &target) {
        Ok(()) => Ok(target),
        Err(e) => {
            let _ = std::fs::remove_file(&target);
            Err(e)
        },
    }
}

/// Reserves a free target name with `create_new`, never overwriting an
/// existing file.
fn reserve_target(dir: &Path, filename: &str) -> io::Result<PathBuf> {
    for n in 0..=MAX_COLLISION_SUFFIX {
        let candidate = dir.join(collision_name(filename, n));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free collision suffix for {filename} in {}", dir.display()),
    ))
}

/// Copies the artifact bytes into the reserved target and makes them
/// durable.
fn copy_contents(source: &Path, target: &Path) -> io::Result<()> {
    let mut input = std::fs::File::open(source)?;
    let mut out = std::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(target)?;
    io::copy(&mut input, &mut out)?;
    out.sync_all()
}

/// Applies the ` (n)` collision suffix before the extension.
fn collision_name(filename: &str, n: u32) -> String {
    if n == 0 {
        return filename.to_string();
    }
    match filename.rfind('.') {
        Some(dot) if dot > 0 => {
            format!("{} ({n}){}", &filename[..dot], &filename[dot..])
        },
        _ => format!("{filename} ({n})"),
    }
}

fn refuse_symlink(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing symlink at {}", path.display()),
        )),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
