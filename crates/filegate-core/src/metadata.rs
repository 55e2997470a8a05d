//! Per-file metadata sidecars.
//!
//! Sidecars are keyed by `(team, year, filename)` and live in their own
//! tree, distinct from the project tree, so the project directories contain
//! only delivered artifacts. Earlier deployments wrote the sidecar next to
//! the project file; those legacy sidecars are still read transparently on
//! a miss, but new sidecars are never created there.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::paths::{PathResolver, StoreRoot};
use crate::store::{atomic_write_json, read_json_bounded, StoreError};

/// Size cap for a single metadata sidecar.
const MAX_SIDECAR_BYTES: u64 = 1024 * 1024;

/// Suffix appended to the artifact filename to form the sidecar name.
const SIDECAR_SUFFIX: &str = ".meta.json";

/// Metadata recorded for a delivered (or staged) artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataRecord {
    /// Artifact filename (final name, including any collision suffix).
    pub filename: String,
    /// Owning team.
    pub team: String,
    /// Delivery year (the year of the admin decision).
    pub year: i32,
    /// Submitting username.
    pub submitter: String,
    /// Reviewers in decision order: team leader, then admin.
    pub approver_chain: Vec<String>,
    /// When the admin decision landed.
    pub approved_at: DateTime<Utc>,
    /// Description carried over from the submission.
    #[serde(default)]
    pub description: String,
    /// Tags carried over from the submission.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Where the artifact was uploaded from.
    pub source_upload_path: PathBuf,
    /// Final delivered path, absent while the artifact is staged.
    #[serde(default)]
    pub final_path: Option<PathBuf>,
}

/// Sidecar store over the metadata tree.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    resolver: std::sync::Arc<PathResolver>,
}

impl MetadataStore {
    /// Builds a store over the given resolver.
    #[must_use]
    pub const fn new(resolver: std::sync::Arc<PathResolver>) -> Self {
        Self { resolver }
    }

    fn sidecar_path(&self, team: &str, year: i32, filename: &str) -> PathBuf {
        self.resolver
            .resolve(StoreRoot::Metadata)
            .join(team)
            .join(format!("{year:04}"))
            .join(format!("{filename}{SIDECAR_SUFFIX}"))
    }

    fn legacy_sidecar_path(&self, team: &str, year: i32, filename: &str) -> PathBuf {
        self.resolver
            .resolve(StoreRoot::Project)
            .join(team)
            .join(format!("{year:04}"))
            .join(format!("{filename}{SIDECAR_SUFFIX}"))
    }

    /// Writes (or overwrites) the sidecar for a record.
    ///
    /// # Errors
    ///
    /// Propagates filesystem failures from the atomic write.
    pub fn put(&self, record: &MetadataRecord) -> Result<(), StoreError> {
        let path = self.sidecar_path(&record.team, record.year, &record.filename);
        atomic_write_json(&path, record)
    }

    /// Reads the sidecar for `(team, year, filename)`.
    ///
    /// Falls back to a legacy sidecar co-located with the project file when
    /// the metadata tree has no entry.
    ///
    /// # Errors
    ///
    /// Propagates read failures; a sidecar that parses in neither location
    /// reports the metadata-tree error.
    pub fn get(
        &self,
        team: &str,
        year: i32,
        filename: &str,
    ) -> Result<Option<MetadataRecord>, StoreError> {
        let path = self.sidecar_path(team, year, filename);
        if let Some(record) = read_json_bounded(&path, MAX_SIDECAR_BYTES)? {
            return Ok(Some(record));
        }
        let legacy = self.legacy_sidecar_path(team, year, filename);
        read_json_bounded(&legacy, MAX_SIDECAR_BYTES)
    }

    /// Lists all sidecars for one team/year directory.
    ///
    /// # Errors
    ///
    /// Propagates directory and read failures; an absent directory lists as
    /// empty.
    pub fn list(&self, team: &str, year: i32) -> Result<Vec<MetadataRecord>, StoreError> {
        let dir = self
            .resolver
            .resolve(StoreRoot::Metadata)
            .join(team)
            .join(format!("{year:04}"));
        let mut records = Vec::new();
        collect_sidecars(&dir, &mut records)?;
        records.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(records)
    }

    /// Walks the whole metadata tree, returning records matching the
    /// predicate.
    ///
    /// # Errors
    ///
    /// Propagates directory and read failures.
    pub fn search<P>(&self, predicate: P) -> Result<Vec<MetadataRecord>, StoreError>
    where
        P: Fn(&MetadataRecord) -> bool,
    {
        let root = self.resolver.resolve(StoreRoot::Metadata);
        let mut records = Vec::new();
        for team_dir in subdirs(&root)? {
            for year_dir in subdirs(&team_dir)? {
                collect_sidecars(&year_dir, &mut records)?;
            }
        }
        records.retain(|r| predicate(r));
        Ok(records)
    }
}

fn subdirs(dir: &std::path::Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(format!("listing {}", dir.display()), e)),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(format!("listing {}", dir.display()), e))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn collect_sidecars(
    dir: &std::path::Path,
    out: &mut Vec<MetadataRecord>,
) -> Result<(), StoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StoreError::io(format!("listing {}", dir.display()), e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(format!("listing {}", dir.display()), e))?;
        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(SIDECAR_SUFFIX) {
            continue;
        }
        if let Some(record) = read_json_bounded(&entry.path(), MAX_SIDECAR_BYTES)? {
            out.push(record);
        }
    }
    Ok(())
}
