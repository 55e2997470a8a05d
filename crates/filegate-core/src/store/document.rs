//! The named-document store.
//!
//! Documents are addressed by a relative name such as
//! `approvals/queue.json`, resolved against the shared base on every access
//! so resolver fallback takes effect without rebuilding the store.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::lock::DocLockGuard;
use super::{StoreError, fsio};
use crate::deadline::Deadline;
use crate::paths::PathResolver;

/// Default size cap for any single document read.
///
/// 16 MiB is generous for JSON state documents while still bounding what a
/// corrupted or adversarial file can make a reader allocate.
pub const DEFAULT_MAX_DOC_BYTES: u64 = 16 * 1024 * 1024;

/// Read/modify/append/list access to named JSON documents.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    resolver: Arc<PathResolver>,
    max_doc_bytes: u64,
}

impl DocumentStore {
    /// Builds a store over the given resolver with the default size cap.
    #[must_use]
    pub fn new(resolver: Arc<PathResolver>) -> Self {
        Self {
            resolver,
            max_doc_bytes: DEFAULT_MAX_DOC_BYTES,
        }
    }

    /// Overrides the per-document size cap.
    #[must_use]
    pub const fn with_max_doc_bytes(mut self, max_doc_bytes: u64) -> Self {
        self.max_doc_bytes = max_doc_bytes;
        self
    }

    /// The resolver backing this store.
    #[must_use]
    pub fn resolver(&self) -> &Arc<PathResolver> {
        &self.resolver
    }

    /// Physical path for a document name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidDocPath`] when the name is absolute or
    /// contains parent references.
    pub fn doc_path(&self, doc: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(doc);
        let escapes = rel.components().any(|c| {
            !matches!(c, Component::Normal(_) | Component::CurDir)
        });
        if escapes || rel.as_os_str().is_empty() {
            return Err(StoreError::InvalidDocPath {
                doc: rel.to_path_buf(),
            });
        }
        Ok(self.resolver.shared_base().join(rel))
    }

    /// Non-locking snapshot read of a document.
    ///
    /// Returns `Ok(None)` for an absent document. May be slightly stale
    /// with respect to a concurrent `modify`.
    ///
    /// # Errors
    ///
    /// Propagates [`StoreError`] from path validation or the bounded read.
    pub fn read<T: DeserializeOwned>(&self, doc: &str) -> Result<Option<T>, StoreError> {
        let path = self.doc_path(doc)?;
        fsio::read_json_bounded(&path, self.max_doc_bytes)
    }

    /// Read-mutate-write under the document's exclusive lock.
    ///
    /// The mutation function sees the current document value (the default
    /// for an absent document) and mutates it in place; the result is
    /// written back atomically before the lock is released. The function's
    /// return value passes through to the caller.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Corrupt`] when the current content fails to parse.
    /// - [`StoreError::Deadline`] when the deadline expires at a
    ///   checkpoint.
    /// - Lock and I/O failures as [`StoreError::Unavailable`] /
    ///   [`StoreError::Io`].
    pub fn modify<T, R, F>(&self, doc: &str, deadline: Deadline, f: F) -> Result<R, StoreError>
    where
        T: Default + Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> R,
    {
        self.modify_inner(doc, deadline, false, f)
    }

    /// Like [`DocumentStore::modify`], but a malformed document is moved
    /// aside and treated as empty instead of failing.
    ///
    /// The displaced content is preserved next to the document as
    /// `<name>.corrupt-<epoch-secs>` for operator inspection.
    ///
    /// # Errors
    ///
    /// As [`DocumentStore::modify`], minus the corrupt case.
    pub fn modify_salvage<T, R, F>(
        &self,
        doc: &str,
        deadline: Deadline,
        f: F,
    ) -> Result<R, StoreError>
    where
        T: Default + Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> R,
    {
        self.modify_inner(doc, deadline, true, f)
    }

    fn modify_inner<T, R, F>(
        &self,
        doc: &str,
        deadline: Deadline,
        salvage: bool,
        f: F,
    ) -> Result<R, StoreError>
    where
        T: Default + Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> R,
    {
        if deadline.is_expired() {
            return Err(StoreError::Deadline);
        }
        let path = self.doc_path(doc)?;

        let _guard = DocLockGuard::acquire(&path, deadline)?;

        // Re-read under the lock: this is the value every other writer has
        // finished with.
        let mut value = match fsio::read_json_bounded::<T>(&path, self.max_doc_bytes) {
            Ok(current) => current.unwrap_or_default(),
            Err(StoreError::Corrupt { doc, detail }) if salvage => {
                let aside = quarantine_corrupt(&path);
                warn!(doc = %doc, detail = %detail, aside = %aside.display(), "salvaged corrupt document");
                T::default()
            },
            Err(e) => return Err(e),
        };

        let result = f(&mut value);

        if deadline.is_expired() {
            return Err(StoreError::Deadline);
        }
        fsio::atomic_write_json(&path, &value)?;
        Ok(result)
    }

    /// Appends one record to a list document.
    ///
    /// # Errors
    ///
    /// As [`DocumentStore::modify`].
    pub fn append<T>(&self, doc: &str, deadline: Deadline, record: T) -> Result<(), StoreError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.modify(doc, deadline, |list: &mut Vec<T>| list.push(record))
    }

    /// Lists document names (relative to the store base) under a prefix
    /// directory, sorted.
    ///
    /// Only `.json` entries are reported; lock files and salvage leftovers
    /// are skipped. An absent prefix directory lists as empty.
    ///
    /// # Errors
    ///
    /// Propagates path validation and directory read failures.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.doc_path(prefix)?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(format!("listing {}", dir.display()), e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| StoreError::io(format!("listing {}", dir.display()), e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".json") {
                names.push(format!("{prefix}/{name}"));
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Moves a corrupt document aside, returning the quarantine path.
fn quarantine_corrupt(path: &Path) -> PathBuf {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let mut name = path
        .file_name()
        .map_or_else(|| std::ffi::OsString::from("doc"), std::ffi::OsStr::to_os_string);
    name.push(format!(".corrupt-{epoch}"));
    let aside = path.with_file_name(name);
    let _ = std::fs::rename(path, &aside);
    aside
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::EngineConfig;

    fn store_in(tmp: &Path) -> DocumentStore {
        let config = EngineConfig {
            network_root: tmp.join("share"),
            local_fallback_root: tmp.join("local"),
            ..EngineConfig::default()
        };
        DocumentStore::new(Arc::new(PathResolver::new(&config)))
    }

    #[test]
    fn modify_creates_then_mutates() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());

        store
            .modify(
                "approvals/queue.json",
                Deadline::none(),
                |map: &mut BTreeMap<String, u32>| {
                    map.insert("a".into(), 1);
                },
            )
            .expect("first modify");
        let count = store
            .modify(
                "approvals/queue.json",
                Deadline::none(),
                |map: &mut BTreeMap<String, u32>| {
                    map.insert("b".into(), 2);
                    map.len()
                },
            )
            .expect("second modify");

        assert_eq!(count, 2);
        let back: BTreeMap<String, u32> = store
            .read("approvals/queue.json")
            .expect("read")
            .expect("present");
        assert_eq!(back.len(), 2);
    }

    #[test]
    fn read_of_absent_doc_is_none() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());
        let got: Option<Vec<u32>> = store.read("nothing/here.json").expect("read");
        assert!(got.is_none());
    }

    #[test]
    fn corrupt_doc_fails_without_salvage() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());
        let path = store.doc_path("broken.json").expect("path");
        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        std::fs::write(&path, b"}{").expect("write garbage");

        let result = store.modify("broken.json", Deadline::none(), |_: &mut Vec<u32>| ());
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn corrupt_doc_salvages_to_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());
        let path = store.doc_path("broken.json").expect("path");
        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        std::fs::write(&path, b"}{").expect("write garbage");

        let len = store
            .modify_salvage("broken.json", Deadline::none(), |v: &mut Vec<u32>| {
                v.push(9);
                v.len()
            })
            .expect("salvage modify");
        assert_eq!(len, 1);

        // The garbage was preserved aside for inspection.
        let aside_present = std::fs::read_dir(path.parent().unwrap())
            .expect("read dir")
            .filter_map(Result::ok)
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(aside_present);
    }

    #[test]
    fn doc_names_cannot_escape_the_base() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());
        assert!(matches!(
            store.doc_path("../outside.json"),
            Err(StoreError::InvalidDocPath { .. })
        ));
        assert!(matches!(
            store.doc_path("/etc/passwd"),
            Err(StoreError::InvalidDocPath { .. })
        ));
        assert!(matches!(
            store.doc_path(""),
            Err(StoreError::InvalidDocPath { .. })
        ));
    }

    #[test]
    fn append_builds_a_list() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());

        store
            .append("items.json", Deadline::none(), "one".to_string())
            .expect("append one");
        store
            .append("items.json", Deadline::none(), "two".to_string())
            .expect("append two");

        let items: Vec<String> = store.read("items.json").expect("read").expect("present");
        assert_eq!(items, vec!["one", "two"]);
    }

    #[test]
    fn list_reports_only_json_documents() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());

        store
            .append("approvals/comments/s1.json", Deadline::none(), 1u32)
            .expect("append");
        store
            .append("approvals/comments/s2.json", Deadline::none(), 1u32)
            .expect("append");

        let names = store.list("approvals/comments").expect("list");
        assert_eq!(
            names,
            vec![
                "approvals/comments/s1.json".to_string(),
                "approvals/comments/s2.json".to_string()
            ]
        );
    }

    #[test]
    fn expired_deadline_rejects_modify() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());
        let result = store.modify(
            "doc.json",
            Deadline::after(std::time::Duration::ZERO),
            |_: &mut Vec<u32>| (),
        );
        assert!(matches!(result, Err(StoreError::Deadline)));
    }
}
