//! Per-document exclusive advisory locks.
//!
//! Every `modify` on a document holds an exclusive flock on a `.lock`
//! sibling for the full read-mutate-write sequence, serializing writers
//! across processes and hosts sharing the filesystem. The lock file is a
//! separate sibling rather than the document itself because the document is
//! replaced by rename on every write, which would break the lock's inode
//! association mid-sequence.
//!
//! Acquisition is a non-blocking poll with a short sleep, so the caller's
//! deadline is honored while another writer holds the lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use super::StoreError;
use crate::deadline::Deadline;

/// Poll interval while waiting on a contended lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Upper bound on lock acquisition when the caller's deadline is unbounded.
///
/// A writer that holds a document lock longer than this is stuck; waiting
/// further would only wedge the caller with it.
const LOCK_ACQUIRE_CAP: Duration = Duration::from_secs(30);

/// RAII guard for an exclusive document lock.
///
/// Dropping the guard releases the lock.
#[derive(Debug)]
pub struct DocLockGuard {
    file: File,
    path: PathBuf,
}

impl DocLockGuard {
    /// Acquires the exclusive lock for the document at `doc_path`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Deadline`] when the caller's deadline expires while
    ///   the lock is contended.
    /// - [`StoreError::Unavailable`] when the lock file cannot be created
    ///   or the contention outlasts the acquisition cap.
    pub fn acquire(doc_path: &Path, deadline: Deadline) -> Result<Self, StoreError> {
        let lock_path = lock_path_for(doc_path);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::io(format!("creating {}", parent.display()), e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::Unavailable {
                detail: format!("cannot open lock file {}: {e}", lock_path.display()),
            })?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: lock_path,
                    });
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {},
                Err(e) => {
                    return Err(StoreError::Unavailable {
                        detail: format!("cannot lock {}: {e}", lock_path.display()),
                    });
                },
            }

            if deadline.is_expired() {
                return Err(StoreError::Deadline);
            }
            if started.elapsed() >= LOCK_ACQUIRE_CAP {
                return Err(StoreError::Unavailable {
                    detail: format!(
                        "lock on {} contended for over {}s",
                        lock_path.display(),
                        LOCK_ACQUIRE_CAP.as_secs()
                    ),
                });
            }

            let nap = deadline
                .remaining()
                .map_or(LOCK_POLL_INTERVAL, |r| r.min(LOCK_POLL_INTERVAL));
            std::thread::sleep(nap);
        }
    }

    /// Path of the lock file held by this guard.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DocLockGuard {
    fn drop(&mut self) {
        // Closing the file would release the flock anyway; the explicit
        // unlock just makes the release immediate.
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path_for(doc_path: &Path) -> PathBuf {
    let mut name = doc_path
        .file_name()
        .map_or_else(|| std::ffi::OsString::from("doc"), std::ffi::OsStr::to_os_string);
    name.push(".lock");
    doc_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_is_a_sibling() {
        let p = lock_path_for(Path::new("/store/approvals/queue.json"));
        assert_eq!(p, Path::new("/store/approvals/queue.json.lock"));
    }

    #[test]
    fn acquire_and_release() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let doc = tmp.path().join("queue.json");

        {
            let _guard = DocLockGuard::acquire(&doc, Deadline::none()).expect("first acquire");
        }
        // Released on drop, so a second acquisition succeeds immediately.
        let _guard = DocLockGuard::acquire(&doc, Deadline::none()).expect("second acquire");
    }

    #[test]
    fn contended_lock_respects_deadline() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let doc = tmp.path().join("queue.json");

        let _holder = DocLockGuard::acquire(&doc, Deadline::none()).expect("holder");
        let result =
            DocLockGuard::acquire(&doc, Deadline::after(Duration::from_millis(80)));
        assert!(matches!(result, Err(StoreError::Deadline)));
    }

    #[test]
    fn missing_parent_is_created() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let doc = tmp.path().join("deep/nested/doc.json");
        let guard = DocLockGuard::acquire(&doc, Deadline::none()).expect("acquire");
        assert!(guard.path().exists());
    }
}
