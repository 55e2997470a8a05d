//! Atomic filesystem primitives for the document store.
//!
//! The write protocol is temp file in the target directory, write, flush,
//! fsync, atomic rename over the destination, fsync the parent directory.
//! Readers check the file size against a cap on the open handle before
//! allocating, so an oversized or garbage document cannot exhaust memory.

use std::fs::{self, File};
use std::io::Read;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::StoreError;

/// Writes `data` to `path` atomically.
///
/// The parent directory is created if missing. A reader never observes a
/// partial file: the rename installs the new content in one step, and the
/// parent-directory fsync makes the rename itself durable.
///
/// # Errors
///
/// Returns [`StoreError::Io`] if any filesystem step fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().ok_or_else(|| {
        StoreError::io(
            format!("resolving parent of {}", path.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"),
        )
    })?;

    fs::create_dir_all(parent)
        .map_err(|e| StoreError::io(format!("creating {}", parent.display()), e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| StoreError::io(format!("creating temp file in {}", parent.display()), e))?;

    tmp.write_all(data)
        .map_err(|e| StoreError::io("writing temp file", e))?;
    tmp.flush()
        .map_err(|e| StoreError::io("flushing temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io("fsyncing temp file", e))?;

    tmp.persist(path)
        .map_err(|e| StoreError::io(format!("renaming to {}", path.display()), e.error))?;

    fsync_dir(parent);
    Ok(())
}

/// Serializes `value` as pretty-printed JSON and writes it atomically.
///
/// Serialization happens in memory first, so a serialization failure never
/// leaves a partial file behind.
///
/// # Errors
///
/// Returns [`StoreError::Serialize`] or any error from [`atomic_write`].
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value).map_err(StoreError::Serialize)?;
    atomic_write(path, json.as_bytes())
}

/// Reads and deserializes a JSON document, bounded by `max_bytes`.
///
/// Returns `Ok(None)` when the file does not exist — an absent document is
/// an empty document from the caller's viewpoint.
///
/// # Errors
///
/// - [`StoreError::TooLarge`] when the file exceeds the cap.
/// - [`StoreError::Corrupt`] when the content is not valid JSON for `T`.
/// - [`StoreError::Io`] on any other filesystem failure.
pub fn read_json_bounded<T: DeserializeOwned>(
    path: &Path,
    max_bytes: u64,
) -> Result<Option<T>, StoreError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(format!("opening {}", path.display()), e)),
    };

    // Size check on the open handle, not the path, so a swap between stat
    // and read cannot bypass the cap.
    let size = file
        .metadata()
        .map_err(|e| StoreError::io(format!("stat {}", path.display()), e))?
        .len();
    if size > max_bytes {
        return Err(StoreError::TooLarge {
            doc: path.display().to_string(),
            size,
            max: max_bytes,
        });
    }

    let mut buf = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
    file.read_to_end(&mut buf)
        .map_err(|e| StoreError::io(format!("reading {}", path.display()), e))?;

    match serde_json::from_slice(&buf) {
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(StoreError::Corrupt {
            doc: path.display().to_string(),
            detail: e.to_string(),
        }),
    }
}

/// Fsyncs a directory so a just-completed rename is durable.
///
/// Best-effort: not every filesystem supports opening directories for sync,
/// and a failure here cannot un-publish the rename.
fn fsync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}
