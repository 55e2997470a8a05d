//! Durable JSON document store.
//!
//! All shared state — the live queue, archives, inboxes, comment threads,
//! placement requests — lives in named JSON documents on the shared
//! filesystem. This module provides the corruption-safe access layer:
//!
//! - [`fsio`]: atomic write (temp + fsync + rename + parent fsync) and
//!   size-bounded JSON reads. A crash at any point leaves either the old
//!   complete document or the new complete document, never a torn write.
//! - [`lock`]: per-document exclusive advisory file locks, serializing
//!   cross-process writers on the share.
//! - [`document`]: the [`DocumentStore`] read/modify/append/list API.
//!
//! Readers are non-locking and may observe a slightly stale snapshot; any
//! caller that needs read-your-write consistency goes through `modify`.

mod document;
mod fsio;
mod lock;

use std::path::PathBuf;

use thiserror::Error;

pub use document::{DocumentStore, DEFAULT_MAX_DOC_BYTES};
pub use fsio::{atomic_write, atomic_write_json, read_json_bounded};
pub use lock::DocLockGuard;

/// Errors from document store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Filesystem I/O failed.
    #[error("store I/O error during {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A document failed to parse and salvage was not requested.
    #[error("corrupt document {doc}: {detail}")]
    Corrupt {
        /// Document name or path.
        doc: String,
        /// Parse error detail.
        detail: String,
    },

    /// A document exceeds the configured size cap.
    #[error("document {doc} too large: {size} bytes exceeds {max}")]
    TooLarge {
        /// Document name or path.
        doc: String,
        /// Observed size in bytes.
        size: u64,
        /// Configured cap in bytes.
        max: u64,
    },

    /// JSON serialization failed before any write happened.
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The store cannot be reached or a document lock cannot be acquired.
    #[error("store unavailable: {detail}")]
    Unavailable {
        /// Human-readable context.
        detail: String,
    },

    /// A document name escaped the store root.
    #[error("invalid document path: {}", doc.display())]
    InvalidDocPath {
        /// The offending name.
        doc: PathBuf,
    },

    /// The operation's deadline expired.
    #[error("store operation deadline exceeded")]
    Deadline,
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
