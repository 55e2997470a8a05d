//! # filegate-core
//!
//! Approval core for the filegate engineering document workflow: a durable,
//! multi-role file-approval engine over a shared network filesystem.
//!
//! Users submit uploaded files for review; a team leader triages each
//! submission; an admin renders the final decision; approved artifacts are
//! relocated into the canonical project tree and every party's inbox is
//! kept current. All state lives in JSON documents on the share, written
//! with per-document advisory locks and atomic renames so concurrent
//! writers on different hosts cannot corrupt them.
//!
//! ## Layout
//!
//! - [`engine`]: the public operations (submit, approve, reject, withdraw,
//!   comment, list, inbox).
//! - [`submission`]: the submission record and its state machine.
//! - [`store`]: the locked, corruption-safe JSON document store.
//! - [`paths`]: shared-root resolution with local fallback and degraded
//!   mode.
//! - [`archive`], [`metadata`], [`notify`], [`comments`], [`placement`]:
//!   the derived side-effect stores.
//! - [`identity`]: the narrow `username → {role, teams}` boundary.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use filegate_core::config::EngineConfig;
//! use filegate_core::deadline::Deadline;
//! use filegate_core::engine::ApprovalEngine;
//! use filegate_core::identity::{MemoryIdentityProvider, Role};
//!
//! let identity = MemoryIdentityProvider::new()
//!     .with_user("alice", Role::User, &["AGCC"])
//!     .with_user("tl_bob", Role::TeamLeader, &["AGCC"])
//!     .with_user("admin", Role::Admin, &[]);
//! let engine = ApprovalEngine::new(EngineConfig::default(), Arc::new(identity));
//!
//! let outcome = engine
//!     .submit(
//!         "alice",
//!         std::path::Path::new("/srv/filegate/shared/uploads/alice/spec.pdf"),
//!         "structural spec",
//!         vec![],
//!         Deadline::none(),
//!     )
//!     .expect("submission accepted");
//! engine
//!     .tl_approve("tl_bob", &outcome.submission.id, Deadline::none())
//!     .expect("forwarded to admin");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod archive;
pub mod comments;
pub mod config;
pub mod deadline;
pub mod engine;
pub mod error;
pub mod identity;
pub mod listing;
pub mod metadata;
pub mod notify;
pub mod paths;
pub mod placement;
pub mod store;
pub mod submission;

pub use config::EngineConfig;
pub use deadline::Deadline;
pub use engine::{ApprovalEngine, Effect, OperationOutcome};
pub use error::EngineError;
pub use identity::{IdentityProvider, Role, UserIdentity};
pub use submission::{PlacementOutcome, Submission, SubmissionState};
