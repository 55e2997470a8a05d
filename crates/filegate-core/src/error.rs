//! Boundary error type for the approval engine.
//!
//! Every public operation returns [`EngineError`] on failure. Each variant
//! carries exactly one semantic meaning and maps to exactly one wire code
//! via [`EngineError::code`], so panels can dispatch on the code without
//! parsing messages.
//!
//! Retry policy (enforced by the engine's caller-facing wrapper, not here):
//! authorization and state errors are final; `STORE_UNAVAILABLE` is retried
//! with backoff inside the operation's deadline; placement failures never
//! surface through this type at all — they are recorded on the submission
//! and picked up by the background retrier.

use thiserror::Error;

use crate::identity::IdentityError;
use crate::store::StoreError;

/// Error returned from public engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Identity lookup failed for a named actor.
    #[error("unknown user: {username}")]
    UnknownUser {
        /// The username that failed to resolve.
        username: String,
    },

    /// The submission or notification id does not exist in the live store.
    #[error("not found: {id}")]
    NotFound {
        /// The id that was not found.
        id: String,
    },

    /// The current state does not permit the requested transition.
    #[error("illegal transition: cannot {action} a submission in state {state}")]
    IllegalTransition {
        /// The transition that was attempted.
        action: &'static str,
        /// The state observed under the submission lock.
        state: String,
    },

    /// Role or team authorization rejected an otherwise-legal request.
    #[error("forbidden: {detail}")]
    Forbidden {
        /// Human-readable denial reason.
        detail: String,
    },

    /// Input validation failed.
    #[error("bad input: {detail}")]
    BadInput {
        /// What was wrong with the input.
        detail: String,
    },

    /// A backing document could not be reached or locked.
    #[error("store unavailable: {detail}")]
    StoreUnavailable {
        /// Human-readable context.
        detail: String,
    },

    /// A backing document failed to parse and salvage was not requested.
    #[error("corrupt document {doc}: {detail}")]
    Corrupt {
        /// The document that failed to parse.
        doc: String,
        /// Parse error detail.
        detail: String,
    },

    /// The operation exceeded its deadline.
    #[error("operation deadline exceeded")]
    Deadline,
}

impl EngineError {
    /// Stable wire code for this error, per the boundary contract.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownUser { .. } => "UNKNOWN_USER",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::BadInput { .. } => "BAD_INPUT",
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            Self::Corrupt { .. } => "CORRUPT",
            Self::Deadline => "DEADLINE",
        }
    }

    /// Returns true if the engine's retry wrapper may re-attempt the
    /// operation. Only transport-like failures qualify.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt { doc, detail } => Self::Corrupt { doc, detail },
            StoreError::Deadline => Self::Deadline,
            other => Self::StoreUnavailable {
                detail: other.to_string(),
            },
        }
    }
}

impl From<IdentityError> for EngineError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::UnknownUser { username } => Self::UnknownUser { username },
            IdentityError::Corrupt { detail } => Self::Corrupt {
                doc: "users.json".to_string(),
                detail,
            },
            IdentityError::Unavailable { detail } => Self::StoreUnavailable { detail },
        }
    }
}
