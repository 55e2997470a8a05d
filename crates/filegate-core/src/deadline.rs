//! Operation deadlines.
//!
//! Every public engine operation accepts a [`Deadline`]. The deadline is
//! checked before each filesystem access, and lock acquisition loops poll it
//! between attempts, so a caller-supplied budget bounds the total wall-clock
//! time of an operation even when the shared filesystem stalls.

use std::time::{Duration, Instant};

/// A wall-clock budget for a single operation.
///
/// A deadline is either bounded (expires at a fixed instant) or unbounded.
/// Unbounded deadlines are appropriate for background work such as the
/// placement retry sweep, where the caller controls pacing instead.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    /// A deadline that expires `budget` from now.
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Some(Instant::now() + budget),
        }
    }

    /// A deadline that never expires.
    #[must_use]
    pub const fn none() -> Self {
        Self { expires_at: None }
    }

    /// Returns true if the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Remaining budget, or `None` for an unbounded deadline.
    ///
    /// An expired deadline reports `Some(Duration::ZERO)`.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}
