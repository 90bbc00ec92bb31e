use std::time::Duration;

use thiserror::Error;

/// Errors reported synchronously by [`crate::scheduler::Scheduler`].
///
/// Unknown job names are not errors: `cancel` is a no-op and `query`
/// answers `NotScheduled`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The requested interval is below the smallest supported one.
    #[error("interval {requested:?} is below the minimum of {minimum:?}")]
    InvalidInterval {
        /// Interval passed to `enqueue`.
        requested: Duration,
        /// Smallest interval the scheduler accepts.
        minimum: Duration,
    },
}

/// Failure of a single delivery attempt.
///
/// Both kinds are retried identically within a cycle; the split only
/// changes how the attempt is logged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Network-level error or a non-success response.
    #[error("recoverable: {0}")]
    Recoverable(String),
    /// Anything the sender did not anticipate.
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl SendError {
    /// Human readable reason without the kind prefix.
    pub fn reason(&self) -> &str {
        match self {
            SendError::Recoverable(r) | SendError::Unexpected(r) => r,
        }
    }
}
