//! Shared primitives for all Rust crates in Fleetlease.

#![forbid(unsafe_code)]

/// Worker process identity shared across services.
pub mod worker;

use thiserror::Error;

pub use worker::WorkerId;

/// Result type used across Fleetlease crates.
pub type AppResult<T> = Result<T, AppError>;

/// Common application error categories.
///
/// An empty acquire result is not an error: managers return `Ok(None)` when no
/// resource is eligible and callers poll again later.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid input or violated invariant.
    #[error("validation error: {0}")]
    Validation(String),

    /// Requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write operation conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A release was attempted for a resource this process never acquired.
    #[error("release without acquire: {0}")]
    ReleaseWithoutAcquire(String),

    /// A claimed resource's live handle could not be built.
    #[error("resource construction failed: {0}")]
    ConstructionFailed(String),

    /// The external identity rotation call failed.
    #[error("identity rotation failed: {0}")]
    RotationFailed(String),

    /// The rotated identity did not become healthy in time.
    #[error("identity rotation timed out: {0}")]
    RotationTimeout(String),

    /// An acquire loop exceeded its configured deadline or attempt budget.
    #[error("acquire timed out: {0}")]
    AcquireTimeout(String),

    /// The shared store could not be reached or rejected the operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Internal unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns whether a worker may retry the failed lease operation.
    ///
    /// `ReleaseWithoutAcquire` is a programming error and `StoreUnavailable`
    /// must reach the worker's own backoff, so neither is retryable here.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConstructionFailed(_)
                | Self::RotationFailed(_)
                | Self::RotationTimeout(_)
                | Self::AcquireTimeout(_)
                | Self::Conflict(_)
        )
    }
}
