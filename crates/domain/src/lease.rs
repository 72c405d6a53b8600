use serde::{Deserialize, Serialize};

/// Result reported by a worker when it gives a leased resource back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOutcome {
    /// The worker's task completed with the resource.
    Success,
    /// The worker's task failed; the resource must be immediately reusable.
    Failure,
}

impl LeaseOutcome {
    /// Maps a task success flag to an outcome.
    #[must_use]
    pub fn from_success(succeeded: bool) -> Self {
        if succeeded {
            Self::Success
        } else {
            Self::Failure
        }
    }

    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}
