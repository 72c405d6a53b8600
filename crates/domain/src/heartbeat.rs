use chrono::{DateTime, Utc};
use fleetlease_core::{AppError, AppResult, WorkerId};
use serde::{Deserialize, Serialize};

/// Longest status line stored with a heartbeat.
pub const MAX_STATUS_MESSAGE_LENGTH: usize = 255;

/// Kind of work a worker process performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerRole {
    /// Grows account reputation.
    KarmaFarmer,
    /// Crossposts content between communities.
    CrossPoster,
    /// Posts original content.
    ContentPoster,
    /// Registers new accounts.
    AccountCreator,
}

impl WorkerRole {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KarmaFarmer => "KARMA_FARMER",
            Self::CrossPoster => "CROSS_POSTER",
            Self::ContentPoster => "CONTENT_POSTER",
            Self::AccountCreator => "ACCOUNT_CREATOR",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "KARMA_FARMER" => Ok(Self::KarmaFarmer),
            "CROSS_POSTER" => Ok(Self::CrossPoster),
            "CONTENT_POSTER" => Ok(Self::ContentPoster),
            "ACCOUNT_CREATOR" => Ok(Self::AccountCreator),
            _ => Err(AppError::Validation(format!(
                "unknown worker role '{value}'"
            ))),
        }
    }
}

/// Last observed liveness of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHeartbeat {
    /// Worker identifier.
    pub worker_id: WorkerId,
    /// Worker role.
    pub role: WorkerRole,
    /// Host the worker runs on, when known.
    pub host: Option<String>,
    /// Latest status line reported by the worker.
    pub status_message: Option<String>,
    /// Last heartbeat timestamp.
    pub last_seen_at: DateTime<Utc>,
}

const ELLIPSIS: &str = "...";

/// Cuts a status line to at most [`MAX_STATUS_MESSAGE_LENGTH`] characters,
/// marking the cut with a trailing ellipsis.
#[must_use]
pub fn truncate_status_message(message: &str) -> String {
    if message.chars().count() <= MAX_STATUS_MESSAGE_LENGTH {
        return message.to_owned();
    }

    let kept = MAX_STATUS_MESSAGE_LENGTH - ELLIPSIS.len();
    let mut truncated: String = message.chars().take(kept).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}
