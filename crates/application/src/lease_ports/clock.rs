use chrono::{DateTime, Utc};

/// Wall-clock source used for lease timestamps.
pub trait Clock: Send + Sync {
    /// Returns the current UTC time.
    fn now(&self) -> DateTime<Utc>;
}
