//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod account;
mod heartbeat;
mod lease;
mod proxy;

pub use account::{
    Account, AccountEligibility, AccountId, AccountOrdering, FarmStage, FrequencyByStage,
    StageFrequency,
};
pub use heartbeat::{MAX_STATUS_MESSAGE_LENGTH, WorkerHeartbeat, WorkerRole, truncate_status_message};
pub use lease::LeaseOutcome;
pub use proxy::{Proxy, ProxyId, ProxyIdentity, ProxyPoolFilter, ProxyProvider, ProxyType};
