//! Application services and ports.

#![forbid(unsafe_code)]

mod account_lease_manager;
mod lease_ports;
mod liveness_registry;
mod proxy_lease_manager;
mod resource_lease_manager;
mod retry_policy;

#[cfg(test)]
mod test_support;

pub use account_lease_manager::{
    AccountCooldownPolicy, AccountLease, AccountLeaseManager, AccountLeasePolicy,
};
pub use lease_ports::{
    AccountRepository, AdvisoryLock, AdvisoryLockCoordinator, Clock, IdentityRotator,
    LeasableResource, LeaseStore, ProxyRepository, RotationTicket, WorkerHeartbeatRepository,
};
pub use liveness_registry::LivenessRegistry;
pub use proxy_lease_manager::{ProxyLease, ProxyLeaseManager, ProxyLeasePolicy};
pub use resource_lease_manager::{CooldownPolicy, Lease, ResourceLeaseManager};
pub use retry_policy::{RetryBudget, RetryPolicy};
