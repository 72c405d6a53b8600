mod advisory;
mod clock;
mod repository;
mod rotator;

pub use advisory::{AdvisoryLock, AdvisoryLockCoordinator};
pub use clock::Clock;
pub use repository::{
    AccountRepository, LeasableResource, LeaseStore, ProxyRepository, WorkerHeartbeatRepository,
};
pub use rotator::{IdentityRotator, RotationTicket};
