//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod http_proxy_identity_rotator;
mod in_memory_account_repository;
mod in_memory_proxy_repository;
mod in_memory_worker_heartbeat_repository;
mod postgres_account_repository;
mod postgres_proxy_repository;
mod postgres_worker_heartbeat_repository;
mod redis_advisory_lock_coordinator;
mod system_clock;

pub use http_proxy_identity_rotator::HttpProxyIdentityRotator;
pub use in_memory_account_repository::InMemoryAccountRepository;
pub use in_memory_proxy_repository::InMemoryProxyRepository;
pub use in_memory_worker_heartbeat_repository::InMemoryWorkerHeartbeatRepository;
pub use postgres_account_repository::PostgresAccountRepository;
pub use postgres_proxy_repository::PostgresProxyRepository;
pub use postgres_worker_heartbeat_repository::PostgresWorkerHeartbeatRepository;
pub use redis_advisory_lock_coordinator::RedisAdvisoryLockCoordinator;
pub use system_clock::SystemClock;
