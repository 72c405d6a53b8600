use std::fmt::{Debug, Display};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetlease_core::{AppResult, WorkerId};
use fleetlease_domain::{
    Account, AccountEligibility, AccountId, AccountOrdering, LeaseOutcome, Proxy, ProxyId,
    ProxyPoolFilter, WorkerHeartbeat, WorkerRole,
};

/// Record kind that can be checked out through a [`LeaseStore`].
pub trait LeasableResource: Clone + Debug + Send + Sync + 'static {
    /// Stable identifier type.
    type Id: Copy + Debug + Display + Eq + Send + Sync + 'static;
    /// Declarative eligibility rules for this kind.
    type Eligibility: Debug + Send + Sync;
    /// Candidate ordering for this kind.
    type Ordering: Copy + Debug + Send + Sync;

    /// Returns the record identifier.
    fn resource_id(&self) -> Self::Id;
}

impl LeasableResource for Account {
    type Id = AccountId;
    type Eligibility = AccountEligibility;
    type Ordering = AccountOrdering;

    fn resource_id(&self) -> Self::Id {
        self.id
    }
}

/// Shared store operations behind the generic lease manager.
///
/// Each method must be one atomic conditional update in the backing store.
#[async_trait]
pub trait LeaseStore<R: LeasableResource>: Send + Sync {
    /// Claims the first record by `ordering` that matches `eligibility` and is
    /// enabled, idle and due; marks it in use and stamps `last_used_at`.
    async fn claim_next(
        &self,
        eligibility: &R::Eligibility,
        ordering: R::Ordering,
        now: DateTime<Utc>,
    ) -> AppResult<Option<R>>;

    /// Clears the in-use mark of a claimed record and stores its next
    /// eligibility time.
    async fn release_claim(
        &self,
        resource_id: R::Id,
        outcome: LeaseOutcome,
        next_eligible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<()>;
}

/// Account persistence port.
#[async_trait]
pub trait AccountRepository: LeaseStore<Account> {
    /// Inserts or replaces one account.
    async fn save_account(&self, account: Account) -> AppResult<()>;

    /// Finds one account by id.
    async fn find_account(&self, account_id: AccountId) -> AppResult<Option<Account>>;

    /// Lists the oldest accounts by `created_at` that satisfy the base
    /// eligibility rules, ignoring in-use and cooldown state.
    async fn list_fairness_window(
        &self,
        eligibility: &AccountEligibility,
        limit: usize,
    ) -> AppResult<Vec<Account>>;
}

/// Proxy persistence port.
#[async_trait]
pub trait ProxyRepository: Send + Sync {
    /// Inserts or replaces one proxy.
    async fn save_proxy(&self, proxy: Proxy) -> AppResult<()>;

    /// Finds one proxy by id.
    async fn find_proxy(&self, proxy_id: ProxyId) -> AppResult<Option<Proxy>>;

    /// Counts enabled proxies in one pool.
    async fn count_pool(&self, pool: &ProxyPoolFilter) -> AppResult<i64>;

    /// Claims a proxy under quota: increments `usage_count` and
    /// `in_use_count`, stamps `last_used_at`, returns the updated record.
    async fn claim_for_lease(
        &self,
        pool: &ProxyPoolFilter,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Proxy>>;

    /// Undoes one lease claim by decrementing both counters.
    async fn rollback_lease(&self, proxy_id: ProxyId) -> AppResult<()>;

    /// Claims an exhausted idle proxy for rotation: sets `is_rotating` and
    /// resets both counters, returning the record as it was before the update.
    async fn claim_for_rotation(
        &self,
        pool: &ProxyPoolFilter,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Proxy>>;

    /// Finishes a successful rotation: clears `is_rotating` and counts the
    /// caller's lease as the first use.
    async fn complete_rotation(&self, proxy_id: ProxyId, now: DateTime<Utc>) -> AppResult<Proxy>;

    /// Undoes a failed rotation: clears `is_rotating` and restores the prior
    /// usage count.
    async fn abort_rotation(
        &self,
        proxy_id: ProxyId,
        restored_usage_count: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()>;

    /// Returns one lease: decrements `in_use_count` and stamps `last_used_at`.
    async fn release_lease(&self, proxy_id: ProxyId, now: DateTime<Utc>) -> AppResult<()>;
}

/// Worker liveness persistence port.
#[async_trait]
pub trait WorkerHeartbeatRepository: Send + Sync {
    /// Upserts one heartbeat keyed by worker id and role. A `None` status
    /// message keeps the stored one.
    async fn upsert_heartbeat(&self, heartbeat: WorkerHeartbeat) -> AppResult<()>;

    /// Counts workers of one role seen at or after `seen_since`.
    async fn count_active(&self, role: WorkerRole, seen_since: DateTime<Utc>) -> AppResult<i64>;

    /// Lists heartbeats for one worker across roles.
    async fn list_for_worker(&self, worker_id: &WorkerId) -> AppResult<Vec<WorkerHeartbeat>>;
}
