use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetlease_core::{AppError, AppResult};
use fleetlease_domain::{
    Account, AccountEligibility, AccountId, AccountOrdering, FrequencyByStage, LeaseOutcome,
    WorkerRole,
};
use tracing::{debug, info};

use crate::lease_ports::{AccountRepository, Clock, LeaseStore};
use crate::liveness_registry::LivenessRegistry;
use crate::resource_lease_manager::{CooldownPolicy, Lease, ResourceLeaseManager};
use crate::retry_policy::RetryPolicy;

#[cfg(test)]
mod tests;

/// Account checkout rules.
#[derive(Debug, Clone)]
pub struct AccountLeasePolicy {
    /// Minimum account age in days.
    pub minimum_age_days: u32,
    /// Minimum reputation score.
    pub minimum_score: i64,
    /// Successful leases per day for each leasable stage.
    pub frequency_by_stage: FrequencyByStage,
    /// Accounts in the fairness window per active worker.
    pub per_worker_quota: u32,
    /// Role whose live workers size the fairness window.
    pub fairness_role: WorkerRole,
    /// Heartbeat age under which a worker counts as active.
    pub liveness_window: chrono::Duration,
    /// Polling used by [`AccountLeaseManager::acquire_blocking`].
    pub poll_policy: RetryPolicy,
    /// Repeats of a release the store could not record.
    pub release_policy: RetryPolicy,
}

impl AccountLeasePolicy {
    /// Validates numeric bounds.
    pub fn validate(&self) -> AppResult<()> {
        AccountEligibility::new(
            Utc::now(),
            self.minimum_age_days,
            self.minimum_score,
            Vec::new(),
        )?;

        if self.per_worker_quota == 0 {
            return Err(AppError::Validation(
                "per_worker_quota must be greater than zero".to_owned(),
            ));
        }

        if self.liveness_window <= chrono::Duration::zero() {
            return Err(AppError::Validation(
                "liveness_window must be positive".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Stage-based cooldown applied on account release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCooldownPolicy(pub FrequencyByStage);

impl CooldownPolicy<Account> for AccountCooldownPolicy {
    fn next_eligible_at(
        &self,
        resource: &Account,
        outcome: LeaseOutcome,
        now: DateTime<Utc>,
    ) -> AppResult<DateTime<Utc>> {
        self.0.next_eligible_at(resource.stage, outcome, now)
    }
}

/// Lease on one account.
pub type AccountLease = Lease<Account, AccountCooldownPolicy>;

/// Checks accounts out to this worker with stage cooldowns and a fairness
/// window scaled by the number of live workers.
pub struct AccountLeaseManager {
    leases: ResourceLeaseManager<Account, AccountCooldownPolicy>,
    repository: Arc<dyn AccountRepository>,
    liveness: LivenessRegistry,
    clock: Arc<dyn Clock>,
    policy: AccountLeasePolicy,
}

impl AccountLeaseManager {
    /// Creates a manager after validating the policy.
    pub fn new(
        repository: Arc<dyn AccountRepository>,
        liveness: LivenessRegistry,
        clock: Arc<dyn Clock>,
        policy: AccountLeasePolicy,
    ) -> AppResult<Self> {
        policy.validate()?;
        let store: Arc<dyn LeaseStore<Account>> = repository.clone();
        let leases = ResourceLeaseManager::new(
            store,
            clock.clone(),
            AccountCooldownPolicy(policy.frequency_by_stage.clone()),
        );

        Ok(Self {
            leases,
            repository,
            liveness,
            clock,
            policy,
        })
    }

    /// Returns the active policy.
    #[must_use]
    pub fn policy(&self) -> &AccountLeasePolicy {
        &self.policy
    }

    /// Builds the eligibility rules restricted to the current fairness window.
    pub async fn candidate_window(&self) -> AppResult<AccountEligibility> {
        let now = self.clock.now();
        let active_workers = self
            .liveness
            .active_count(self.policy.fairness_role, self.policy.liveness_window)
            .await?
            .max(1);
        let limit = usize::try_from(active_workers)
            .unwrap_or(usize::MAX)
            .saturating_mul(usize::try_from(self.policy.per_worker_quota).unwrap_or(usize::MAX));

        let base = AccountEligibility::new(
            now,
            self.policy.minimum_age_days,
            self.policy.minimum_score,
            self.policy.frequency_by_stage.stages(),
        )?;
        let window = self.repository.list_fairness_window(&base, limit).await?;
        debug!(
            active_workers,
            limit,
            window = window.len(),
            "account fairness window built"
        );

        Ok(base.within(window.into_iter().map(|account| account.id).collect()))
    }

    /// Claims one due account from the fairness window, or returns `None`.
    pub async fn acquire(&self) -> AppResult<Option<AccountLease>> {
        let eligibility = self.candidate_window().await?;
        if eligibility
            .candidate_ids
            .as_ref()
            .is_some_and(|ids| ids.is_empty())
        {
            return Ok(None);
        }

        let lease = self
            .leases
            .acquire(&eligibility, AccountOrdering::LongestOverdueFirst)
            .await?;
        if let Some(lease) = &lease {
            info!(
                account_id = %lease.resource.id,
                username = %lease.resource.username,
                "account leased"
            );
        }

        Ok(lease)
    }

    /// Polls [`Self::acquire`] until an account is leased or the poll policy
    /// runs out.
    pub async fn acquire_blocking(&self) -> AppResult<AccountLease> {
        let mut budget = self.policy.poll_policy.start();
        loop {
            if let Some(lease) = self.acquire().await? {
                return Ok(lease);
            }

            info!(
                attempts = budget.attempts(),
                "no eligible account, waiting before next poll"
            );
            budget.wait("account lease").await?;
        }
    }

    /// Releases the held account and returns its next eligibility time.
    ///
    /// A store outage is retried under the release policy. If it persists the
    /// lease stays held and `StoreUnavailable` is returned.
    pub async fn release(
        &self,
        account_id: AccountId,
        outcome: LeaseOutcome,
    ) -> AppResult<DateTime<Utc>> {
        let next_eligible_at = self
            .policy
            .release_policy
            .retry_unavailable("account release", || self.leases.release(account_id, outcome))
            .await?;
        info!(
            account_id = %account_id,
            outcome = outcome.as_str(),
            next_eligible_at = %next_eligible_at,
            "account released"
        );

        Ok(next_eligible_at)
    }

    /// Returns the held lease, if any.
    pub async fn current_lease(&self) -> Option<AccountLease> {
        self.leases.current_lease().await
    }
}
