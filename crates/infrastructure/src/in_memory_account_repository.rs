use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetlease_application::{AccountRepository, LeaseStore};
use fleetlease_core::{AppError, AppResult};
use fleetlease_domain::{Account, AccountEligibility, AccountId, AccountOrdering, LeaseOutcome};
use tokio::sync::RwLock;

#[cfg(test)]
mod tests;

/// In-memory account repository for single-process runs and tests.
///
/// Every claim runs under the write lock, which gives the same
/// find-and-update atomicity as the Postgres adapter.
#[derive(Debug, Default)]
pub struct InMemoryAccountRepository {
    accounts: RwLock<HashMap<AccountId, Account>>,
}

impl InMemoryAccountRepository {
    /// Creates an empty in-memory repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore<Account> for InMemoryAccountRepository {
    async fn claim_next(
        &self,
        eligibility: &AccountEligibility,
        ordering: AccountOrdering,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Account>> {
        let mut accounts = self.accounts.write().await;
        let Some(account_id) = accounts
            .values()
            .filter(|account| eligibility.matches(account, now))
            .min_by(|left, right| ordering.compare(left, right))
            .map(|account| account.id)
        else {
            return Ok(None);
        };

        let Some(account) = accounts.get_mut(&account_id) else {
            return Ok(None);
        };
        account.in_use = true;
        account.last_used_at = Some(now);

        Ok(Some(account.clone()))
    }

    async fn release_claim(
        &self,
        resource_id: AccountId,
        outcome: LeaseOutcome,
        next_eligible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut accounts = self.accounts.write().await;
        let Some(account) = accounts.get_mut(&resource_id).filter(|account| account.in_use)
        else {
            return Err(AppError::Conflict(format!(
                "account '{resource_id}' is not marked in use"
            )));
        };

        account.in_use = false;
        account.last_used_at = Some(now);
        account.next_eligible_at = Some(next_eligible_at);
        if outcome == LeaseOutcome::Success {
            account.usage_count += 1;
        }

        Ok(())
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    async fn save_account(&self, account: Account) -> AppResult<()> {
        self.accounts.write().await.insert(account.id, account);
        Ok(())
    }

    async fn find_account(&self, account_id: AccountId) -> AppResult<Option<Account>> {
        Ok(self.accounts.read().await.get(&account_id).cloned())
    }

    async fn list_fairness_window(
        &self,
        eligibility: &AccountEligibility,
        limit: usize,
    ) -> AppResult<Vec<Account>> {
        let accounts = self.accounts.read().await;
        let mut window: Vec<Account> = accounts
            .values()
            .filter(|account| eligibility.matches_base(account))
            .cloned()
            .collect();
        window.sort_by(|left, right| AccountOrdering::OldestCreatedFirst.compare(left, right));
        window.truncate(limit);

        Ok(window)
    }
}
