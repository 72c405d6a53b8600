use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetlease_core::{AppError, WorkerId};
use fleetlease_domain::{
    Account, AccountId, FarmStage, FrequencyByStage, LeaseOutcome, StageFrequency, WorkerRole,
};

use crate::lease_ports::AccountRepository;
use crate::liveness_registry::LivenessRegistry;
use crate::retry_policy::RetryPolicy;
use crate::test_support::{FakeAccountRepository, FakeClock, FakeHeartbeatRepository, at_hour};

use super::{AccountLeaseManager, AccountLeasePolicy};

fn policy(per_worker_quota: u32) -> AccountLeasePolicy {
    AccountLeasePolicy {
        minimum_age_days: 30,
        minimum_score: 10,
        frequency_by_stage: FrequencyByStage::new(vec![StageFrequency {
            stage: FarmStage::Day1,
            frequency: 4,
        }])
        .unwrap_or_else(|_| unreachable!()),
        per_worker_quota,
        fairness_role: WorkerRole::KarmaFarmer,
        liveness_window: chrono::Duration::minutes(30),
        poll_policy: RetryPolicy::unbounded(Duration::ZERO).with_max_attempts(3),
        release_policy: RetryPolicy::unbounded(Duration::ZERO).with_max_attempts(3),
    }
}

fn created(days_before: i64) -> DateTime<Utc> {
    at_hour(0) - chrono::Duration::days(days_before)
}

struct Harness {
    accounts: Arc<FakeAccountRepository>,
    heartbeats: Arc<FakeHeartbeatRepository>,
    clock: Arc<FakeClock>,
}

impl Harness {
    fn new() -> Self {
        Self::with_heartbeats(FakeHeartbeatRepository::default())
    }

    fn with_heartbeats(heartbeats: FakeHeartbeatRepository) -> Self {
        Self {
            accounts: Arc::new(FakeAccountRepository::default()),
            heartbeats: Arc::new(heartbeats),
            clock: Arc::new(FakeClock::new(at_hour(12))),
        }
    }

    fn registry(&self) -> LivenessRegistry {
        LivenessRegistry::new(self.heartbeats.clone(), self.clock.clone())
    }

    fn manager(&self, per_worker_quota: u32) -> AccountLeaseManager {
        AccountLeaseManager::new(
            self.accounts.clone(),
            self.registry(),
            self.clock.clone(),
            policy(per_worker_quota),
        )
        .unwrap_or_else(|_| unreachable!())
    }

    async fn seed(&self, account: Account) -> AccountId {
        let account_id = account.id;
        assert!(self.accounts.save_account(account).await.is_ok());
        account_id
    }

    async fn seed_eligible(&self, days_before: i64) -> AccountId {
        self.seed(Account::new(
            format!("user-{days_before}"),
            format!("profile-{days_before}"),
            Some(FarmStage::Day1),
            50,
            created(days_before),
        ))
        .await
    }

    async fn register_workers(&self, count: usize) {
        let registry = self.registry();
        for index in 0..count {
            let worker_id =
                WorkerId::new(format!("farmer-{index}")).unwrap_or_else(|_| unreachable!());
            assert!(
                registry
                    .heartbeat(&worker_id, WorkerRole::KarmaFarmer)
                    .await
                    .is_ok()
            );
        }
    }
}

#[tokio::test]
async fn fairness_window_limits_claims_to_oldest_accounts() {
    let harness = Harness::new();
    let mut oldest = HashSet::new();
    for days_before in 0..100 {
        let account_id = harness.seed_eligible(400 - days_before).await;
        if days_before < 6 {
            oldest.insert(account_id);
        }
    }
    harness.register_workers(3).await;

    let mut leased = HashSet::new();
    let mut managers = Vec::new();
    for _ in 0..6 {
        let manager = harness.manager(2);
        let lease = manager
            .acquire()
            .await
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert!(leased.insert(lease.resource.id));
        managers.push(manager);
    }

    assert_eq!(leased, oldest);
    let seventh = harness.manager(2).acquire().await;
    assert!(matches!(seventh, Ok(None)));
}

#[tokio::test]
async fn window_defaults_to_one_worker_without_heartbeats() {
    let harness = Harness::new();
    let first = harness.seed_eligible(300).await;
    let _second = harness.seed_eligible(200).await;

    let manager = harness.manager(1);
    let window = manager
        .candidate_window()
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(window.candidate_ids, Some(vec![first]));
}

#[tokio::test]
async fn base_filter_skips_young_low_score_disabled_and_unstaged_accounts() {
    let harness = Harness::new();
    harness
        .seed(Account::new("young", "p1", Some(FarmStage::Day1), 50, created(5)))
        .await;
    harness
        .seed(Account::new("low", "p2", Some(FarmStage::Day1), 1, created(90)))
        .await;
    harness
        .seed(Account::new("trust", "p3", Some(FarmStage::Trust), 50, created(90)))
        .await;
    harness
        .seed(Account::new("unstaged", "p4", None, 50, created(90)))
        .await;
    let mut disabled = Account::new("disabled", "p5", Some(FarmStage::Day1), 50, created(90));
    disabled.enabled = false;
    harness.seed(disabled).await;

    let result = harness.manager(10).acquire().await;

    assert!(matches!(result, Ok(None)));
}

#[tokio::test]
async fn successful_release_applies_stage_cooldown() {
    let harness = Harness::new();
    let account_id = harness.seed_eligible(90).await;
    let manager = harness.manager(1);

    let lease = manager.acquire().await.unwrap_or_else(|_| unreachable!());
    assert!(lease.is_some());
    let next_eligible_at = manager
        .release(account_id, LeaseOutcome::Success)
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(next_eligible_at, at_hour(18));
    let stored = harness.accounts.get(account_id).await;
    assert_eq!(stored.next_eligible_at, Some(at_hour(18)));
    assert_eq!(stored.usage_count, 1);
    assert!(!stored.in_use);

    harness.clock.set(at_hour(17));
    assert!(matches!(manager.acquire().await, Ok(None)));
    harness.clock.set(at_hour(18));
    assert!(matches!(manager.acquire().await, Ok(Some(_))));
}

#[tokio::test]
async fn failed_release_leaves_account_immediately_eligible() {
    let harness = Harness::new();
    let account_id = harness.seed_eligible(90).await;
    let manager = harness.manager(1);

    assert!(matches!(manager.acquire().await, Ok(Some(_))));
    let next_eligible_at = manager
        .release(account_id, LeaseOutcome::Failure)
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(next_eligible_at, at_hour(12));
    assert_eq!(harness.accounts.get(account_id).await.usage_count, 0);
    assert!(matches!(manager.acquire().await, Ok(Some(_))));
}

#[tokio::test]
async fn release_twice_is_rejected() {
    let harness = Harness::new();
    let account_id = harness.seed_eligible(90).await;
    let manager = harness.manager(1);

    assert!(matches!(manager.acquire().await, Ok(Some(_))));
    assert!(
        manager
            .release(account_id, LeaseOutcome::Success)
            .await
            .is_ok()
    );
    let second = manager.release(account_id, LeaseOutcome::Success).await;

    assert!(matches!(second, Err(AppError::ReleaseWithoutAcquire(_))));
    assert_eq!(harness.accounts.get(account_id).await.usage_count, 1);
}

#[tokio::test]
async fn release_without_acquire_or_for_another_account_is_rejected() {
    let harness = Harness::new();
    let held = harness.seed_eligible(90).await;
    let other = harness.seed_eligible(80).await;
    let manager = harness.manager(1);

    let unheld = manager.release(held, LeaseOutcome::Success).await;
    assert!(matches!(unheld, Err(AppError::ReleaseWithoutAcquire(_))));

    assert!(matches!(manager.acquire().await, Ok(Some(_))));
    let mismatched = manager.release(other, LeaseOutcome::Success).await;
    assert!(matches!(mismatched, Err(AppError::ReleaseWithoutAcquire(_))));
    assert!(manager.current_lease().await.is_some());
}

#[tokio::test]
async fn release_is_repeated_through_a_brief_store_outage() {
    let harness = Harness::new();
    let account_id = harness.seed_eligible(90).await;
    let manager = harness.manager(1);

    assert!(matches!(manager.acquire().await, Ok(Some(_))));
    harness.accounts.faults.fail_next("release_claim", 2);
    let released = manager.release(account_id, LeaseOutcome::Failure).await;

    assert!(released.is_ok());
    assert!(manager.current_lease().await.is_none());
    assert!(!harness.accounts.get(account_id).await.in_use);
    let next = manager.acquire_blocking().await;
    assert!(matches!(next, Ok(lease) if lease.resource.id == account_id));
}

#[tokio::test]
async fn persistent_release_outage_keeps_the_lease_and_surfaces() {
    let harness = Harness::new();
    let account_id = harness.seed_eligible(90).await;
    let manager = harness.manager(1);

    assert!(matches!(manager.acquire().await, Ok(Some(_))));
    harness.accounts.faults.fail_next("release_claim", 10);
    let released = manager.release(account_id, LeaseOutcome::Success).await;

    assert!(matches!(released, Err(AppError::StoreUnavailable(_))));
    assert!(manager.current_lease().await.is_some());
    assert!(harness.accounts.get(account_id).await.in_use);
}

#[tokio::test]
async fn acquire_while_holding_a_lease_is_a_conflict() {
    let harness = Harness::new();
    harness.seed_eligible(90).await;
    harness.seed_eligible(80).await;
    let manager = harness.manager(5);

    assert!(matches!(manager.acquire().await, Ok(Some(_))));
    let second = manager.acquire().await;

    assert!(matches!(second, Err(AppError::Conflict(_))));
}

#[tokio::test]
async fn blocking_acquire_gives_up_when_poll_budget_is_spent() {
    let harness = Harness::new();
    let manager = harness.manager(1);

    let result = manager.acquire_blocking().await;

    assert!(matches!(result, Err(AppError::AcquireTimeout(_))));
}

#[tokio::test]
async fn liveness_store_failure_propagates() {
    let harness = Harness::with_heartbeats(FakeHeartbeatRepository {
        fail_reads: true,
        ..FakeHeartbeatRepository::default()
    });
    harness.seed_eligible(90).await;

    let result = harness.manager(1).acquire().await;

    assert!(matches!(result, Err(AppError::StoreUnavailable(_))));
}

#[test]
fn zero_quota_policy_is_rejected() {
    let result = policy(0).validate();

    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[test]
fn unrepresentable_minimum_age_is_rejected() {
    let mut invalid = policy(1);
    invalid.minimum_age_days = u32::MAX;

    assert!(matches!(invalid.validate(), Err(AppError::Validation(_))));
}
