use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetlease_application::{
    AccountLeaseManager, AccountLeasePolicy, AccountRepository, LivenessRegistry, RetryPolicy,
};
use fleetlease_domain::{Account, FarmStage, FrequencyByStage, StageFrequency, WorkerRole};

use super::InMemoryAccountRepository;
use crate::{InMemoryWorkerHeartbeatRepository, SystemClock};

fn policy() -> AccountLeasePolicy {
    AccountLeasePolicy {
        minimum_age_days: 30,
        minimum_score: 0,
        frequency_by_stage: FrequencyByStage::new(vec![StageFrequency {
            stage: FarmStage::Day1,
            frequency: 2,
        }])
        .unwrap_or_else(|_| unreachable!()),
        per_worker_quota: 10,
        fairness_role: WorkerRole::KarmaFarmer,
        liveness_window: chrono::Duration::minutes(30),
        poll_policy: RetryPolicy::unbounded(Duration::ZERO).with_max_attempts(1),
        release_policy: RetryPolicy::unbounded(Duration::ZERO).with_max_attempts(1),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_managers_never_share_an_account() {
    let repository = Arc::new(InMemoryAccountRepository::new());
    for index in 0..3 {
        let account = Account::new(
            format!("user-{index}"),
            format!("profile-{index}"),
            Some(FarmStage::Day1),
            10,
            Utc::now() - chrono::Duration::days(90 + index),
        );
        assert!(repository.save_account(account).await.is_ok());
    }
    let registry = LivenessRegistry::new(
        Arc::new(InMemoryWorkerHeartbeatRepository::new()),
        Arc::new(SystemClock),
    );

    let mut handles = Vec::new();
    for _ in 0..10 {
        let manager = AccountLeaseManager::new(
            repository.clone(),
            registry.clone(),
            Arc::new(SystemClock),
            policy(),
        )
        .unwrap_or_else(|_| unreachable!());
        handles.push(tokio::spawn(async move { manager.acquire().await }));
    }

    let mut leased = Vec::new();
    for handle in handles {
        if let Ok(Ok(Some(lease))) = handle.await {
            leased.push(lease.resource.id);
        }
    }

    let distinct: HashSet<_> = leased.iter().copied().collect();
    assert_eq!(leased.len(), 3);
    assert_eq!(distinct.len(), 3);
}

#[tokio::test]
async fn fairness_window_lists_oldest_base_eligible_accounts() {
    let repository = InMemoryAccountRepository::new();
    let now = Utc::now();
    let mut expected = Vec::new();
    for index in 0..5 {
        let account = Account::new(
            format!("user-{index}"),
            format!("profile-{index}"),
            Some(FarmStage::Day1),
            10,
            now - chrono::Duration::days(200 - index),
        );
        if index < 2 {
            expected.push(account.id);
        }
        assert!(repository.save_account(account).await.is_ok());
    }

    let eligibility =
        fleetlease_domain::AccountEligibility::new(now, 30, 0, vec![FarmStage::Day1])
            .unwrap_or_else(|_| unreachable!());
    let window = repository
        .list_fairness_window(&eligibility, 2)
        .await
        .unwrap_or_else(|_| unreachable!());

    let ids: Vec<_> = window.iter().map(|account| account.id).collect();
    assert_eq!(ids, expected);
}
