use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetlease_application::{
    IdentityRotator, ProxyLeaseManager, ProxyLeasePolicy, ProxyRepository, RetryPolicy,
    RotationTicket,
};
use fleetlease_core::{AppError, AppResult, WorkerId};
use fleetlease_domain::{Proxy, ProxyIdentity, ProxyPoolFilter, ProxyProvider, ProxyType};

use super::InMemoryProxyRepository;
use crate::SystemClock;

struct StaticIdentityRotator;

#[async_trait]
impl IdentityRotator for StaticIdentityRotator {
    async fn current_identity(&self, proxy: &Proxy) -> AppResult<ProxyIdentity> {
        Ok(ProxyIdentity {
            host: format!("{}.example.net", proxy.api_key),
            port: 8080,
            username: None,
            password: None,
        })
    }

    async fn rotate(&self, proxy: &Proxy) -> AppResult<RotationTicket> {
        Err(AppError::Internal(format!(
            "rotation not expected for '{}'",
            proxy.api_key
        )))
    }

    async fn check_health(&self, _identity: &ProxyIdentity) -> AppResult<bool> {
        Ok(true)
    }
}

fn policy() -> ProxyLeasePolicy {
    ProxyLeasePolicy {
        pool: ProxyPoolFilter {
            provider: ProxyProvider::ProxyNo1,
            proxy_type: ProxyType::Lte,
            max_uses: 3,
        },
        rotation_timeout: Duration::from_secs(5),
        rotation_poll_interval: Duration::from_millis(100),
        retry_policy: RetryPolicy::unbounded(Duration::ZERO).with_max_attempts(1),
        advisory_lock_seconds: 5,
        release_policy: RetryPolicy::unbounded(Duration::ZERO).with_max_attempts(1),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_leases_never_exceed_quota() {
    let repository = Arc::new(InMemoryProxyRepository::new());
    let mut seeded = Vec::new();
    for index in 0..2 {
        let proxy = Proxy::new(format!("key-{index}"), ProxyProvider::ProxyNo1, ProxyType::Lte);
        seeded.push(proxy.id);
        assert!(repository.save_proxy(proxy).await.is_ok());
    }

    let mut handles = Vec::new();
    for index in 0..10 {
        let manager = ProxyLeaseManager::new(
            repository.clone(),
            Arc::new(StaticIdentityRotator),
            Arc::new(SystemClock),
            WorkerId::new(format!("worker-{index}")).unwrap_or_else(|_| unreachable!()),
            policy(),
        )
        .unwrap_or_else(|_| unreachable!());
        handles.push(tokio::spawn(async move { manager.acquire().await }));
    }

    let mut granted = 0;
    for handle in handles {
        match handle.await {
            Ok(Ok(_)) => granted += 1,
            Ok(Err(error)) => assert!(matches!(error, AppError::AcquireTimeout(_))),
            Err(error) => panic!("lease task panicked: {error}"),
        }
    }

    assert_eq!(granted, 6);
    for proxy_id in seeded {
        let stored = repository
            .find_proxy(proxy_id)
            .await
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(stored.usage_count, 3);
        assert_eq!(stored.in_use_count, 3);
    }
}

#[tokio::test]
async fn rotation_claim_skips_proxies_still_in_use() {
    let repository = InMemoryProxyRepository::new();
    let mut busy = Proxy::new("busy", ProxyProvider::ProxyNo1, ProxyType::Lte);
    busy.usage_count = 3;
    busy.in_use_count = 1;
    let mut idle = Proxy::new("idle", ProxyProvider::ProxyNo1, ProxyType::Lte);
    idle.usage_count = 3;
    let idle_id = idle.id;
    assert!(repository.save_proxy(busy).await.is_ok());
    assert!(repository.save_proxy(idle).await.is_ok());

    let now = chrono::Utc::now();
    let previous = repository.claim_for_rotation(&policy().pool, now).await;

    assert!(matches!(
        &previous,
        Ok(Some(proxy)) if proxy.id == idle_id && proxy.usage_count == 3 && !proxy.is_rotating
    ));
    assert!(matches!(
        repository.claim_for_rotation(&policy().pool, now).await,
        Ok(None)
    ));
}
