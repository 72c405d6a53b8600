use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fleetlease_core::{AppError, AppResult, WorkerId};
use fleetlease_domain::{
    Account, AccountEligibility, AccountId, AccountOrdering, LeaseOutcome, Proxy, ProxyId,
    ProxyIdentity, ProxyPoolFilter, WorkerHeartbeat, WorkerRole,
};
use tokio::sync::Mutex;

use crate::lease_ports::{
    AccountRepository, Clock, IdentityRotator, LeaseStore, ProxyRepository, RotationTicket,
    WorkerHeartbeatRepository,
};

pub(crate) fn at_hour(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0)
        .single()
        .unwrap_or_else(|| unreachable!())
}

/// Scripted store outages: each named write fails the given number of times
/// with `StoreUnavailable` before succeeding again.
#[derive(Default)]
pub(crate) struct StoreFaults {
    pending: StdMutex<HashMap<&'static str, u32>>,
}

impl StoreFaults {
    pub(crate) fn fail_next(&self, operation: &'static str, times: u32) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(operation, times);
        }
    }

    fn check(&self, operation: &'static str) -> AppResult<()> {
        let Ok(mut pending) = self.pending.lock() else {
            return Ok(());
        };
        match pending.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(AppError::StoreUnavailable(format!("{operation}: store offline")))
            }
            _ => Ok(()),
        }
    }
}

pub(crate) struct FakeClock {
    now: StdMutex<DateTime<Utc>>,
}

impl FakeClock {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(now),
        }
    }

    pub(crate) fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut current) = self.now.lock() {
            *current = now;
        }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map(|now| *now)
            .unwrap_or_else(|_| unreachable!())
    }
}

#[derive(Default)]
pub(crate) struct FakeAccountRepository {
    pub(crate) accounts: Mutex<HashMap<AccountId, Account>>,
    pub(crate) faults: StoreFaults,
}

impl FakeAccountRepository {
    pub(crate) async fn get(&self, account_id: AccountId) -> Account {
        self.accounts
            .lock()
            .await
            .get(&account_id)
            .cloned()
            .unwrap_or_else(|| unreachable!())
    }
}

#[async_trait]
impl LeaseStore<Account> for FakeAccountRepository {
    async fn claim_next(
        &self,
        eligibility: &AccountEligibility,
        ordering: AccountOrdering,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Account>> {
        let mut accounts = self.accounts.lock().await;
        let chosen = accounts
            .values()
            .filter(|account| eligibility.matches(account, now))
            .min_by(|left, right| ordering.compare(left, right))
            .map(|account| account.id);

        Ok(chosen.and_then(|account_id| {
            accounts.get_mut(&account_id).map(|account| {
                account.in_use = true;
                account.last_used_at = Some(now);
                account.clone()
            })
        }))
    }

    async fn release_claim(
        &self,
        resource_id: AccountId,
        outcome: LeaseOutcome,
        next_eligible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        self.faults.check("release_claim")?;
        let mut accounts = self.accounts.lock().await;
        let account = accounts
            .get_mut(&resource_id)
            .filter(|account| account.in_use)
            .ok_or_else(|| AppError::Conflict(format!("account '{resource_id}' not in use")))?;
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
impl AccountRepository for FakeAccountRepository {
    async fn save_account(&self, account: Account) -> AppResult<()> {
        self.accounts.lock().await.insert(account.id, account);
        Ok(())
    }

    async fn find_account(&self, account_id: AccountId) -> AppResult<Option<Account>> {
        Ok(self.accounts.lock().await.get(&account_id).cloned())
    }

    async fn list_fairness_window(
        &self,
        eligibility: &AccountEligibility,
        limit: usize,
    ) -> AppResult<Vec<Account>> {
        let mut window: Vec<Account> = self
            .accounts
            .lock()
            .await
            .values()
            .filter(|account| eligibility.matches_base(account))
            .cloned()
            .collect();
        window.sort_by(|left, right| AccountOrdering::OldestCreatedFirst.compare(left, right));
        window.truncate(limit);
        Ok(window)
    }
}

#[derive(Default)]
pub(crate) struct FakeProxyRepository {
    pub(crate) proxies: Mutex<HashMap<ProxyId, Proxy>>,
    pub(crate) faults: StoreFaults,
}

impl FakeProxyRepository {
    pub(crate) async fn get(&self, proxy_id: ProxyId) -> Proxy {
        self.proxies
            .lock()
            .await
            .get(&proxy_id)
            .cloned()
            .unwrap_or_else(|| unreachable!())
    }

    async fn update<F>(&self, proxy_id: ProxyId, apply: F) -> AppResult<Proxy>
    where
        F: FnOnce(&mut Proxy) + Send,
    {
        let mut proxies = self.proxies.lock().await;
        let proxy = proxies
            .get_mut(&proxy_id)
            .ok_or_else(|| AppError::NotFound(format!("proxy '{proxy_id}'")))?;
        apply(proxy);
        Ok(proxy.clone())
    }
}

#[async_trait]
impl ProxyRepository for FakeProxyRepository {
    async fn save_proxy(&self, proxy: Proxy) -> AppResult<()> {
        self.proxies.lock().await.insert(proxy.id, proxy);
        Ok(())
    }

    async fn find_proxy(&self, proxy_id: ProxyId) -> AppResult<Option<Proxy>> {
        Ok(self.proxies.lock().await.get(&proxy_id).cloned())
    }

    async fn count_pool(&self, pool: &ProxyPoolFilter) -> AppResult<i64> {
        let count = self
            .proxies
            .lock()
            .await
            .values()
            .filter(|proxy| pool.matches_pool(proxy))
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn claim_for_lease(
        &self,
        pool: &ProxyPoolFilter,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Proxy>> {
        let mut proxies = self.proxies.lock().await;
        Ok(proxies
            .values_mut()
            .filter(|proxy| pool.matches_lease(proxy))
            .min_by_key(|proxy| (proxy.last_used_at, proxy.id))
            .map(|proxy| {
                proxy.usage_count += 1;
                proxy.in_use_count += 1;
                proxy.last_used_at = Some(now);
                proxy.clone()
            }))
    }

    async fn rollback_lease(&self, proxy_id: ProxyId) -> AppResult<()> {
        self.faults.check("rollback_lease")?;
        self.update(proxy_id, |proxy| {
            proxy.usage_count -= 1;
            proxy.in_use_count -= 1;
        })
        .await
        .map(|_| ())
    }

    async fn claim_for_rotation(
        &self,
        pool: &ProxyPoolFilter,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Proxy>> {
        let mut proxies = self.proxies.lock().await;
        Ok(proxies
            .values_mut()
            .filter(|proxy| pool.matches_rotation(proxy))
            .min_by_key(|proxy| (proxy.last_used_at, proxy.id))
            .map(|proxy| {
                let previous = proxy.clone();
                proxy.is_rotating = true;
                proxy.usage_count = 0;
                proxy.in_use_count = 0;
                proxy.last_used_at = Some(now);
                previous
            }))
    }

    async fn complete_rotation(&self, proxy_id: ProxyId, now: DateTime<Utc>) -> AppResult<Proxy> {
        self.faults.check("complete_rotation")?;
        self.update(proxy_id, |proxy| {
            proxy.is_rotating = false;
            proxy.usage_count += 1;
            proxy.in_use_count += 1;
            proxy.last_used_at = Some(now);
        })
        .await
    }

    async fn abort_rotation(
        &self,
        proxy_id: ProxyId,
        restored_usage_count: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        self.faults.check("abort_rotation")?;
        self.update(proxy_id, |proxy| {
            proxy.is_rotating = false;
            proxy.usage_count = restored_usage_count;
            proxy.last_used_at = Some(now);
        })
        .await
        .map(|_| ())
    }

    async fn release_lease(&self, proxy_id: ProxyId, now: DateTime<Utc>) -> AppResult<()> {
        self.faults.check("release_lease")?;
        self.update(proxy_id, |proxy| {
            proxy.in_use_count = (proxy.in_use_count - 1).max(0);
            proxy.last_used_at = Some(now);
        })
        .await
        .map(|_| ())
    }
}

#[derive(Default)]
pub(crate) struct FakeHeartbeatRepository {
    pub(crate) heartbeats: Mutex<HashMap<(WorkerId, WorkerRole), WorkerHeartbeat>>,
    pub(crate) fail_reads: bool,
}

#[async_trait]
impl WorkerHeartbeatRepository for FakeHeartbeatRepository {
    async fn upsert_heartbeat(&self, heartbeat: WorkerHeartbeat) -> AppResult<()> {
        let mut heartbeats = self.heartbeats.lock().await;
        let key = (heartbeat.worker_id.clone(), heartbeat.role);
        let status_message = heartbeat.status_message.clone().or_else(|| {
            heartbeats
                .get(&key)
                .and_then(|stored| stored.status_message.clone())
        });
        heartbeats.insert(
            key,
            WorkerHeartbeat {
                status_message,
                ..heartbeat
            },
        );
        Ok(())
    }

    async fn count_active(&self, role: WorkerRole, seen_since: DateTime<Utc>) -> AppResult<i64> {
        if self.fail_reads {
            return Err(AppError::StoreUnavailable("heartbeat store offline".to_owned()));
        }

        let count = self
            .heartbeats
            .lock()
            .await
            .values()
            .filter(|heartbeat| heartbeat.role == role && heartbeat.last_seen_at >= seen_since)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn list_for_worker(&self, worker_id: &WorkerId) -> AppResult<Vec<WorkerHeartbeat>> {
        Ok(self
            .heartbeats
            .lock()
            .await
            .values()
            .filter(|heartbeat| &heartbeat.worker_id == worker_id)
            .cloned()
            .collect())
    }
}

/// Scripted identity rotator; each queue is consumed front to back and the
/// last entry repeats once the queue runs dry.
pub(crate) struct FakeIdentityRotator {
    pub(crate) identity_results: StdMutex<VecDeque<bool>>,
    pub(crate) rotate_results: StdMutex<VecDeque<bool>>,
    pub(crate) health_results: StdMutex<VecDeque<bool>>,
    pub(crate) settle_delay: Duration,
    pub(crate) rotate_calls: StdMutex<u32>,
}

impl FakeIdentityRotator {
    pub(crate) fn healthy() -> Self {
        Self {
            identity_results: StdMutex::new(VecDeque::from([true])),
            rotate_results: StdMutex::new(VecDeque::from([true])),
            health_results: StdMutex::new(VecDeque::from([true])),
            settle_delay: Duration::ZERO,
            rotate_calls: StdMutex::new(0),
        }
    }

    pub(crate) fn with_identity_results(self, results: &[bool]) -> Self {
        Self {
            identity_results: StdMutex::new(results.iter().copied().collect()),
            ..self
        }
    }

    pub(crate) fn with_rotate_results(self, results: &[bool]) -> Self {
        Self {
            rotate_results: StdMutex::new(results.iter().copied().collect()),
            ..self
        }
    }

    pub(crate) fn with_health_results(self, results: &[bool]) -> Self {
        Self {
            health_results: StdMutex::new(results.iter().copied().collect()),
            ..self
        }
    }

    pub(crate) fn rotate_calls(&self) -> u32 {
        self.rotate_calls.lock().map(|calls| *calls).unwrap_or(0)
    }

    fn next(queue: &StdMutex<VecDeque<bool>>) -> bool {
        let Ok(mut queue) = queue.lock() else {
            return false;
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap_or(false)
        } else {
            queue.front().copied().unwrap_or(false)
        }
    }
}

#[async_trait]
impl IdentityRotator for FakeIdentityRotator {
    async fn current_identity(&self, proxy: &Proxy) -> AppResult<ProxyIdentity> {
        if !Self::next(&self.identity_results) {
            return Err(AppError::Internal(format!(
                "key status unavailable for '{}'",
                proxy.api_key
            )));
        }

        Ok(ProxyIdentity {
            host: format!("{}.proxy.test", proxy.api_key),
            port: 8000,
            username: Some("user".to_owned()),
            password: Some("pass".to_owned()),
        })
    }

    async fn rotate(&self, proxy: &Proxy) -> AppResult<RotationTicket> {
        if let Ok(mut calls) = self.rotate_calls.lock() {
            *calls += 1;
        }
        if !Self::next(&self.rotate_results) {
            return Err(AppError::Internal("provider refused IP change".to_owned()));
        }

        Ok(RotationTicket {
            proxy_id: proxy.id,
            requested_at: at_hour(0),
            settle_delay: self.settle_delay,
        })
    }

    async fn check_health(&self, _identity: &ProxyIdentity) -> AppResult<bool> {
        Ok(Self::next(&self.health_results))
    }
}
