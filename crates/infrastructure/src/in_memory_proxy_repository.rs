use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetlease_application::ProxyRepository;
use fleetlease_core::{AppError, AppResult};
use fleetlease_domain::{Proxy, ProxyId, ProxyPoolFilter};
use tokio::sync::RwLock;

#[cfg(test)]
mod tests;

/// In-memory proxy repository for single-process runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryProxyRepository {
    proxies: RwLock<HashMap<ProxyId, Proxy>>,
}

impl InMemoryProxyRepository {
    /// Creates an empty in-memory repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn least_recently_used<'a>(
    proxies: impl Iterator<Item = &'a Proxy>,
    predicate: impl Fn(&Proxy) -> bool,
) -> Option<ProxyId> {
    proxies
        .filter(|proxy| predicate(proxy))
        .min_by_key(|proxy| (proxy.last_used_at, proxy.id))
        .map(|proxy| proxy.id)
}

fn missing(proxy_id: ProxyId) -> AppError {
    AppError::NotFound(format!("proxy '{proxy_id}' does not exist"))
}

#[async_trait]
impl ProxyRepository for InMemoryProxyRepository {
    async fn save_proxy(&self, proxy: Proxy) -> AppResult<()> {
        self.proxies.write().await.insert(proxy.id, proxy);
        Ok(())
    }

    async fn find_proxy(&self, proxy_id: ProxyId) -> AppResult<Option<Proxy>> {
        Ok(self.proxies.read().await.get(&proxy_id).cloned())
    }

    async fn count_pool(&self, pool: &ProxyPoolFilter) -> AppResult<i64> {
        let count = self
            .proxies
            .read()
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
        let mut proxies = self.proxies.write().await;
        let Some(proxy_id) = least_recently_used(proxies.values(), |proxy| pool.matches_lease(proxy))
        else {
            return Ok(None);
        };

        let proxy = proxies.get_mut(&proxy_id).ok_or_else(|| missing(proxy_id))?;
        proxy.usage_count += 1;
        proxy.in_use_count += 1;
        proxy.last_used_at = Some(now);

        Ok(Some(proxy.clone()))
    }

    async fn rollback_lease(&self, proxy_id: ProxyId) -> AppResult<()> {
        let mut proxies = self.proxies.write().await;
        let proxy = proxies.get_mut(&proxy_id).ok_or_else(|| missing(proxy_id))?;
        proxy.usage_count = (proxy.usage_count - 1).max(0);
        proxy.in_use_count = (proxy.in_use_count - 1).max(0);

        Ok(())
    }

    async fn claim_for_rotation(
        &self,
        pool: &ProxyPoolFilter,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Proxy>> {
        let mut proxies = self.proxies.write().await;
        let Some(proxy_id) =
            least_recently_used(proxies.values(), |proxy| pool.matches_rotation(proxy))
        else {
            return Ok(None);
        };

        let proxy = proxies.get_mut(&proxy_id).ok_or_else(|| missing(proxy_id))?;
        let previous = proxy.clone();
        proxy.is_rotating = true;
        proxy.usage_count = 0;
        proxy.in_use_count = 0;
        proxy.last_used_at = Some(now);

        Ok(Some(previous))
    }

    async fn complete_rotation(&self, proxy_id: ProxyId, now: DateTime<Utc>) -> AppResult<Proxy> {
        let mut proxies = self.proxies.write().await;
        let proxy = proxies
            .get_mut(&proxy_id)
            .filter(|proxy| proxy.is_rotating)
            .ok_or_else(|| AppError::Conflict(format!("proxy '{proxy_id}' is not rotating")))?;
        proxy.is_rotating = false;
        proxy.usage_count += 1;
        proxy.in_use_count += 1;
        proxy.last_used_at = Some(now);

        Ok(proxy.clone())
    }

    async fn abort_rotation(
        &self,
        proxy_id: ProxyId,
        restored_usage_count: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut proxies = self.proxies.write().await;
        let proxy = proxies
            .get_mut(&proxy_id)
            .filter(|proxy| proxy.is_rotating)
            .ok_or_else(|| AppError::Conflict(format!("proxy '{proxy_id}' is not rotating")))?;
        proxy.is_rotating = false;
        proxy.usage_count = restored_usage_count;
        proxy.last_used_at = Some(now);

        Ok(())
    }

    async fn release_lease(&self, proxy_id: ProxyId, now: DateTime<Utc>) -> AppResult<()> {
        let mut proxies = self.proxies.write().await;
        let proxy = proxies.get_mut(&proxy_id).ok_or_else(|| missing(proxy_id))?;
        proxy.in_use_count = (proxy.in_use_count - 1).max(0);
        proxy.last_used_at = Some(now);

        Ok(())
    }
}
