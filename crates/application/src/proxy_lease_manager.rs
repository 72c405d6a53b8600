use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetlease_core::{AppError, AppResult, WorkerId};
use fleetlease_domain::{LeaseOutcome, Proxy, ProxyIdentity, ProxyPoolFilter};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::lease_ports::{
    AdvisoryLock, AdvisoryLockCoordinator, Clock, IdentityRotator, ProxyRepository,
};
use crate::retry_policy::RetryPolicy;

mod rotation;


/// Proxy checkout and rotation rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLeasePolicy {
    /// Pool selector and usage quota.
    pub pool: ProxyPoolFilter,
    /// Upper bound for one rotation including health polling.
    pub rotation_timeout: Duration,
    /// Pause between health checks of a rotated identity.
    pub rotation_poll_interval: Duration,
    /// Pause and bounds of the selection retry loop.
    pub retry_policy: RetryPolicy,
    /// TTL of the optional advisory selection lock.
    pub advisory_lock_seconds: u32,
    /// Repeats of a release the store could not record.
    pub release_policy: RetryPolicy,
}

impl ProxyLeasePolicy {
    /// Validates numeric bounds.
    pub fn validate(&self) -> AppResult<()> {
        if self.pool.max_uses <= 0 {
            return Err(AppError::Validation(
                "max_uses must be greater than zero".to_owned(),
            ));
        }

        if self.rotation_timeout.is_zero() || self.rotation_poll_interval.is_zero() {
            return Err(AppError::Validation(
                "rotation_timeout and rotation_poll_interval must be positive".to_owned(),
            ));
        }

        if self.advisory_lock_seconds == 0 {
            return Err(AppError::Validation(
                "advisory_lock_seconds must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }

    /// Returns the advisory lock scope shared by workers drawing from this pool.
    #[must_use]
    pub fn selection_scope(&self) -> String {
        format!(
            "proxy-selection:{}:{}",
            self.pool.provider.as_str(),
            self.pool.proxy_type.as_str()
        )
    }
}

/// Lease on one proxy with its live connection details.
#[derive(Debug, Clone)]
pub struct ProxyLease {
    /// Proxy as stored after the claim.
    pub proxy: Proxy,
    /// Connection details for the task.
    pub identity: ProxyIdentity,
    /// When the lease was granted.
    pub acquired_at: DateTime<Utc>,
    /// Policy in effect at lease time.
    pub policy: ProxyLeasePolicy,
    /// Whether the proxy was rotated to serve this lease.
    pub rotated: bool,
}

#[derive(Debug, Clone, Copy)]
enum ClaimKind {
    Lease,
    Rotation,
}

enum SelectionGate {
    Open,
    Held(AdvisoryLock),
    Busy,
}

/// Everything one selection round needs, detached from the manager so the
/// round can run as its own task.
#[derive(Clone)]
struct Selector {
    repository: Arc<dyn ProxyRepository>,
    rotator: Arc<dyn IdentityRotator>,
    clock: Arc<dyn Clock>,
    advisory_lock: Option<Arc<dyn AdvisoryLockCoordinator>>,
    holder_id: WorkerId,
    policy: ProxyLeasePolicy,
}

/// A lease granted by a selection round that has not reached the manager yet.
///
/// Dropping it unclaimed returns the proxy to the pool.
struct PendingLease {
    lease: Option<ProxyLease>,
    repository: Arc<dyn ProxyRepository>,
    clock: Arc<dyn Clock>,
}

impl PendingLease {
    fn into_lease(mut self) -> Option<ProxyLease> {
        self.lease.take()
    }
}

impl Drop for PendingLease {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        let proxy_id = lease.proxy.id;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                proxy_id = %proxy_id,
                "abandoned proxy lease left in use, no runtime to return it"
            );
            return;
        };

        warn!(proxy_id = %proxy_id, "proxy lease abandoned by its caller, returning it");
        let repository = self.repository.clone();
        let now = self.clock.now();
        runtime.spawn(async move {
            if let Err(error) = repository.release_lease(proxy_id, now).await {
                warn!(
                    proxy_id = %proxy_id,
                    error = %error,
                    "failed to return abandoned proxy lease"
                );
            }
        });
    }
}

/// Leases proxies under a usage quota and rotates exhausted ones.
///
/// Each selection round runs on its own task. Dropping an `acquire` future
/// never leaves a proxy half claimed or stuck rotating.
pub struct ProxyLeaseManager {
    selector: Selector,
    current: Mutex<Option<ProxyLease>>,
}

impl ProxyLeaseManager {
    /// Creates a manager after validating the policy.
    pub fn new(
        repository: Arc<dyn ProxyRepository>,
        rotator: Arc<dyn IdentityRotator>,
        clock: Arc<dyn Clock>,
        holder_id: WorkerId,
        policy: ProxyLeasePolicy,
    ) -> AppResult<Self> {
        policy.validate()?;

        Ok(Self {
            selector: Selector {
                repository,
                rotator,
                clock,
                advisory_lock: None,
                holder_id,
                policy,
            },
            current: Mutex::new(None),
        })
    }

    /// Gates each claim behind an advisory lock scoped to the pool.
    #[must_use]
    pub fn with_advisory_lock(mut self, coordinator: Arc<dyn AdvisoryLockCoordinator>) -> Self {
        self.selector.advisory_lock = Some(coordinator);
        self
    }

    /// Returns the active policy.
    #[must_use]
    pub fn policy(&self) -> &ProxyLeasePolicy {
        &self.selector.policy
    }

    /// Leases a proxy, rotating an exhausted one when none has quota left.
    ///
    /// Retries selection until a lease is granted or the retry policy runs
    /// out; the last retryable failure is returned in that case. A rotation
    /// never outlives the remaining retry deadline.
    pub async fn acquire(&self) -> AppResult<ProxyLease> {
        let mut current = self.current.lock().await;
        if let Some(held) = current.as_ref() {
            return Err(AppError::Conflict(format!(
                "proxy '{}' is still leased by this manager; release it first",
                held.proxy.id
            )));
        }

        let policy = &self.selector.policy;
        let pool_size = self.selector.repository.count_pool(&policy.pool).await?;
        if pool_size == 0 {
            return Err(AppError::NotFound(format!(
                "proxy pool {}/{} is empty",
                policy.pool.provider.as_str(),
                policy.pool.proxy_type.as_str()
            )));
        }

        let mut budget = policy.retry_policy.start();
        let mut last_error = None;
        loop {
            match self.select_round(budget.remaining()).await {
                Ok(Some(lease)) => {
                    *current = Some(lease.clone());
                    return Ok(lease);
                }
                Ok(None) => {
                    info!(
                        attempts = budget.attempts(),
                        "no proxy available, waiting before next selection"
                    );
                }
                Err(error) if error.is_retryable() => {
                    warn!(error = %error, "proxy selection failed, retrying");
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }

            if let Err(timeout) = budget.wait("proxy lease").await {
                return Err(last_error.unwrap_or(timeout));
            }
        }
    }

    /// Returns the held proxy to the pool. The outcome does not affect proxy
    /// accounting.
    ///
    /// A store outage is retried under the release policy. If it persists the
    /// lease stays held and `StoreUnavailable` is returned.
    pub async fn release(&self, outcome: LeaseOutcome) -> AppResult<()> {
        let mut current = self.current.lock().await;
        let Some(lease) = current.as_ref() else {
            return Err(AppError::ReleaseWithoutAcquire(
                "no proxy is leased by this manager".to_owned(),
            ));
        };

        let proxy_id = lease.proxy.id;
        let Selector {
            repository,
            clock,
            policy,
            ..
        } = &self.selector;
        policy
            .release_policy
            .retry_unavailable("proxy release", || {
                repository.release_lease(proxy_id, clock.now())
            })
            .await?;
        info!(proxy_id = %proxy_id, outcome = outcome.as_str(), "proxy released");
        *current = None;

        Ok(())
    }

    /// Returns the held lease, if any.
    pub async fn current_lease(&self) -> Option<ProxyLease> {
        self.current.lock().await.clone()
    }

    /// Runs one selection round to completion on its own task.
    async fn select_round(&self, remaining: Option<Duration>) -> AppResult<Option<ProxyLease>> {
        let selector = self.selector.clone();
        let round = tokio::spawn(async move { selector.select_once(remaining).await });

        match round.await {
            Ok(result) => Ok(result?.and_then(PendingLease::into_lease)),
            Err(error) => Err(AppError::Internal(format!(
                "proxy selection round did not finish: {error}"
            ))),
        }
    }
}

impl Selector {
    /// Runs one selection round: lease under quota, else rotate.
    async fn select_once(&self, remaining: Option<Duration>) -> AppResult<Option<PendingLease>> {
        let mut construction_error = None;
        if let Some(proxy) = self.claim(ClaimKind::Lease).await? {
            match self.open_lease(proxy).await {
                Ok(lease) => return Ok(Some(self.pending(lease))),
                Err(error @ AppError::ConstructionFailed(_)) => construction_error = Some(error),
                Err(error) => return Err(error),
            }
        }

        if let Some(previous) = self.claim(ClaimKind::Rotation).await? {
            let limit = remaining.map_or(self.policy.rotation_timeout, |remaining| {
                remaining.min(self.policy.rotation_timeout)
            });
            let lease = self.rotate(previous, limit).await?;
            return Ok(Some(self.pending(lease)));
        }

        match construction_error {
            Some(error) => Err(error),
            None => Ok(None),
        }
    }

    fn pending(&self, lease: ProxyLease) -> PendingLease {
        PendingLease {
            lease: Some(lease),
            repository: self.repository.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Builds the identity for a freshly claimed proxy, undoing the claim on
    /// failure.
    async fn open_lease(&self, proxy: Proxy) -> AppResult<ProxyLease> {
        info!(
            proxy_id = %proxy.id,
            usage_count = proxy.usage_count,
            "proxy claimed"
        );

        match self.rotator.current_identity(&proxy).await {
            Ok(identity) => Ok(self.lease(proxy, identity, false)),
            Err(error) => {
                warn!(proxy_id = %proxy.id, error = %error, "rolling back proxy claim");
                if let Err(rollback_error) = self.repository.rollback_lease(proxy.id).await {
                    return Err(AppError::StoreUnavailable(format!(
                        "building identity for proxy '{}' failed: {error}; additionally failed to roll back the claim: {rollback_error}",
                        proxy.id
                    )));
                }

                Err(AppError::ConstructionFailed(format!(
                    "failed to build identity for proxy '{}': {error}",
                    proxy.id
                )))
            }
        }
    }

    fn lease(&self, proxy: Proxy, identity: ProxyIdentity, rotated: bool) -> ProxyLease {
        ProxyLease {
            proxy,
            identity,
            acquired_at: self.clock.now(),
            policy: self.policy.clone(),
            rotated,
        }
    }

    async fn claim(&self, kind: ClaimKind) -> AppResult<Option<Proxy>> {
        let lock = match self.open_selection_gate().await {
            SelectionGate::Busy => return Ok(None),
            SelectionGate::Held(lock) => Some(lock),
            SelectionGate::Open => None,
        };

        let now = self.clock.now();
        let claimed = match kind {
            ClaimKind::Lease => self.repository.claim_for_lease(&self.policy.pool, now).await,
            ClaimKind::Rotation => {
                self.repository
                    .claim_for_rotation(&self.policy.pool, now)
                    .await
            }
        };

        if let Some(lock) = lock {
            self.close_selection_gate(&lock).await;
        }

        claimed
    }

    async fn open_selection_gate(&self) -> SelectionGate {
        let Some(coordinator) = &self.advisory_lock else {
            return SelectionGate::Open;
        };

        match coordinator
            .try_acquire_lock(
                self.policy.selection_scope().as_str(),
                self.holder_id.as_str(),
                self.policy.advisory_lock_seconds,
            )
            .await
        {
            Ok(Some(lock)) => SelectionGate::Held(lock),
            Ok(None) => SelectionGate::Busy,
            Err(error) => {
                warn!(error = %error, "advisory lock unavailable, selecting without it");
                SelectionGate::Open
            }
        }
    }

    async fn close_selection_gate(&self, lock: &AdvisoryLock) {
        let Some(coordinator) = &self.advisory_lock else {
            return;
        };

        if let Err(error) = coordinator.release_lock(lock).await {
            warn!(
                scope_key = %lock.scope_key,
                error = %error,
                "failed to release advisory lock"
            );
        }
    }
}
