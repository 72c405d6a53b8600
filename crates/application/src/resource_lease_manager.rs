use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetlease_core::{AppError, AppResult};
use fleetlease_domain::LeaseOutcome;
use tokio::sync::Mutex;

use crate::lease_ports::{Clock, LeasableResource, LeaseStore};

/// Computes when a released record may be leased again.
pub trait CooldownPolicy<R: LeasableResource>: Clone + Debug + Send + Sync {
    /// Returns the next eligibility time for a record released with `outcome`.
    fn next_eligible_at(
        &self,
        resource: &R,
        outcome: LeaseOutcome,
        now: DateTime<Utc>,
    ) -> AppResult<DateTime<Utc>>;
}

/// In-process record of one checked-out resource.
#[derive(Debug, Clone)]
pub struct Lease<R, P> {
    /// Resource as returned by the claim.
    pub resource: R,
    /// When the claim happened.
    pub acquired_at: DateTime<Utc>,
    /// Cooldown policy in effect at claim time.
    pub policy: P,
}

impl<R: LeasableResource, P> Lease<R, P> {
    /// Returns the leased resource id.
    #[must_use]
    pub fn resource_id(&self) -> R::Id {
        self.resource.resource_id()
    }
}

/// Generic checkout/release over a [`LeaseStore`].
///
/// One manager holds at most one lease at a time; cross-process exclusivity
/// comes from the store's conditional claim.
pub struct ResourceLeaseManager<R: LeasableResource, P> {
    store: Arc<dyn LeaseStore<R>>,
    clock: Arc<dyn Clock>,
    policy: P,
    current: Mutex<Option<Lease<R, P>>>,
}

impl<R, P> ResourceLeaseManager<R, P>
where
    R: LeasableResource,
    P: CooldownPolicy<R>,
{
    /// Creates a lease manager over one store.
    #[must_use]
    pub fn new(store: Arc<dyn LeaseStore<R>>, clock: Arc<dyn Clock>, policy: P) -> Self {
        Self {
            store,
            clock,
            policy,
            current: Mutex::new(None),
        }
    }

    /// Claims the first eligible record, or returns `None` when nothing is due.
    pub async fn acquire(
        &self,
        eligibility: &R::Eligibility,
        ordering: R::Ordering,
    ) -> AppResult<Option<Lease<R, P>>> {
        let mut current = self.current.lock().await;
        if let Some(held) = current.as_ref() {
            return Err(AppError::Conflict(format!(
                "resource '{}' is still leased by this manager; release it first",
                held.resource_id()
            )));
        }

        let now = self.clock.now();
        let Some(resource) = self.store.claim_next(eligibility, ordering, now).await? else {
            return Ok(None);
        };

        let lease = Lease {
            resource,
            acquired_at: now,
            policy: self.policy.clone(),
        };
        *current = Some(lease.clone());

        Ok(Some(lease))
    }

    /// Releases the held lease and returns the stored next eligibility time.
    ///
    /// The lease stays held when the store update fails so the caller can retry.
    pub async fn release(
        &self,
        resource_id: R::Id,
        outcome: LeaseOutcome,
    ) -> AppResult<DateTime<Utc>> {
        let mut current = self.current.lock().await;
        let Some(lease) = current
            .as_ref()
            .filter(|lease| lease.resource_id() == resource_id)
        else {
            return Err(AppError::ReleaseWithoutAcquire(format!(
                "resource '{resource_id}' is not leased by this manager"
            )));
        };

        let now = self.clock.now();
        let next_eligible_at = lease
            .policy
            .next_eligible_at(&lease.resource, outcome, now)?;
        self.store
            .release_claim(resource_id, outcome, next_eligible_at, now)
            .await?;
        *current = None;

        Ok(next_eligible_at)
    }

    /// Returns a copy of the held lease.
    pub async fn current_lease(&self) -> Option<Lease<R, P>> {
        self.current.lock().await.clone()
    }
}
