use async_trait::async_trait;
use fleetlease_core::AppResult;

/// Advisory lock held around one selection round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvisoryLock {
    /// Lock scope, for example one proxy pool.
    pub scope_key: String,
    /// Ownership token used for compare-and-delete release.
    pub token: String,
    /// Worker holding the lock.
    pub holder_id: String,
}

/// Optional distributed mutex that reduces claim contention.
///
/// Correctness never depends on this port; every claim is still a conditional
/// store update.
#[async_trait]
pub trait AdvisoryLockCoordinator: Send + Sync {
    /// Attempts to take the lock for one scope.
    async fn try_acquire_lock(
        &self,
        scope_key: &str,
        holder_id: &str,
        lock_seconds: u32,
    ) -> AppResult<Option<AdvisoryLock>>;

    /// Releases the lock using token compare-and-delete semantics.
    async fn release_lock(&self, lock: &AdvisoryLock) -> AppResult<()>;
}
