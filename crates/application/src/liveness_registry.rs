use std::sync::Arc;

use fleetlease_core::{AppResult, WorkerId};
use fleetlease_domain::{WorkerHeartbeat, WorkerRole, truncate_status_message};
use tracing::debug;

use crate::lease_ports::{Clock, WorkerHeartbeatRepository};

/// Tracks which workers are alive and how many of each role are active.
#[derive(Clone)]
pub struct LivenessRegistry {
    repository: Arc<dyn WorkerHeartbeatRepository>,
    clock: Arc<dyn Clock>,
    host: Option<String>,
}

impl LivenessRegistry {
    /// Creates a registry over one heartbeat repository.
    #[must_use]
    pub fn new(repository: Arc<dyn WorkerHeartbeatRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repository,
            clock,
            host: None,
        }
    }

    /// Stamps every heartbeat written through this registry with `host`.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        self.host = (!host.trim().is_empty()).then_some(host);
        self
    }

    /// Records that `worker_id` is alive in `role`.
    pub async fn heartbeat(&self, worker_id: &WorkerId, role: WorkerRole) -> AppResult<()> {
        self.write(worker_id, role, None).await
    }

    /// Records liveness together with the worker's current status line.
    pub async fn heartbeat_with_status(
        &self,
        worker_id: &WorkerId,
        role: WorkerRole,
        message: &str,
    ) -> AppResult<()> {
        self.write(worker_id, role, Some(truncate_status_message(message)))
            .await
    }

    /// Counts workers of `role` seen within `liveness_window`.
    pub async fn active_count(
        &self,
        role: WorkerRole,
        liveness_window: chrono::Duration,
    ) -> AppResult<u64> {
        let seen_since = self.clock.now() - liveness_window;
        let count = self.repository.count_active(role, seen_since).await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn write(
        &self,
        worker_id: &WorkerId,
        role: WorkerRole,
        status_message: Option<String>,
    ) -> AppResult<()> {
        let heartbeat = WorkerHeartbeat {
            worker_id: worker_id.clone(),
            role,
            host: self.host.clone(),
            status_message,
            last_seen_at: self.clock.now(),
        };
        self.repository.upsert_heartbeat(heartbeat).await?;
        debug!(worker_id = %worker_id, role = role.as_str(), "heartbeat recorded");

        Ok(())
    }
}
