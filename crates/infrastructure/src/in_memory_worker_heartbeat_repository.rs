use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetlease_application::WorkerHeartbeatRepository;
use fleetlease_core::{AppResult, WorkerId};
use fleetlease_domain::{WorkerHeartbeat, WorkerRole};
use tokio::sync::RwLock;

/// In-memory worker heartbeat repository.
#[derive(Debug, Default)]
pub struct InMemoryWorkerHeartbeatRepository {
    heartbeats: RwLock<HashMap<(WorkerId, WorkerRole), WorkerHeartbeat>>,
}

impl InMemoryWorkerHeartbeatRepository {
    /// Creates an empty in-memory repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerHeartbeatRepository for InMemoryWorkerHeartbeatRepository {
    async fn upsert_heartbeat(&self, heartbeat: WorkerHeartbeat) -> AppResult<()> {
        let mut heartbeats = self.heartbeats.write().await;
        let key = (heartbeat.worker_id.clone(), heartbeat.role);
        let merged = match heartbeats.get(&key) {
            Some(stored) => WorkerHeartbeat {
                host: heartbeat.host.or_else(|| stored.host.clone()),
                status_message: heartbeat
                    .status_message
                    .or_else(|| stored.status_message.clone()),
                last_seen_at: heartbeat.last_seen_at.max(stored.last_seen_at),
                ..heartbeat
            },
            None => heartbeat,
        };
        heartbeats.insert(key, merged);

        Ok(())
    }

    async fn count_active(&self, role: WorkerRole, seen_since: DateTime<Utc>) -> AppResult<i64> {
        let count = self
            .heartbeats
            .read()
            .await
            .values()
            .filter(|heartbeat| heartbeat.role == role && heartbeat.last_seen_at >= seen_since)
            .count();

        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn list_for_worker(&self, worker_id: &WorkerId) -> AppResult<Vec<WorkerHeartbeat>> {
        let mut heartbeats: Vec<WorkerHeartbeat> = self
            .heartbeats
            .read()
            .await
            .values()
            .filter(|heartbeat| &heartbeat.worker_id == worker_id)
            .cloned()
            .collect();
        heartbeats.sort_by(|left, right| left.role.as_str().cmp(right.role.as_str()));

        Ok(heartbeats)
    }
}
