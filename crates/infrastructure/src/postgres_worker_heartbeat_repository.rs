use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetlease_application::WorkerHeartbeatRepository;
use fleetlease_core::{AppError, AppResult, WorkerId};
use fleetlease_domain::{WorkerHeartbeat, WorkerRole};
use sqlx::{FromRow, PgPool};


/// PostgreSQL-backed worker heartbeat repository.
#[derive(Clone)]
pub struct PostgresWorkerHeartbeatRepository {
    pool: PgPool,
}

impl PostgresWorkerHeartbeatRepository {
    /// Creates a heartbeat repository with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct WorkerHeartbeatRow {
    worker_id: String,
    role: String,
    host: Option<String>,
    status_message: Option<String>,
    last_seen_at: DateTime<Utc>,
}

fn heartbeat_from_row(row: WorkerHeartbeatRow) -> AppResult<WorkerHeartbeat> {
    Ok(WorkerHeartbeat {
        worker_id: WorkerId::new(row.worker_id)?,
        role: WorkerRole::parse(row.role.as_str())?,
        host: row.host,
        status_message: row.status_message,
        last_seen_at: row.last_seen_at,
    })
}

#[async_trait]
impl WorkerHeartbeatRepository for PostgresWorkerHeartbeatRepository {
    async fn upsert_heartbeat(&self, heartbeat: WorkerHeartbeat) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (
                worker_id,
                role,
                host,
                status_message,
                last_seen_at
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (worker_id, role)
            DO UPDATE SET
                host = COALESCE(EXCLUDED.host, worker_heartbeats.host),
                status_message = COALESCE(
                    EXCLUDED.status_message,
                    worker_heartbeats.status_message
                ),
                last_seen_at = GREATEST(EXCLUDED.last_seen_at, worker_heartbeats.last_seen_at)
            "#,
        )
        .bind(heartbeat.worker_id.as_str())
        .bind(heartbeat.role.as_str())
        .bind(heartbeat.host.as_deref())
        .bind(heartbeat.status_message.as_deref())
        .bind(heartbeat.last_seen_at)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!(
                "failed to upsert heartbeat for worker '{}': {error}",
                heartbeat.worker_id
            ))
        })?;

        Ok(())
    }

    async fn count_active(&self, role: WorkerRole, seen_since: DateTime<Utc>) -> AppResult<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM worker_heartbeats
            WHERE role = $1
              AND last_seen_at >= $2
            "#,
        )
        .bind(role.as_str())
        .bind(seen_since)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!(
                "failed to count active {} workers: {error}",
                role.as_str()
            ))
        })
    }

    async fn list_for_worker(&self, worker_id: &WorkerId) -> AppResult<Vec<WorkerHeartbeat>> {
        let rows = sqlx::query_as::<_, WorkerHeartbeatRow>(
            r#"
            SELECT worker_id, role, host, status_message, last_seen_at
            FROM worker_heartbeats
            WHERE worker_id = $1
            ORDER BY role ASC
            "#,
        )
        .bind(worker_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::StoreUnavailable(format!(
                "failed to list heartbeats for worker '{worker_id}': {error}"
            ))
        })?;

        rows.into_iter().map(heartbeat_from_row).collect()
    }
}
