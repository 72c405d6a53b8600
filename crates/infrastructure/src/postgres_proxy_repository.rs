use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetlease_application::ProxyRepository;
use fleetlease_core::{AppError, AppResult};
use fleetlease_domain::{Proxy, ProxyId, ProxyPoolFilter, ProxyProvider, ProxyType};
use sqlx::{FromRow, PgPool};


const PROXY_COLUMNS: &str =
    "id, api_key, provider, proxy_type, enabled, is_rotating, in_use_count, usage_count, last_used_at";

/// PostgreSQL-backed proxy repository.
#[derive(Clone)]
pub struct PostgresProxyRepository {
    pool: PgPool,
}

impl PostgresProxyRepository {
    /// Creates a proxy repository with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct ProxyRow {
    id: uuid::Uuid,
    api_key: String,
    provider: String,
    proxy_type: String,
    enabled: bool,
    is_rotating: bool,
    in_use_count: i64,
    usage_count: i64,
    last_used_at: Option<DateTime<Utc>>,
}

fn proxy_from_row(row: ProxyRow) -> AppResult<Proxy> {
    Ok(Proxy {
        id: ProxyId::from_uuid(row.id),
        api_key: row.api_key,
        provider: ProxyProvider::parse(row.provider.as_str())?,
        proxy_type: ProxyType::parse(row.proxy_type.as_str())?,
        enabled: row.enabled,
        is_rotating: row.is_rotating,
        in_use_count: row.in_use_count,
        usage_count: row.usage_count,
        last_used_at: row.last_used_at,
    })
}

fn store_error(action: &str, error: sqlx::Error) -> AppError {
    AppError::StoreUnavailable(format!("failed to {action}: {error}"))
}

#[async_trait]
impl ProxyRepository for PostgresProxyRepository {
    async fn save_proxy(&self, proxy: Proxy) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO proxies (
                id,
                api_key,
                provider,
                proxy_type,
                enabled,
                is_rotating,
                in_use_count,
                usage_count,
                last_used_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id)
            DO UPDATE SET
                api_key = EXCLUDED.api_key,
                provider = EXCLUDED.provider,
                proxy_type = EXCLUDED.proxy_type,
                enabled = EXCLUDED.enabled,
                is_rotating = EXCLUDED.is_rotating,
                in_use_count = EXCLUDED.in_use_count,
                usage_count = EXCLUDED.usage_count,
                last_used_at = EXCLUDED.last_used_at
            "#,
        )
        .bind(proxy.id.as_uuid())
        .bind(proxy.api_key.as_str())
        .bind(proxy.provider.as_str())
        .bind(proxy.proxy_type.as_str())
        .bind(proxy.enabled)
        .bind(proxy.is_rotating)
        .bind(proxy.in_use_count)
        .bind(proxy.usage_count)
        .bind(proxy.last_used_at)
        .execute(&self.pool)
        .await
        .map_err(|error| store_error(format!("save proxy '{}'", proxy.id).as_str(), error))?;

        Ok(())
    }

    async fn find_proxy(&self, proxy_id: ProxyId) -> AppResult<Option<Proxy>> {
        let statement = format!("SELECT {PROXY_COLUMNS} FROM proxies WHERE id = $1");
        let row = sqlx::query_as::<_, ProxyRow>(statement.as_str())
            .bind(proxy_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| store_error(format!("find proxy '{proxy_id}'").as_str(), error))?;

        row.map(proxy_from_row).transpose()
    }

    async fn count_pool(&self, pool: &ProxyPoolFilter) -> AppResult<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM proxies
            WHERE enabled
              AND provider = $1
              AND proxy_type = $2
            "#,
        )
        .bind(pool.provider.as_str())
        .bind(pool.proxy_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| store_error("count proxy pool", error))
    }

    async fn claim_for_lease(
        &self,
        pool: &ProxyPoolFilter,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Proxy>> {
        let statement = format!(
            r#"
            UPDATE proxies
            SET
                usage_count = usage_count + 1,
                in_use_count = in_use_count + 1,
                last_used_at = $4
            WHERE id = (
                SELECT id
                FROM proxies
                WHERE enabled
                  AND provider = $1
                  AND proxy_type = $2
                  AND NOT is_rotating
                  AND usage_count < $3
                ORDER BY last_used_at ASC NULLS FIRST, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
              AND NOT is_rotating
              AND usage_count < $3
            RETURNING {PROXY_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, ProxyRow>(statement.as_str())
            .bind(pool.provider.as_str())
            .bind(pool.proxy_type.as_str())
            .bind(pool.max_uses)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| store_error("claim proxy", error))?;

        row.map(proxy_from_row).transpose()
    }

    async fn rollback_lease(&self, proxy_id: ProxyId) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE proxies
            SET
                usage_count = GREATEST(usage_count - 1, 0),
                in_use_count = GREATEST(in_use_count - 1, 0)
            WHERE id = $1
            "#,
        )
        .bind(proxy_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|error| store_error(format!("roll back proxy '{proxy_id}'").as_str(), error))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("proxy '{proxy_id}' does not exist")));
        }

        Ok(())
    }

    async fn claim_for_rotation(
        &self,
        pool: &ProxyPoolFilter,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Proxy>> {
        let row = sqlx::query_as::<_, ProxyRow>(
            r#"
            WITH candidate AS (
                SELECT id, usage_count, in_use_count, last_used_at
                FROM proxies
                WHERE enabled
                  AND provider = $1
                  AND proxy_type = $2
                  AND NOT is_rotating
                  AND usage_count >= $3
                  AND in_use_count = 0
                ORDER BY last_used_at ASC NULLS FIRST, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE proxies
            SET
                is_rotating = TRUE,
                usage_count = 0,
                in_use_count = 0,
                last_used_at = $4
            FROM candidate
            WHERE proxies.id = candidate.id
            RETURNING
                proxies.id,
                proxies.api_key,
                proxies.provider,
                proxies.proxy_type,
                proxies.enabled,
                FALSE AS is_rotating,
                candidate.in_use_count,
                candidate.usage_count,
                candidate.last_used_at
            "#,
        )
        .bind(pool.provider.as_str())
        .bind(pool.proxy_type.as_str())
        .bind(pool.max_uses)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| store_error("claim proxy for rotation", error))?;

        row.map(proxy_from_row).transpose()
    }

    async fn complete_rotation(&self, proxy_id: ProxyId, now: DateTime<Utc>) -> AppResult<Proxy> {
        let statement = format!(
            r#"
            UPDATE proxies
            SET
                is_rotating = FALSE,
                usage_count = usage_count + 1,
                in_use_count = in_use_count + 1,
                last_used_at = $2
            WHERE id = $1
              AND is_rotating
            RETURNING {PROXY_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, ProxyRow>(statement.as_str())
            .bind(proxy_id.as_uuid())
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| {
                store_error(format!("complete rotation of proxy '{proxy_id}'").as_str(), error)
            })?;

        let row = row.ok_or_else(|| {
            AppError::Conflict(format!("proxy '{proxy_id}' is not rotating"))
        })?;
        proxy_from_row(row)
    }

    async fn abort_rotation(
        &self,
        proxy_id: ProxyId,
        restored_usage_count: i64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE proxies
            SET
                is_rotating = FALSE,
                usage_count = $2,
                last_used_at = $3
            WHERE id = $1
              AND is_rotating
            "#,
        )
        .bind(proxy_id.as_uuid())
        .bind(restored_usage_count)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            store_error(format!("abort rotation of proxy '{proxy_id}'").as_str(), error)
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "proxy '{proxy_id}' is not rotating"
            )));
        }

        Ok(())
    }

    async fn release_lease(&self, proxy_id: ProxyId, now: DateTime<Utc>) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE proxies
            SET
                in_use_count = GREATEST(in_use_count - 1, 0),
                last_used_at = $2
            WHERE id = $1
            "#,
        )
        .bind(proxy_id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|error| store_error(format!("release proxy '{proxy_id}'").as_str(), error))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("proxy '{proxy_id}' does not exist")));
        }

        Ok(())
    }
}
