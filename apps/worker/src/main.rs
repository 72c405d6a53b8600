//! Fleetlease worker runtime.

#![forbid(unsafe_code)]

mod config;
mod task;

use std::sync::Arc;
use std::time::Duration;

use fleetlease_application::{AccountLeaseManager, Clock, LivenessRegistry, ProxyLeaseManager};
use fleetlease_core::{AppError, AppResult, WorkerId};
use fleetlease_domain::{LeaseOutcome, WorkerRole};
use fleetlease_infrastructure::{
    HttpProxyIdentityRotator, PostgresAccountRepository, PostgresProxyRepository,
    PostgresWorkerHeartbeatRepository, RedisAdvisoryLockCoordinator, SystemClock,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let pool = connect_pool(config.database_url.as_str()).await?;
    sqlx::migrate!("../../crates/infrastructure/migrations")
        .run(&pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to run migrations: {error}")))?;

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|error| AppError::Internal(format!("failed to build HTTP client: {error}")))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut liveness = LivenessRegistry::new(
        Arc::new(PostgresWorkerHeartbeatRepository::new(pool.clone())),
        clock.clone(),
    );
    if let Some(host) = config.host.as_deref() {
        liveness = liveness.with_host(host);
    }

    let accounts = AccountLeaseManager::new(
        Arc::new(PostgresAccountRepository::new(pool.clone())),
        liveness.clone(),
        clock.clone(),
        config.account_policy.clone(),
    )?;

    let mut rotator = HttpProxyIdentityRotator::new(
        http_client.clone(),
        config.proxy_provider_base_url.as_str(),
        config.proxy_retry_timeout,
        config.proxy_retry_polling_interval,
    )
    .with_settle_delay(config.proxy_settle_delay);
    if let Some(health_check_url) = config.proxy_health_check_url.as_deref() {
        rotator = rotator.with_health_check_url(health_check_url);
    }
    let mut proxies = ProxyLeaseManager::new(
        Arc::new(PostgresProxyRepository::new(pool)),
        Arc::new(rotator),
        clock,
        config.worker_id.clone(),
        config.proxy_policy.clone(),
    )?;
    if let Some(redis_url) = config.redis_url.as_deref() {
        let client = redis::Client::open(redis_url)
            .map_err(|error| AppError::Internal(format!("invalid REDIS_URL: {error}")))?;
        proxies =
            proxies.with_advisory_lock(Arc::new(RedisAdvisoryLockCoordinator::new(client, "fleetlease")));
    }

    spawn_heartbeat(
        liveness.clone(),
        config.worker_id.clone(),
        config.role,
        config.heartbeat_interval,
    );

    info!(
        worker_id = %config.worker_id,
        role = config.role.as_str(),
        proxy_pool = %config.proxy_policy.selection_scope(),
        max_uses = config.proxy_policy.pool.max_uses,
        per_worker_quota = config.account_policy.per_worker_quota,
        advisory_lock = config.redis_url.is_some(),
        "fleetlease-worker started"
    );

    loop {
        let account = match accounts.acquire_blocking().await {
            Ok(lease) => lease,
            Err(error) => {
                warn!(
                    worker_id = %config.worker_id,
                    error = %error,
                    "failed to lease an account"
                );
                tokio::time::sleep(config.account_sleep).await;
                continue;
            }
        };
        report_status(
            &liveness,
            &config,
            format!("leased account {}", account.resource.username),
        )
        .await;

        let proxy = match proxies.acquire().await {
            Ok(lease) => lease,
            Err(error) => {
                warn!(
                    worker_id = %config.worker_id,
                    account_id = %account.resource.id,
                    error = %error,
                    retryable = error.is_retryable(),
                    "failed to lease a proxy"
                );
                check_release(
                    &config.worker_id,
                    "account",
                    accounts
                        .release(account.resource.id, LeaseOutcome::Failure)
                        .await,
                )?;
                tokio::time::sleep(config.account_sleep).await;
                continue;
            }
        };

        let outcome = match task::dispatch(&http_client, &config, &account, &proxy).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(
                    worker_id = %config.worker_id,
                    account_id = %account.resource.id,
                    proxy_id = %proxy.proxy.id,
                    error = %error,
                    "task dispatch failed"
                );
                LeaseOutcome::Failure
            }
        };
        info!(
            worker_id = %config.worker_id,
            account_id = %account.resource.id,
            proxy_id = %proxy.proxy.id,
            rotated = proxy.rotated,
            outcome = outcome.as_str(),
            "task finished"
        );

        check_release(&config.worker_id, "proxy", proxies.release(outcome).await)?;
        check_release(
            &config.worker_id,
            "account",
            accounts.release(account.resource.id, outcome).await,
        )?;
        report_status(
            &liveness,
            &config,
            format!("finished account {} ({})", account.resource.username, outcome.as_str()),
        )
        .await;
    }
}

/// Logs a failed release and decides whether the loop may continue.
///
/// `StoreUnavailable` means the managers already retried and still hold the
/// lease, so the worker stops and leaves recovery to its supervisor.
fn check_release<T>(worker_id: &WorkerId, resource: &str, result: AppResult<T>) -> AppResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(store_error @ AppError::StoreUnavailable(_)) => {
            error!(
                worker_id = %worker_id,
                resource,
                error = %store_error,
                "release could not be recorded, stopping worker"
            );
            Err(store_error)
        }
        Err(release_error) => {
            warn!(
                worker_id = %worker_id,
                resource,
                error = %release_error,
                "failed to release lease"
            );
            Ok(())
        }
    }
}

async fn report_status(liveness: &LivenessRegistry, config: &WorkerConfig, status: String) {
    if let Err(error) = liveness
        .heartbeat_with_status(&config.worker_id, config.role, status.as_str())
        .await
    {
        warn!(
            worker_id = %config.worker_id,
            error = %error,
            "failed to publish worker status"
        );
    }
}

fn spawn_heartbeat(
    liveness: LivenessRegistry,
    worker_id: WorkerId,
    role: WorkerRole,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(error) = liveness.heartbeat(&worker_id, role).await {
                warn!(
                    worker_id = %worker_id,
                    error = %error,
                    "failed to publish worker heartbeat"
                );
            }
        }
    });
}

async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use fleetlease_core::{AppError, WorkerId};

    use super::check_release;

    fn worker() -> WorkerId {
        WorkerId::new("worker-a").unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn unrecorded_release_stops_the_worker() {
        let result = check_release::<()>(
            &worker(),
            "account",
            Err(AppError::StoreUnavailable("database offline".to_owned())),
        );

        assert!(matches!(result, Err(AppError::StoreUnavailable(_))));
    }

    #[test]
    fn release_misuse_is_logged_and_the_loop_continues() {
        let misuse = check_release::<()>(
            &worker(),
            "proxy",
            Err(AppError::ReleaseWithoutAcquire("no proxy held".to_owned())),
        );
        let released = check_release(&worker(), "proxy", Ok(()));

        assert!(misuse.is_ok());
        assert!(released.is_ok());
    }
}
