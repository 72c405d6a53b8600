use std::env;
use std::time::Duration;

use fleetlease_application::{AccountLeasePolicy, ProxyLeasePolicy, RetryPolicy};
use fleetlease_core::{AppError, AppResult, WorkerId};
use fleetlease_domain::{
    FrequencyByStage, ProxyPoolFilter, ProxyProvider, ProxyType, WorkerRole,
};

#[derive(Debug, Clone)]
pub(crate) struct WorkerConfig {
    pub(crate) database_url: String,
    pub(crate) redis_url: Option<String>,
    pub(crate) worker_id: WorkerId,
    pub(crate) role: WorkerRole,
    pub(crate) host: Option<String>,
    pub(crate) task_url: String,
    pub(crate) proxy_provider_base_url: String,
    pub(crate) proxy_retry_timeout: Duration,
    pub(crate) proxy_retry_polling_interval: Duration,
    pub(crate) proxy_health_check_url: Option<String>,
    pub(crate) proxy_settle_delay: Duration,
    pub(crate) account_sleep: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) account_policy: AccountLeasePolicy,
    pub(crate) proxy_policy: ProxyLeasePolicy,
}

impl WorkerConfig {
    pub(crate) fn load() -> AppResult<Self> {
        let database_url = required_env("DATABASE_URL")?;
        let redis_url = optional_env("REDIS_URL");
        let worker_id = match optional_env("WORKER_ID") {
            Some(value) => WorkerId::new(value)?,
            None => WorkerId::from_process(),
        };
        let role = WorkerRole::parse(
            env::var("WORKER_ROLE")
                .unwrap_or_else(|_| WorkerRole::KarmaFarmer.as_str().to_owned())
                .as_str(),
        )?;
        let host = optional_env("HOSTNAME");
        let task_url = required_env("WORKER_TASK_URL")?;
        let proxy_provider_base_url = env::var("PROXY_PROVIDER_BASE_URL")
            .unwrap_or_else(|_| "https://app.proxyno1.com".to_owned())
            .trim_end_matches('/')
            .to_owned();

        let proxy_provider = ProxyProvider::parse(
            env::var("PROXY_PROVIDER")
                .unwrap_or_else(|_| ProxyProvider::ProxyNo1.as_str().to_owned())
                .as_str(),
        )?;
        let proxy_type = ProxyType::parse(
            env::var("PROXY_TYPE")
                .unwrap_or_else(|_| ProxyType::Residential.as_str().to_owned())
                .as_str(),
        )?;
        let proxy_max_uses = parse_env_i64("PROXY_MAX_USES", 5)?;
        let proxy_retry_timeout_ms = parse_env_u64("PROXY_RETRY_TIMEOUT_MS", 120_000)?;
        let proxy_retry_polling_interval_ms =
            parse_env_u64("PROXY_RETRY_POLLING_INTERVAL_MS", 5_000)?;
        let proxy_rotation_timeout_ms = parse_env_u64("PROXY_ROTATION_TIMEOUT_MS", 240_000)?;
        let proxy_rotation_poll_interval_ms =
            parse_env_u64("PROXY_ROTATION_POLL_INTERVAL_MS", 200)?;
        let proxy_health_check_url = optional_env("PROXY_HEALTH_CHECK_URL");
        let proxy_settle_delay_ms = parse_env_u64("PROXY_SETTLE_DELAY_MS", 5_000)?;
        let release_retry_interval_ms = parse_env_u64("RELEASE_RETRY_INTERVAL_MS", 1_000)?;
        let release_retry_attempts = parse_env_u32("RELEASE_RETRY_ATTEMPTS", 5)?;

        let minimum_age_days = parse_env_u32("ACCOUNT_MINIMUM_DAYS_OLD", 30)?;
        let minimum_score = parse_env_i64("ACCOUNT_MINIMUM_SCORE", 0)?;
        let frequency_by_stage = parse_frequency_by_stage(
            required_env("ACCOUNT_FREQUENCY_BY_STAGE")?.as_str(),
        )?;
        let per_worker_quota = parse_env_u32("ACCOUNT_PER_WORKER_QUOTA", 5)?;
        let account_sleep_ms = parse_env_u64("ACCOUNT_SLEEP_MS", 60_000)?;
        let fairness_role = match optional_env("FAIRNESS_ROLE") {
            Some(value) => WorkerRole::parse(value.as_str())?,
            None => role,
        };
        let liveness_window_seconds = parse_env_i64("LIVENESS_WINDOW_SECONDS", 1_800)?;
        let heartbeat_interval_ms = parse_env_u64("HEARTBEAT_INTERVAL_MS", 30_000)?;

        if account_sleep_ms == 0 {
            return Err(AppError::Validation(
                "ACCOUNT_SLEEP_MS must be greater than zero".to_owned(),
            ));
        }

        if heartbeat_interval_ms == 0 {
            return Err(AppError::Validation(
                "HEARTBEAT_INTERVAL_MS must be greater than zero".to_owned(),
            ));
        }

        if proxy_retry_polling_interval_ms == 0 {
            return Err(AppError::Validation(
                "PROXY_RETRY_POLLING_INTERVAL_MS must be greater than zero".to_owned(),
            ));
        }

        if release_retry_attempts == 0 {
            return Err(AppError::Validation(
                "RELEASE_RETRY_ATTEMPTS must be greater than zero".to_owned(),
            ));
        }

        let account_sleep = Duration::from_millis(account_sleep_ms);
        let release_policy =
            RetryPolicy::unbounded(Duration::from_millis(release_retry_interval_ms))
                .with_max_attempts(release_retry_attempts);
        let proxy_retry_polling_interval = Duration::from_millis(proxy_retry_polling_interval_ms);

        let account_policy = AccountLeasePolicy {
            minimum_age_days,
            minimum_score,
            frequency_by_stage,
            per_worker_quota,
            fairness_role,
            liveness_window: liveness_window(liveness_window_seconds)?,
            poll_policy: RetryPolicy::unbounded(account_sleep),
            release_policy,
        };
        account_policy.validate()?;

        let proxy_policy = ProxyLeasePolicy {
            pool: ProxyPoolFilter {
                provider: proxy_provider,
                proxy_type,
                max_uses: proxy_max_uses,
            },
            rotation_timeout: Duration::from_millis(proxy_rotation_timeout_ms),
            rotation_poll_interval: Duration::from_millis(proxy_rotation_poll_interval_ms),
            retry_policy: RetryPolicy::unbounded(proxy_retry_polling_interval),
            advisory_lock_seconds: 10,
            release_policy,
        };
        proxy_policy.validate()?;

        Ok(Self {
            database_url,
            redis_url,
            worker_id,
            role,
            host,
            task_url,
            proxy_provider_base_url,
            proxy_retry_timeout: Duration::from_millis(proxy_retry_timeout_ms),
            proxy_retry_polling_interval,
            proxy_health_check_url,
            proxy_settle_delay: Duration::from_millis(proxy_settle_delay_ms),
            account_sleep,
            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms),
            account_policy,
            proxy_policy,
        })
    }
}

fn parse_frequency_by_stage(value: &str) -> AppResult<FrequencyByStage> {
    serde_json::from_str::<FrequencyByStage>(value).map_err(|error| {
        AppError::Validation(format!(
            "invalid ACCOUNT_FREQUENCY_BY_STAGE value '{value}': {error}"
        ))
    })
}

fn liveness_window(seconds: i64) -> AppResult<chrono::Duration> {
    chrono::Duration::try_seconds(seconds).ok_or_else(|| {
        AppError::Validation(format!(
            "invalid LIVENESS_WINDOW_SECONDS value '{seconds}': out of range"
        ))
    })
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_env_u32(name: &str, default: u32) -> AppResult<u32> {
    match env::var(name) {
        Ok(value) => value.parse::<u32>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_i64(name: &str, default: i64) -> AppResult<i64> {
    match env::var(name) {
        Ok(value) => value.parse::<i64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}
