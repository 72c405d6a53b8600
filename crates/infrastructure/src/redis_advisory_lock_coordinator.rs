//! Redis-backed advisory lock around proxy selection rounds.
//!
//! The lock is one key per pool scope holding the holder's token. It is taken
//! with a single `SET NX EX` so a crashed worker can never leave a key without
//! a TTL, and released with a token compare-and-delete script.

use async_trait::async_trait;
use fleetlease_application::{AdvisoryLock, AdvisoryLockCoordinator};
use fleetlease_core::{AppError, AppResult};
use redis::Script;
use tracing::debug;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

/// Builds the atomic take-with-TTL command for one selection lock.
fn acquire_command(key: &str, token: &str, lock_seconds: u32) -> redis::Cmd {
    let mut command = redis::cmd("SET");
    command
        .arg(key)
        .arg(token)
        .arg("NX")
        .arg("EX")
        .arg(lock_seconds);
    command
}

/// Redis implementation of the proxy selection lock.
#[derive(Clone)]
pub struct RedisAdvisoryLockCoordinator {
    client: redis::Client,
    key_prefix: String,
}

impl RedisAdvisoryLockCoordinator {
    /// Creates a coordinator whose keys live under `key_prefix`.
    #[must_use]
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn lock_key(&self, scope_key: &str) -> String {
        format!("{}:lock:{scope_key}", self.key_prefix)
    }

    async fn connection(&self) -> AppResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("selection lock store unreachable: {error}"))
            })
    }
}

#[async_trait]
impl AdvisoryLockCoordinator for RedisAdvisoryLockCoordinator {
    async fn try_acquire_lock(
        &self,
        scope_key: &str,
        holder_id: &str,
        lock_seconds: u32,
    ) -> AppResult<Option<AdvisoryLock>> {
        if scope_key.trim().is_empty() {
            return Err(AppError::Validation(
                "selection lock scope must not be empty".to_owned(),
            ));
        }

        if lock_seconds == 0 {
            return Err(AppError::Validation(
                "selection lock ttl must be greater than zero".to_owned(),
            ));
        }

        let key = self.lock_key(scope_key);
        let token = format!("{holder_id}:{}", uuid::Uuid::new_v4());
        let mut connection = self.connection().await?;

        let reply: Option<String> = acquire_command(key.as_str(), token.as_str(), lock_seconds)
            .query_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("failed to take selection lock: {error}"))
            })?;

        if reply.is_none() {
            debug!(scope_key, holder_id, "selection lock held elsewhere");
            return Ok(None);
        }

        Ok(Some(AdvisoryLock {
            scope_key: scope_key.to_owned(),
            token,
            holder_id: holder_id.to_owned(),
        }))
    }

    async fn release_lock(&self, lock: &AdvisoryLock) -> AppResult<()> {
        let key = self.lock_key(lock.scope_key.as_str());
        let mut connection = self.connection().await?;

        let deleted = Script::new(RELEASE_LOCK_SCRIPT)
            .key(key)
            .arg(lock.token.as_str())
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("failed to release selection lock: {error}"))
            })?;
        if deleted == 0 {
            debug!(
                scope_key = %lock.scope_key,
                holder_id = %lock.holder_id,
                "selection lock expired before release"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use fleetlease_application::AdvisoryLockCoordinator;

    use super::{RedisAdvisoryLockCoordinator, acquire_command};

    fn test_coordinator() -> Option<RedisAdvisoryLockCoordinator> {
        let redis_url = std::env::var("REDIS_URL").ok()?;
        let client = redis::Client::open(redis_url.as_str()).ok()?;
        Some(RedisAdvisoryLockCoordinator::new(
            client,
            format!("fleetlease-test-{}", uuid::Uuid::new_v4()),
        ))
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let Some(coordinator) = test_coordinator() else {
            return;
        };

        let first = coordinator
            .try_acquire_lock("proxy-selection:ProxyNo1:4G", "worker-a", 5)
            .await
            .unwrap_or_else(|_| unreachable!());
        let Some(first) = first else {
            panic!("first lock attempt should succeed");
        };
        let second = coordinator
            .try_acquire_lock("proxy-selection:ProxyNo1:4G", "worker-b", 5)
            .await;
        assert!(matches!(second, Ok(None)));

        assert!(coordinator.release_lock(&first).await.is_ok());
        let third = coordinator
            .try_acquire_lock("proxy-selection:ProxyNo1:4G", "worker-b", 5)
            .await;
        assert!(matches!(third, Ok(Some(_))));
    }

    #[test]
    fn lock_is_taken_with_its_ttl_in_one_command() {
        let command = acquire_command("fleetlease:lock:proxy-selection", "worker-a:1", 10);

        let args: Vec<Vec<u8>> = command
            .args_iter()
            .filter_map(|arg| match arg {
                redis::Arg::Simple(bytes) => Some(bytes.to_vec()),
                redis::Arg::Cursor => None,
                _ => None,
            })
            .collect();

        let expected: Vec<Vec<u8>> = [
            "SET",
            "fleetlease:lock:proxy-selection",
            "worker-a:1",
            "NX",
            "EX",
            "10",
        ]
        .iter()
        .map(|part| part.as_bytes().to_vec())
        .collect();
        assert_eq!(args, expected);
    }

    #[tokio::test]
    async fn lock_expires_without_release() {
        let Some(coordinator) = test_coordinator() else {
            return;
        };

        let first = coordinator
            .try_acquire_lock("proxy-selection:ProxyNo1:RESIDENTIAL", "worker-a", 1)
            .await;
        assert!(matches!(first, Ok(Some(_))));
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

        let second = coordinator
            .try_acquire_lock("proxy-selection:ProxyNo1:RESIDENTIAL", "worker-b", 1)
            .await;
        assert!(matches!(second, Ok(Some(_))));
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let coordinator = RedisAdvisoryLockCoordinator::new(
            redis::Client::open("redis://127.0.0.1/").unwrap_or_else(|_| unreachable!()),
            "fleetlease-test",
        );

        let result = coordinator
            .try_acquire_lock("proxy-selection", "worker-a", 0)
            .await;

        assert!(result.is_err());
    }
}
