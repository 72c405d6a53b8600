use std::time::Duration;

use fleetlease_core::{AppError, AppResult};
use fleetlease_domain::{Proxy, ProxyIdentity};
use tracing::{debug, info, warn};

use super::{ProxyLease, Selector};

impl Selector {
    /// Rotates a proxy claimed for rotation and leases it on success.
    ///
    /// `previous` is the record as it was before the rotation claim; its usage
    /// count is restored when the rotation does not complete within `limit`.
    pub(super) async fn rotate(&self, previous: Proxy, limit: Duration) -> AppResult<ProxyLease> {
        info!(
            proxy_id = %previous.id,
            usage_count = previous.usage_count,
            "rotating proxy identity"
        );

        let healthy = tokio::time::timeout(limit, self.rotate_until_healthy(&previous));
        let identity = match healthy.await {
            Ok(Ok(identity)) => identity,
            Ok(Err(error)) => return Err(self.abort(&previous, error).await),
            Err(_) => {
                let error = AppError::RotationTimeout(format!(
                    "proxy '{}' was not healthy within {}ms of rotation",
                    previous.id,
                    limit.as_millis()
                ));
                return Err(self.abort(&previous, error).await);
            }
        };

        let proxy = match self
            .repository
            .complete_rotation(previous.id, self.clock.now())
            .await
        {
            Ok(proxy) => proxy,
            Err(error) => {
                if let Err(restore_error) = self
                    .repository
                    .abort_rotation(previous.id, 0, self.clock.now())
                    .await
                {
                    warn!(
                        proxy_id = %previous.id,
                        error = %restore_error,
                        "failed to clear rotating flag"
                    );
                }
                return Err(error);
            }
        };
        info!(proxy_id = %proxy.id, host = %identity.host, "proxy rotated");

        Ok(self.lease(proxy, identity, true))
    }

    async fn rotate_until_healthy(&self, proxy: &Proxy) -> AppResult<ProxyIdentity> {
        let ticket = self.rotator.rotate(proxy).await.map_err(|error| {
            AppError::RotationFailed(format!(
                "provider rejected rotation of proxy '{}': {error}",
                proxy.id
            ))
        })?;

        if !ticket.settle_delay.is_zero() {
            debug!(
                proxy_id = %proxy.id,
                settle_ms = ticket.settle_delay.as_millis(),
                "waiting for rotated proxy to settle"
            );
            tokio::time::sleep(ticket.settle_delay).await;
        }

        loop {
            match self.rotator.current_identity(proxy).await {
                Ok(identity) => match self.rotator.check_health(&identity).await {
                    Ok(true) => return Ok(identity),
                    Ok(false) => debug!(proxy_id = %proxy.id, "rotated proxy not healthy yet"),
                    Err(error) => {
                        debug!(proxy_id = %proxy.id, error = %error, "health check failed");
                    }
                },
                Err(error) => {
                    debug!(proxy_id = %proxy.id, error = %error, "identity lookup failed");
                }
            }

            tokio::time::sleep(self.policy.rotation_poll_interval).await;
        }
    }

    /// Clears the rotating flag and restores the usage count, returning the
    /// error to surface.
    async fn abort(&self, previous: &Proxy, error: AppError) -> AppError {
        warn!(proxy_id = %previous.id, error = %error, "proxy rotation failed, restoring");
        match self
            .repository
            .abort_rotation(previous.id, previous.usage_count, self.clock.now())
            .await
        {
            Ok(()) => error,
            Err(restore_error) => AppError::StoreUnavailable(format!(
                "{error}; additionally failed to restore proxy '{}': {restore_error}",
                previous.id
            )),
        }
    }
}
