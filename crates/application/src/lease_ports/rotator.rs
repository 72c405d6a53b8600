use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetlease_core::AppResult;
use fleetlease_domain::{Proxy, ProxyId, ProxyIdentity};

/// Acknowledgement of an accepted identity rotation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationTicket {
    /// Proxy being rotated.
    pub proxy_id: ProxyId,
    /// When the provider accepted the request.
    pub requested_at: DateTime<Utc>,
    /// Delay before the new identity is worth health-checking.
    pub settle_delay: Duration,
}

/// External provider boundary that changes a proxy's public identity.
#[async_trait]
pub trait IdentityRotator: Send + Sync {
    /// Builds the live connection details for one proxy.
    async fn current_identity(&self, proxy: &Proxy) -> AppResult<ProxyIdentity>;

    /// Requests a new public IP for one proxy.
    async fn rotate(&self, proxy: &Proxy) -> AppResult<RotationTicket>;

    /// Returns whether traffic flows through the identity.
    async fn check_health(&self, identity: &ProxyIdentity) -> AppResult<bool>;
}
