use std::time::Duration;

use async_trait::async_trait;
use fleetlease_application::{IdentityRotator, RotationTicket};
use fleetlease_core::{AppError, AppResult};
use fleetlease_domain::{Proxy, ProxyIdentity};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

const DEFAULT_HEALTH_CHECK_URL: &str = "https://api.ipify.org/?format=json";
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity rotator for ProxyNo1-style key APIs.
pub struct HttpProxyIdentityRotator {
    http_client: reqwest::Client,
    base_url: String,
    health_check_url: String,
    retry_timeout: Duration,
    retry_polling_interval: Duration,
    settle_delay: Duration,
    cached_health_client: Mutex<Option<(ProxyIdentity, reqwest::Client)>>,
}

impl HttpProxyIdentityRotator {
    /// Creates a rotator against `base_url`, giving up on IP change requests
    /// after `retry_timeout`.
    #[must_use]
    pub fn new(
        http_client: reqwest::Client,
        base_url: impl Into<String>,
        retry_timeout: Duration,
        retry_polling_interval: Duration,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            health_check_url: DEFAULT_HEALTH_CHECK_URL.to_owned(),
            retry_timeout,
            retry_polling_interval,
            settle_delay: DEFAULT_SETTLE_DELAY,
            cached_health_client: Mutex::new(None),
        }
    }

    /// Overrides the IP echo endpoint fetched through the proxy.
    #[must_use]
    pub fn with_health_check_url(mut self, health_check_url: impl Into<String>) -> Self {
        self.health_check_url = health_check_url.into();
        self
    }

    /// Overrides the pause after an accepted IP change.
    #[must_use]
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Returns a client routed through `identity`, reusing the last one while
    /// the identity is unchanged.
    async fn health_client(&self, identity: &ProxyIdentity) -> AppResult<reqwest::Client> {
        let mut slot = self.cached_health_client.lock().await;
        reuse_or_build(&mut slot, identity, build_health_client)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> AppResult<T> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|error| AppError::Internal(format!("proxy provider request failed: {error}")))?;

        if !response.status().is_success() {
            return Err(AppError::Internal(format!(
                "proxy provider returned status {}",
                response.status()
            )));
        }

        response.json::<T>().await.map_err(|error| {
            AppError::Internal(format!("proxy provider returned invalid JSON: {error}"))
        })
    }
}

fn build_health_client(identity: &ProxyIdentity) -> AppResult<reqwest::Client> {
    let mut upstream = reqwest::Proxy::all(identity.endpoint().as_str())
        .map_err(|error| AppError::Validation(format!("invalid proxy endpoint: {error}")))?;
    if let Some(username) = identity.username.as_deref() {
        upstream = upstream.basic_auth(username, identity.password.as_deref().unwrap_or(""));
    }

    reqwest::Client::builder()
        .proxy(upstream)
        .timeout(HEALTH_CHECK_TIMEOUT)
        .build()
        .map_err(|error| AppError::Internal(format!("failed to build proxy health client: {error}")))
}

fn reuse_or_build<C: Clone>(
    slot: &mut Option<(ProxyIdentity, C)>,
    identity: &ProxyIdentity,
    build: impl FnOnce(&ProxyIdentity) -> AppResult<C>,
) -> AppResult<C> {
    if let Some((_, client)) = slot.as_ref().filter(|(cached, _)| cached == identity) {
        return Ok(client.clone());
    }

    debug!(endpoint = %identity.endpoint(), "building proxy health client");
    let client = build(identity)?;
    *slot = Some((identity.clone(), client.clone()));
    Ok(client)
}

#[derive(Debug, Deserialize)]
struct ProviderResponse<T> {
    status: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct KeyStatusData {
    proxy: KeyStatusProxy,
    authentication: String,
}

#[derive(Debug, Deserialize)]
struct KeyStatusProxy {
    ip: String,
    #[serde(rename = "HTTP_IPv4")]
    http_ipv4: Value,
}

fn identity_from_key_status(
    api_key: &str,
    response: ProviderResponse<KeyStatusData>,
) -> AppResult<ProxyIdentity> {
    let message = response.message.unwrap_or_default();
    let data = match response.data {
        Some(data) if response.status == 0 => data,
        _ => {
            return Err(AppError::Internal(format!(
                "can't get proxy info for key '{api_key}': {message}"
            )));
        }
    };

    let port = match &data.proxy.http_ipv4 {
        Value::Number(number) => number.as_u64().and_then(|port| u16::try_from(port).ok()),
        Value::String(text) => text.trim().parse::<u16>().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        AppError::Internal(format!("proxy provider returned no usable port for key '{api_key}'"))
    })?;

    let (username, password) = match data.authentication.split_once(':') {
        Some((username, password)) => (Some(username.to_owned()), Some(password.to_owned())),
        None if data.authentication.is_empty() => (None, None),
        None => (Some(data.authentication.clone()), None),
    };

    Ok(ProxyIdentity {
        host: data.proxy.ip,
        port,
        username,
        password,
    })
}

/// Extracts the "wait N seconds" hint from a change-IP reply: the first
/// run of digits with whitespace on both sides.
fn wait_seconds(message: &str) -> Option<u64> {
    let pieces: Vec<&str> = message.split(char::is_whitespace).collect();
    if pieces.len() < 3 {
        return None;
    }

    pieces[1..pieces.len() - 1]
        .iter()
        .find(|piece| !piece.is_empty() && piece.chars().all(|c| c.is_ascii_digit()))
        .and_then(|piece| piece.parse().ok())
}

#[async_trait]
impl IdentityRotator for HttpProxyIdentityRotator {
    async fn current_identity(&self, proxy: &Proxy) -> AppResult<ProxyIdentity> {
        let url = format!("{}/api/key-status/{}", self.base_url, proxy.api_key);
        let response = self
            .get_json::<ProviderResponse<KeyStatusData>>(url.as_str())
            .await?;

        identity_from_key_status(proxy.api_key.as_str(), response)
    }

    async fn rotate(&self, proxy: &Proxy) -> AppResult<RotationTicket> {
        let url = format!("{}/api/change-key-ip/{}", self.base_url, proxy.api_key);
        let started_at = Instant::now();

        loop {
            let response = self.get_json::<ProviderResponse<Value>>(url.as_str()).await?;
            let message = response.message.unwrap_or_default();

            let waited = match wait_seconds(message.as_str()) {
                Some(seconds) => {
                    info!(
                        proxy_id = %proxy.id,
                        wait_seconds = seconds,
                        "provider asked to wait before changing IP"
                    );
                    tokio::time::sleep(Duration::from_secs(seconds) + self.settle_delay).await;
                    true
                }
                None if response.status == 0 => {
                    return Ok(RotationTicket {
                        proxy_id: proxy.id,
                        requested_at: chrono::Utc::now(),
                        settle_delay: self.settle_delay,
                    });
                }
                None => false,
            };

            if started_at.elapsed() >= self.retry_timeout {
                return Err(AppError::Internal(format!(
                    "can't change IP for key '{}', timed out: {message}",
                    proxy.api_key
                )));
            }
            if waited {
                continue;
            }
            tokio::time::sleep(self.retry_polling_interval).await;
        }
    }

    async fn check_health(&self, identity: &ProxyIdentity) -> AppResult<bool> {
        let client = self.health_client(identity).await?;

        match client.get(self.health_check_url.as_str()).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
