use std::fmt::{Debug, Display, Formatter};

use chrono::{DateTime, Utc};
use fleetlease_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Proxy identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyId(Uuid);

impl ProxyId {
    /// Creates a random proxy identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a proxy identifier from an existing UUID value.
    #[must_use]
    pub fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    /// Returns the underlying UUID value.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ProxyId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ProxyId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Upstream vendor operating a rotating proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyProvider {
    /// ProxyNo1 rotating residential and 4G proxies.
    #[serde(rename = "ProxyNo1")]
    ProxyNo1,
}

impl ProxyProvider {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProxyNo1 => "ProxyNo1",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "ProxyNo1" => Ok(Self::ProxyNo1),
            _ => Err(AppError::Validation(format!(
                "unknown proxy provider '{value}'"
            ))),
        }
    }
}

/// Network class of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyType {
    /// Residential IP pool.
    #[serde(rename = "RESIDENTIAL")]
    Residential,
    /// Mobile 4G IP pool.
    #[serde(rename = "4G")]
    Lte,
}

impl ProxyType {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Residential => "RESIDENTIAL",
            Self::Lte => "4G",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "RESIDENTIAL" => Ok(Self::Residential),
            "4G" => Ok(Self::Lte),
            _ => Err(AppError::Validation(format!(
                "unknown proxy type '{value}'"
            ))),
        }
    }
}

/// Persisted proxy record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    /// Stable proxy identifier.
    pub id: ProxyId,
    /// Provider API key that addresses this proxy.
    pub api_key: String,
    /// Provider operating the proxy.
    pub provider: ProxyProvider,
    /// Network class.
    pub proxy_type: ProxyType,
    /// Disabled proxies are never leased.
    pub enabled: bool,
    /// Set while the proxy's public IP is being changed.
    pub is_rotating: bool,
    /// Leases currently handed out.
    pub in_use_count: i64,
    /// Leases started since the last rotation, in-flight ones included.
    pub usage_count: i64,
    /// Last lease start or release.
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Proxy {
    /// Creates an enabled, unused proxy record.
    #[must_use]
    pub fn new(api_key: impl Into<String>, provider: ProxyProvider, proxy_type: ProxyType) -> Self {
        Self {
            id: ProxyId::new(),
            api_key: api_key.into(),
            provider,
            proxy_type,
            enabled: true,
            is_rotating: false,
            in_use_count: 0,
            usage_count: 0,
            last_used_at: None,
        }
    }
}

/// Live connection details for a proxy.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyIdentity {
    /// Proxy host name or IP.
    pub host: String,
    /// HTTP port.
    pub port: u16,
    /// Optional basic-auth user.
    pub username: Option<String>,
    /// Optional basic-auth password.
    pub password: Option<String>,
}

impl ProxyIdentity {
    /// Returns the `http://host:port` endpoint without credentials.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Debug for ProxyIdentity {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ProxyIdentity")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Declarative pool selection and quota rules for proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyPoolFilter {
    /// Provider the pool is drawn from.
    pub provider: ProxyProvider,
    /// Network class of the pool.
    pub proxy_type: ProxyType,
    /// Leases allowed before a rotation is required.
    pub max_uses: i64,
}

impl ProxyPoolFilter {
    /// Returns whether the proxy is enabled and belongs to the pool.
    #[must_use]
    pub fn matches_pool(&self, proxy: &Proxy) -> bool {
        proxy.enabled && proxy.provider == self.provider && proxy.proxy_type == self.proxy_type
    }

    /// Returns whether the proxy still has quota for one more lease.
    #[must_use]
    pub fn matches_lease(&self, proxy: &Proxy) -> bool {
        self.matches_pool(proxy) && !proxy.is_rotating && proxy.usage_count < self.max_uses
    }

    /// Returns whether the proxy exhausted its quota and nobody holds it.
    #[must_use]
    pub fn matches_rotation(&self, proxy: &Proxy) -> bool {
        self.matches_pool(proxy)
            && !proxy.is_rotating
            && proxy.usage_count >= self.max_uses
            && proxy.in_use_count == 0
    }
}
