//! Connection and server configuration
//!
//! Both configs load from JSON files with camelCase keys; durations are written
//! as milliseconds.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, path::Path, sync::Arc, time::Duration};
use url::Url;

use crate::{
    error::{ConfigError, Error},
    transport::TransportKind,
    types::Capabilities,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1_000);
const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_millis(30_000);
const DEFAULT_RPC_PATH: &str = "/rpc";
const DEFAULT_HEALTH_PATH: &str = "/health";

/// Adds authentication material to outgoing request headers
///
/// Credential storage and refresh live outside this crate; an injector is only
/// asked to decorate headers right before they are sent.
pub trait CredentialInjector: Send + Sync {
    fn inject(&self, headers: &mut HashMap<String, String>);
}

/// Injects a fixed `Authorization: Bearer` header
#[derive(Clone)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl CredentialInjector for BearerToken {
    fn inject(&self, headers: &mut HashMap<String, String>) {
        headers.insert("Authorization".to_string(), format!("Bearer {}", self.0));
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_reconnect_delay() -> Duration {
    DEFAULT_RECONNECT_DELAY
}

fn default_max_reconnect_delay() -> Duration {
    DEFAULT_MAX_RECONNECT_DELAY
}

fn default_rpc_path() -> String {
    DEFAULT_RPC_PATH.to_string()
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_PATH.to_string()
}

fn default_true() -> bool {
    true
}

/// Everything a client needs to reach a server
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Server URL; the scheme picks the transport
    pub url: Url,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-request timeout
    #[serde(rename = "timeoutMs", with = "millis", default = "default_timeout")]
    pub timeout: Duration,
    /// Reconnect attempts before giving up; zero disables automatic reconnection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay of the reconnect backoff
    #[serde(
        rename = "reconnectDelayMs",
        with = "millis",
        default = "default_reconnect_delay"
    )]
    pub reconnect_delay: Duration,
    /// Upper bound of the reconnect backoff
    #[serde(
        rename = "maxReconnectDelayMs",
        with = "millis",
        default = "default_max_reconnect_delay"
    )]
    pub max_reconnect_delay: Duration,
    /// Request path used when the URL has none
    #[serde(default = "default_rpc_path")]
    pub rpc_path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Probe the health endpoint when a request transport connects
    #[serde(default = "default_true")]
    pub health_check: bool,
    #[serde(skip)]
    pub credentials: Option<Arc<dyn CredentialInjector>>,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &self.url.as_str())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("max_reconnect_delay", &self.max_reconnect_delay)
            .field("rpc_path", &self.rpc_path)
            .field("credentials", &self.credentials.is_some())
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            rpc_path: default_rpc_path(),
            health_path: default_health_path(),
            health_check: true,
            credentials: None,
        }
    }

    /// Parses `url` and applies the defaults
    pub fn parse(url: &str) -> Result<Self, Error> {
        let url = Url::parse(url).map_err(|e| ConfigError::Invalid {
            message: format!("invalid url `{url}`: {e}"),
        })?;
        Ok(Self::new(url))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_reconnect_delay(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_delay = base;
        self.max_reconnect_delay = max;
        self
    }

    pub fn with_rpc_path(mut self, path: impl Into<String>) -> Self {
        self.rpc_path = path.into();
        self
    }

    pub fn with_health_check(mut self, enabled: bool) -> Self {
        self.health_check = enabled;
        self
    }

    pub fn with_credentials<C: CredentialInjector + 'static>(mut self, credentials: C) -> Self {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Binding implied by the URL scheme, for the built-in schemes
    pub fn transport_kind(&self) -> Option<TransportKind> {
        match self.scheme() {
            "http" | "https" => Some(TransportKind::Request),
            "ws" | "wss" => Some(TransportKind::Stream),
            _ => None,
        }
    }

    /// Static headers with credentials applied on top
    pub fn resolved_headers(&self) -> HashMap<String, String> {
        let mut headers = self.headers.clone();
        if let Some(credentials) = &self.credentials {
            credentials.inject(&mut headers);
        }
        headers
    }

    /// Delay before reconnect attempt `attempt` (1-based): doubles each time, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                message: "timeoutMs must be greater than zero".to_string(),
            });
        }
        if self.max_reconnect_delay < self.reconnect_delay {
            return Err(ConfigError::Invalid {
                message: "maxReconnectDelayMs must not be below reconnectDelayMs".to_string(),
            });
        }
        if !self.rpc_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                message: format!("rpcPath must start with '/': {}", self.rpc_path),
            });
        }
        if self.transport_kind().is_none() {
            return Err(ConfigError::Invalid {
                message: format!("unsupported url scheme: {}", self.scheme()),
            });
        }
        if self.url.cannot_be_a_base() {
            return Err(ConfigError::Invalid {
                message: format!("url has no host: {}", self.url),
            });
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }
}

/// Server identity plus listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Address of the HTTP listener, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_addr: Option<String>,
    /// Address of the WebSocket listener, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_addr: Option<String>,
    #[serde(default = "default_rpc_path")]
    pub rpc_path: String,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            http_addr: None,
            ws_addr: None,
            rpc_path: default_rpc_path(),
            capabilities: Capabilities::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "server name must not be empty".to_string(),
            });
        }
        if self.http_addr.is_none() && self.ws_addr.is_none() {
            return Err(ConfigError::Invalid {
                message: "at least one of httpAddr and wsAddr must be set".to_string(),
            });
        }
        if !self.rpc_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                message: format!("rpcPath must start with '/': {}", self.rpc_path),
            });
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
