use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::warn;

use crate::crypto::KeyMaterial;
use crate::session::keepalive::{DEFAULT_KEEPALIVE_INTERVAL, MIN_RECOMMENDED_INTERVAL};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1_000);

/// Error produced when client configuration fails validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("device address must not be empty")]
    MissingAddress,
    #[error("invalid device address: {0}")]
    InvalidAddress(String),
    #[error("invalid API key: {0}")]
    InvalidKey(String),
    #[error("keepalive interval must be greater than zero")]
    ZeroKeepaliveInterval,
    #[error("config json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Connection settings for one device, as entered by the user.
///
/// The secret and auth keys are the 64-character hex strings the Remootio app
/// shows when the websocket API is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub secret_key: String,
    pub auth_key: String,
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_delay_ms: u64,
    /// Send `AUTH` as soon as each connection opens.
    #[serde(default = "default_true")]
    pub authenticate_on_connect: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_keepalive_ms() -> u64 {
    saturating_millis(DEFAULT_KEEPALIVE_INTERVAL)
}

fn default_reconnect_ms() -> u64 {
    saturating_millis(DEFAULT_RECONNECT_DELAY)
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_true() -> bool {
    true
}

impl ClientConfig {
    pub fn new(
        address: impl Into<String>,
        secret_key: impl Into<String>,
        auth_key: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            port: DEFAULT_PORT,
            secret_key: secret_key.into(),
            auth_key: auth_key.into(),
            keepalive_interval_ms: default_keepalive_ms(),
            reconnect_delay_ms: default_reconnect_ms(),
            authenticate_on_connect: true,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = saturating_millis(interval);
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = saturating_millis(delay);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_authenticate_on_connect(mut self, enabled: bool) -> Self {
        self.authenticate_on_connect = enabled;
        self
    }

    /// Validates the settings and parses the key material.
    ///
    /// # Guarantees
    /// * Both keys decode to 256-bit values or compilation fails.
    /// * The websocket URL is `ws://<address>:<port>/`.
    /// * Keepalive intervals under ten seconds are accepted with a warning.
    pub fn compile(self) -> Result<CompiledClientConfig, ConfigError> {
        let address = self.address.trim();
        if address.is_empty() {
            return Err(ConfigError::MissingAddress);
        }
        let url = format!("ws://{}:{}/", address, self.port);
        url.as_str()
            .into_client_request()
            .map_err(|e| ConfigError::InvalidAddress(format!("{address}: {e}")))?;
        let keys = KeyMaterial::from_hex(&self.secret_key, &self.auth_key)
            .map_err(|e| ConfigError::InvalidKey(e.to_string()))?;

        if self.keepalive_interval_ms == 0 {
            return Err(ConfigError::ZeroKeepaliveInterval);
        }
        let keepalive_interval = Duration::from_millis(self.keepalive_interval_ms);
        if keepalive_interval < MIN_RECOMMENDED_INTERVAL {
            warn!(
                interval_ms = self.keepalive_interval_ms,
                "keepalive interval below 10s is not recommended"
            );
        }

        Ok(CompiledClientConfig {
            url,
            keys,
            keepalive_interval,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            authenticate_on_connect: self.authenticate_on_connect,
        })
    }
}

/// Validated configuration consumed by [`crate::sdk::RemootioClient`].
#[derive(Debug, Clone)]
pub struct CompiledClientConfig {
    url: String,
    keys: KeyMaterial,
    keepalive_interval: Duration,
    reconnect_delay: Duration,
    authenticate_on_connect: bool,
}

impl CompiledClientConfig {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn authenticate_on_connect(&self) -> bool {
        self.authenticate_on_connect
    }
}
