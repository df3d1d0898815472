//! Settings types.
//!
//! Field names serialize as camelCase so the settings file reads
//! `maxPayloadSize`, `setupTimeoutMs`, and so on.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Raw TCP binding.
    pub tcp: BindingSettings,
    /// WebSocket binding.
    pub websocket: BindingSettings,
    /// Per-connection session tuning.
    pub session: SessionSettings,
    /// Reference handler tuning.
    pub handlers: HandlerSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl Default for TetherSettings {
    fn default() -> Self {
        Self {
            tcp: BindingSettings::tcp(),
            websocket: BindingSettings::websocket(),
            session: SessionSettings::default(),
            handlers: HandlerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// One listen endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BindingSettings {
    /// Whether the binding listens at all.
    pub enabled: bool,
    /// Host name or address to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Largest inbound frame accepted, in bytes.
    pub max_payload_size: usize,
    /// How long `start` may take before it is abandoned, in milliseconds.
    pub setup_timeout_ms: u64,
    /// URL path of the upgrade endpoint (WebSocket binding only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Default maximum frame size (`2^24 - 1`).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16_777_215;

/// Default WebSocket upgrade path.
pub const DEFAULT_WEBSOCKET_PATH: &str = "/rsocket";

impl BindingSettings {
    /// Defaults for the raw TCP binding.
    pub fn tcp() -> Self {
        Self {
            port: 7000,
            ..Self::default()
        }
    }

    /// Defaults for the WebSocket binding.
    pub fn websocket() -> Self {
        Self {
            port: 9000,
            path: Some(DEFAULT_WEBSOCKET_PATH.to_string()),
            ..Self::default()
        }
    }

    /// Setup timeout as a [`Duration`].
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    /// Upgrade path, falling back to the default.
    pub fn path_or_default(&self) -> &str {
        self.path.as_deref().unwrap_or(DEFAULT_WEBSOCKET_PATH)
    }

    /// Check values a listener cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("host must not be empty".into()));
        }
        if self.max_payload_size == 0 {
            return Err(SettingsError::InvalidValue(
                "maxPayloadSize must be greater than zero".into(),
            ));
        }
        if self.setup_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "setupTimeoutMs must be greater than zero".into(),
            ));
        }
        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(SettingsError::InvalidValue(format!(
                    "path '{path}' must start with '/'"
                )));
            }
        }
        Ok(())
    }
}

impl Default for BindingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 0,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            setup_timeout_ms: 30_000,
            path: None,
        }
    }
}

/// Per-connection tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Capacity of the outbound frame queue shared by all requests.
    pub outbound_buffer: usize,
    /// Capacity of each channel request's inbound item queue.
    pub inbound_buffer: usize,
    /// How long shutdown waits for in-flight requests before cancelling them.
    pub drain_timeout_ms: u64,
    /// Interval between server keepalive frames.
    pub keepalive_interval_ms: u64,
    /// Silence after which the peer is considered gone.
    pub keepalive_max_lifetime_ms: u64,
}

impl SessionSettings {
    /// Drain timeout as a [`Duration`].
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Keepalive interval as a [`Duration`].
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Keepalive max lifetime as a [`Duration`].
    pub fn keepalive_max_lifetime(&self) -> Duration {
        Duration::from_millis(self.keepalive_max_lifetime_ms)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
            inbound_buffer: 64,
            drain_timeout_ms: 5_000,
            keepalive_interval_ms: 20_000,
            keepalive_max_lifetime_ms: 90_000,
        }
    }
}

/// Reference handler tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandlerSettings {
    /// Simulated processing delay of `request-response`.
    pub response_delay_ms: u64,
    /// Number of items `request-stream` produces.
    pub stream_items: usize,
    /// Interval between `request-stream` items.
    pub stream_interval_ms: u64,
}

impl HandlerSettings {
    /// Response delay as a [`Duration`].
    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.response_delay_ms)
    }

    /// Stream interval as a [`Duration`].
    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            response_delay_ms: 100,
            stream_items: 10,
            stream_interval_ms: 1_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (`RUST_LOG` overrides it).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
