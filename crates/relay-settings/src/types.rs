//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a settings file only needs the
//! keys it wants to change. Keys are camelCase on disk.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Listener and instance identity.
    pub server: ServerSettings,
    /// Per-connection session behavior.
    pub session: SessionSettings,
    /// Presence directory and broker calls.
    pub cluster: ClusterSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.session.queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "session.queueCapacity must be at least 1".into(),
            ));
        }
        if self.session.read_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "session.readTimeoutMs must be positive".into(),
            ));
        }
        if self.session.ping_interval_ms == 0
            || self.session.ping_interval_ms >= self.session.read_timeout_ms
        {
            return Err(SettingsError::InvalidValue(format!(
                "session.pingIntervalMs ({}) must be positive and below session.readTimeoutMs ({})",
                self.session.ping_interval_ms, self.session.read_timeout_ms
            )));
        }
        if self.cluster.call_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "cluster.callTimeoutMs must be positive".into(),
            ));
        }
        if let Some(url) = &self.cluster.redis_url {
            const SCHEMES: [&str; 3] = ["redis://", "rediss://", "redis+unix://"];
            if !SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                return Err(SettingsError::InvalidValue(format!(
                    "cluster.redisUrl must start with redis://, rediss:// or redis+unix:// (got {url})"
                )));
            }
        }
        Ok(())
    }
}

/// Listener and instance identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` for auto-assign).
    pub port: u16,
    /// Instance identifier and broker channel name. Empty means generate one
    /// at startup.
    pub server_id: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            server_id: String::new(),
        }
    }
}

/// What to do when a recipient's outbound queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for space, stalling the sender's read loop.
    #[default]
    Block,
    /// Discard the frame and count the drop.
    Drop,
    /// Close the slow recipient's session.
    Disconnect,
}

impl OverflowPolicy {
    /// Lowercase name, as used on disk and in metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Drop => "drop",
            Self::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop" => Ok(Self::Drop),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(SettingsError::InvalidValue(format!(
                "unknown overflow policy: {other}"
            ))),
        }
    }
}

/// Per-connection session behavior.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Rolling read deadline in milliseconds. Any inbound frame, including a
    /// keepalive acknowledgement, pushes it forward.
    pub read_timeout_ms: u64,
    /// Interval between server pings. Must be below `read_timeout_ms`.
    pub ping_interval_ms: u64,
    /// Outbound queue capacity per session.
    pub queue_capacity: usize,
    /// Full-queue behavior.
    pub overflow_policy: OverflowPolicy,
    /// Largest inbound message accepted by the transport.
    pub max_message_bytes: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10_000,
            ping_interval_ms: 9_000,
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::Block,
            max_message_bytes: 64 * 1024,
        }
    }
}

/// Presence directory and broker call settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    /// Deadline for a single directory or broker call, in milliseconds.
    pub call_timeout_ms: u64,
    /// Shared Redis for presence and pub/sub. Unset means in-process
    /// backends, which only reach instances inside the same process.
    pub redis_url: Option<String>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: 2_000,
            redis_url: None,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
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
