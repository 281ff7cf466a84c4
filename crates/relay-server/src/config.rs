//! Runtime configuration derived from [`RelaySettings`].

use std::time::Duration;

use relay_core::ServerId;
use relay_settings::{OverflowPolicy, RelaySettings};

/// Configuration for one relay instance.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// This instance's id; also the broker channel it subscribes to.
    pub server_id: ServerId,
    /// Per-connection session behavior.
    pub session: SessionConfig,
    /// Deadline for each presence directory or broker call.
    pub call_timeout: Duration,
    /// Largest inbound `WebSocket` message accepted.
    pub max_message_bytes: usize,
}

impl RelayConfig {
    /// Build from loaded settings, generating a server id if none is set.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        let server_id = if settings.server.server_id.is_empty() {
            ServerId::generate()
        } else {
            ServerId::from(settings.server.server_id.as_str())
        };
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            server_id,
            session: SessionConfig {
                read_timeout: Duration::from_millis(settings.session.read_timeout_ms),
                ping_interval: Duration::from_millis(settings.session.ping_interval_ms),
                queue_capacity: settings.session.queue_capacity,
                overflow_policy: settings.session.overflow_policy,
            },
            call_timeout: Duration::from_millis(settings.cluster.call_timeout_ms),
            max_message_bytes: settings.session.max_message_bytes,
        }
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RelayConfig {
    /// Loopback, auto-assigned port, generated id. Suited to tests.
    fn default() -> Self {
        let mut config = Self::from_settings(&RelaySettings::default());
        config.host = "127.0.0.1".into();
        config.port = 0;
        config
    }
}

/// Session timing and queueing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Rolling read deadline.
    pub read_timeout: Duration,
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// Outbound queue capacity.
    pub queue_capacity: usize,
    /// Full-queue behavior.
    pub overflow_policy: OverflowPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        RelayConfig::from_settings(&RelaySettings::default()).session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_default_settings() {
        let cfg = RelayConfig::from_settings(&RelaySettings::default());
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.session.read_timeout, Duration::from_secs(10));
        assert_eq!(cfg.session.ping_interval, Duration::from_secs(9));
        assert_eq!(cfg.session.queue_capacity, 256);
        assert_eq!(cfg.session.overflow_policy, OverflowPolicy::Block);
        assert_eq!(cfg.call_timeout, Duration::from_secs(2));
        assert_eq!(cfg.max_message_bytes, 65_536);
    }

    #[test]
    fn empty_server_id_is_generated() {
        let a = RelayConfig::from_settings(&RelaySettings::default());
        let b = RelayConfig::from_settings(&RelaySettings::default());
        assert!(a.server_id.starts_with("relay_"));
        assert_ne!(a.server_id, b.server_id);
    }

    #[test]
    fn explicit_server_id_kept() {
        let mut settings = RelaySettings::default();
        settings.server.server_id = "serverA".into();
        let cfg = RelayConfig::from_settings(&settings);
        assert_eq!(cfg.server_id.as_str(), "serverA");
    }

    #[test]
    fn default_binds_loopback_auto_port() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn session_config_default_matches_settings() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.queue_capacity, 256);
        assert!(cfg.ping_interval < cfg.read_timeout);
    }
}
