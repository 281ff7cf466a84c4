//! # relay-node
//!
//! Relay node binary: loads settings, starts one relay instance with its
//! subscribe bridge, and runs until Ctrl-C or SIGTERM.
//!
//! With `cluster.redisUrl` set, presence and pub/sub go through Redis and
//! every node pointed at it forms one relay cluster. Without it the node runs
//! standalone on in-process backends.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_cluster::{
    Broker, MemoryBroker, MemoryDirectory, PresenceDirectory, RedisBroker, RedisDirectory,
};
use relay_core::logging::{LogFormat, init_subscriber};
use relay_server::{RelayConfig, RelayServer};
use relay_settings::{RelaySettings, load_settings_from_path, settings_path};
use tracing::{info, warn};

/// Chat message relay node.
#[derive(Parser, Debug)]
#[command(name = "relay-node", about = "Chat message relay node")]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Instance id and broker channel name.
    #[arg(long)]
    server_id: Option<String>,

    /// Redis URL for the shared presence directory and broker.
    #[arg(long)]
    redis_url: Option<String>,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Apply flags over file and environment settings.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(id) = &self.server_id {
            settings.server.server_id.clone_from(id);
        }
        if let Some(url) = &self.redis_url {
            settings.cluster.redis_url = Some(url.clone());
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

/// Defaults → file → `RELAY_*` env → CLI flags.
fn load(cli: &Cli) -> Result<RelaySettings> {
    let path = cli.config.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    init_subscriber(
        &settings.logging.level,
        LogFormat::from_json_flag(settings.logging.json),
    );

    let metrics = relay_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let (directory, broker) = cluster_backends(settings.cluster.redis_url.as_deref()).await?;
    let config = RelayConfig::from_settings(&settings);
    let server = RelayServer::new(config, directory, broker).with_metrics(metrics);

    let running = server.listen().await.context("Failed to start relay")?;
    info!(
        addr = %running.local_addr(),
        server_id = %server.server_id(),
        "relay node listening on ws://{}/api/v1/ws",
        running.local_addr()
    );

    shutdown_signal().await?;

    server.shutdown_gracefully(running, None).await;
    info!("shutdown complete");
    Ok(())
}

/// Redis backends when a URL is configured, in-process ones otherwise.
async fn cluster_backends(
    redis_url: Option<&str>,
) -> Result<(Arc<dyn PresenceDirectory>, Arc<dyn Broker>)> {
    let Some(url) = redis_url else {
        warn!("cluster.redisUrl not set, cross-instance delivery limited to this process");
        return Ok((Arc::new(MemoryDirectory::new()), Arc::new(MemoryBroker::new())));
    };
    let directory = RedisDirectory::connect(url)
        .await
        .context("Failed to connect presence directory to redis")?;
    let broker = RedisBroker::connect(url)
        .await
        .context("Failed to connect broker to redis")?;
    info!("cluster backends connected to redis");
    Ok((Arc::new(directory), Arc::new(broker)))
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = term.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_settings::OverflowPolicy;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["relay-node"]);
        let mut settings = RelaySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings, RelaySettings::default());
    }

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from([
            "relay-node",
            "--host",
            "127.0.0.1",
            "--port",
            "7000",
            "--server-id",
            "serverA",
            "--redis-url",
            "redis://cache:6379",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        let mut settings = RelaySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 7000);
        assert_eq!(settings.server.server_id, "serverA");
        assert_eq!(settings.cluster.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[tokio::test]
    async fn no_redis_url_uses_in_process_backends() {
        let (directory, broker) = cluster_backends(None).await.unwrap();
        directory.set(&"alice".into(), &"S1".into()).await.unwrap();
        assert_eq!(
            directory.lookup(&"alice".into()).await.unwrap().as_deref(),
            Some("S1")
        );
        assert_eq!(broker.publish("S1", "x".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bad_redis_url_fails_startup() {
        let err = cluster_backends(Some("not a url")).await.err().unwrap();
        assert!(format!("{err:#}").contains("presence directory"));
    }

    #[test]
    fn load_merges_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server":{"port":6100,"serverId":"fromFile"},"session":{"overflowPolicy":"drop"}}"#,
        )
        .unwrap();

        let cli = Cli::parse_from([
            "relay-node",
            "--config",
            path.to_str().unwrap(),
            "--server-id",
            "fromFlag",
        ]);
        let settings = load(&cli).unwrap();
        assert_eq!(settings.server.server_id, "fromFlag");
        assert_eq!(settings.session.overflow_policy, OverflowPolicy::Drop);
    }

    #[test]
    fn load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"session":{"pingIntervalMs":20000}}"#).unwrap();

        let cli = Cli::parse_from(["relay-node", "--config", path.to_str().unwrap()]);
        let err = load(&cli).unwrap_err();
        assert!(format!("{err:#}").contains("pingIntervalMs"));
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let cli = Cli::parse_from(["relay-node", "--config", path.to_str().unwrap()]);
        let settings = load(&cli).unwrap();
        assert_eq!(settings.session.queue_capacity, 256);
    }
}
