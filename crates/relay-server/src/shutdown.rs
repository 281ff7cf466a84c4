//! Instance drain.
//!
//! Session tokens and the subscribe bridge all hang off one root token.
//! Draining closes the attached sessions (each write loop sends a close
//! frame), cancels the root, which stops the bridge and the listener, and
//! gives the background tasks a bounded grace period before aborting them.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::websocket::hub::Hub;

/// Grace period used when the caller does not pick one.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Owns the instance's root cancellation token.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator with a fresh root token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Root token. Sessions derive child tokens from it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether a drain has started.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close every session on `hub`, cancel the root token, then wait up to
    /// `grace` for `tasks`. Tasks still running afterwards are aborted.
    ///
    /// Returns how many tasks had to be aborted.
    pub async fn drain(&self, hub: &Hub, tasks: Vec<JoinHandle<()>>, grace: Duration) -> usize {
        hub.close_all();
        self.token.cancel();
        info!(tasks = tasks.len(), ?grace, "draining instance");

        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(aborted, ?grace, "tasks outlived the grace period and were aborted");
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use relay_cluster::MemoryDirectory;
    use relay_core::CallContext;
    use relay_settings::OverflowPolicy;

    use crate::websocket::connection::ClientConnection;

    fn hub() -> Hub {
        Hub::new("S1".into(), Arc::new(MemoryDirectory::new()))
    }

    #[tokio::test]
    async fn drain_closes_sessions_and_cancels_root() {
        let coord = ShutdownCoordinator::new();
        let hub = hub();
        let (conn, _rx) =
            ClientConnection::channel("alice".into(), 1, OverflowPolicy::Block, CancellationToken::new());
        hub.register(conn.clone(), &CallContext::with_timeout(Duration::from_secs(1)))
            .await;

        let token = coord.token();
        let bridge = tokio::spawn(async move { token.cancelled().await });

        assert!(!coord.is_shutting_down());
        let aborted = coord.drain(&hub, vec![bridge], DEFAULT_DRAIN_GRACE).await;
        assert_eq!(aborted, 0);
        assert!(coord.is_shutting_down());
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_aborts_tasks_past_grace() {
        let coord = ShutdownCoordinator::new();
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });
        let prompt = tokio::spawn(async {});

        let aborted = coord
            .drain(&hub(), vec![stuck, prompt], Duration::from_millis(100))
            .await;
        assert_eq!(aborted, 1);
    }

    #[tokio::test]
    async fn drain_twice_is_harmless() {
        let coord = ShutdownCoordinator::new();
        let hub = hub();
        assert_eq!(coord.drain(&hub, Vec::new(), DEFAULT_DRAIN_GRACE).await, 0);
        assert_eq!(coord.drain(&hub, Vec::new(), DEFAULT_DRAIN_GRACE).await, 0);
        assert!(coord.token().is_cancelled());
    }
}
