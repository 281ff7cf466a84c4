//! Per-connection session state shared between the read loop, the write
//! loop, the registry, and whoever delivers to the session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use metrics::counter;
use relay_core::UserId;
use relay_settings::OverflowPolicy;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;
use uuid::Uuid;

use crate::metrics::QUEUE_OVERFLOW_TOTAL;

/// Why a frame did not make it onto a session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// The session is closing or closed.
    #[error("session closed")]
    Closed,
    /// Queue full under the `drop` policy; the frame was discarded.
    #[error("outbound queue full, frame dropped")]
    Dropped,
    /// Queue full under the `disconnect` policy; the session was closed.
    #[error("outbound queue full, session disconnected")]
    Disconnected,
}

/// A connected client.
///
/// The outbound queue is a bounded mpsc channel whose single consumer is the
/// session's write loop. Closing the connection cancels its token, which
/// wakes both loops.
pub struct ClientConnection {
    /// Unique connection id, distinct across reconnects of the same user.
    pub id: String,
    user_id: UserId,
    tx: mpsc::Sender<String>,
    policy: OverflowPolicy,
    close: CancellationToken,
    torn_down: AtomicBool,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a connection around an existing queue sender.
    pub fn new(
        user_id: UserId,
        tx: mpsc::Sender<String>,
        policy: OverflowPolicy,
        close: CancellationToken,
    ) -> Self {
        Self {
            id: format!("conn_{}", Uuid::now_v7()),
            user_id,
            tx,
            policy,
            close,
            torn_down: AtomicBool::new(false),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Create a connection and its outbound queue.
    pub fn channel(
        user_id: UserId,
        capacity: usize,
        policy: OverflowPolicy,
        close: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(user_id, tx, policy, close)), rx)
    }

    /// User this connection belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Put a serialized frame on the outbound queue.
    ///
    /// When the queue has room this never waits. When it is full the
    /// configured [`OverflowPolicy`] decides: `Block` waits for space (or for
    /// the session to close), `Drop` discards, `Disconnect` closes the session.
    pub async fn enqueue(&self, frame: String) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        let frame = match self.tx.try_send(frame) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(EnqueueError::Closed),
            Err(TrySendError::Full(frame)) => frame,
        };

        counter!(QUEUE_OVERFLOW_TOTAL, "policy" => self.policy.as_str()).increment(1);
        match self.policy {
            OverflowPolicy::Block => {
                tokio::select! {
                    biased;
                    () = self.close.cancelled() => Err(EnqueueError::Closed),
                    res = self.tx.send(frame) => res.map_err(|_| EnqueueError::Closed),
                }
            }
            OverflowPolicy::Drop => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::Dropped)
            }
            OverflowPolicy::Disconnect => {
                warn!(user_id = %self.user_id, conn_id = %self.id, "outbound queue full, disconnecting slow consumer");
                self.close();
                Err(EnqueueError::Disconnected)
            }
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Whether [`close`](Self::close) has been called (directly or via shutdown).
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close.cancelled()
    }

    /// Claim the teardown. Returns `true` for exactly one caller.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    /// Frames discarded under the `drop` policy.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("policy", &self.policy)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
