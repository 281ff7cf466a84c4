//! Explicit context for calls into external stores.
//!
//! Presence directory and broker calls never run under an ambient default
//! context. Each call gets a [`CallContext`] derived from whoever owns the
//! work (a session, the subscribe bridge, the server), carrying a deadline
//! and a cancellation token. Cancelling the owner's token aborts in-flight
//! calls at their next suspension point.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a context-bound call did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    /// The deadline elapsed first.
    #[error("call timed out after {0:?}")]
    TimedOut(Duration),
    /// The owning task was cancelled.
    #[error("call cancelled")]
    Cancelled,
}

/// Deadline + cancellation for one or more external calls.
#[derive(Debug, Clone)]
pub struct CallContext {
    timeout: Duration,
    cancel: CancellationToken,
}

impl CallContext {
    /// Create a context with the given per-call timeout and cancellation token.
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    /// Context with a timeout and a token that is never cancelled.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(timeout, CancellationToken::new())
    }

    /// Per-call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cancellation token observed by calls in this context.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the owner has already been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a fallible call under this context.
    ///
    /// The call's own error type absorbs [`Interrupted`], so callers see a
    /// single error channel.
    pub async fn run<T, E, F>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<Interrupted>,
    {
        if self.cancel.is_cancelled() {
            return Err(Interrupted::Cancelled.into());
        }
        tokio::select! {
            () = self.cancel.cancelled() => Err(Interrupted::Cancelled.into()),
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(Interrupted::TimedOut(self.timeout).into()),
            },
        }
    }
}
