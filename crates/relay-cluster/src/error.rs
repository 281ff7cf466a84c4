//! Directory and broker error types.

use std::time::Duration;

use relay_core::Interrupted;
use thiserror::Error;

/// Presence directory failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// The backing store rejected or could not serve the request.
    #[error("presence directory unavailable: {0}")]
    Unavailable(String),
    /// The call exceeded its deadline.
    #[error("presence directory call timed out after {0:?}")]
    TimedOut(Duration),
    /// The owning task was cancelled mid-call.
    #[error("presence directory call cancelled")]
    Cancelled,
}

impl From<Interrupted> for DirectoryError {
    fn from(i: Interrupted) -> Self {
        match i {
            Interrupted::TimedOut(d) => Self::TimedOut(d),
            Interrupted::Cancelled => Self::Cancelled,
        }
    }
}

/// Broker failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker could not accept the publish or subscribe.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// The call exceeded its deadline.
    #[error("broker call timed out after {0:?}")]
    TimedOut(Duration),
    /// The owning task was cancelled mid-call.
    #[error("broker call cancelled")]
    Cancelled,
}

impl From<Interrupted> for BrokerError {
    fn from(i: Interrupted) -> Self {
        match i {
            Interrupted::TimedOut(d) => Self::TimedOut(d),
            Interrupted::Cancelled => Self::Cancelled,
        }
    }
}
