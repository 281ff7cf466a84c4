//! Server startup errors.

use relay_cluster::BrokerError;
use thiserror::Error;

/// Failure to bring a relay instance up.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// Other socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The instance could not subscribe to its own broker channel.
    #[error("broker subscribe failed: {0}")]
    Subscribe(#[from] BrokerError),
    /// A global metrics recorder is already installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}
