//! # relay-server
//!
//! Axum `WebSocket` chat relay.
//!
//! - [`websocket::hub::Hub`]: per-instance registry of attached sessions
//! - [`websocket::session`]: read loop + write loop per connection
//! - [`websocket::router::EventRouter`]: local delivery or directory lookup + publish
//! - [`websocket::bridge::SubscribeBridge`]: redelivers broker messages to local sessions
//! - HTTP endpoints: `/api/v1/ws`, `/health`, `/metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::{RelayConfig, SessionConfig};
pub use error::ServerError;
pub use server::{RelayServer, RunningServer};
pub use shutdown::ShutdownCoordinator;
