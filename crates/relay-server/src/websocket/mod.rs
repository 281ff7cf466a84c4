//! Connection registry, per-connection sessions, event routing, and the
//! subscribe bridge.

pub mod bridge;
pub mod connection;
pub mod frame;
pub mod hub;
pub mod router;
pub mod session;
