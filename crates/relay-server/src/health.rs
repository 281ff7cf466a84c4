//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// This instance's id.
    pub server_id: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Sessions currently attached to the registry.
    pub connections: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, server_id: &str, connections: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        server_id: server_id.to_owned(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
    }
}
