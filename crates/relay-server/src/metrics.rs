//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::error::ServerError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if another recorder
/// was installed first.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Sessions opened (counter).
pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
/// Sessions closed (counter).
pub const DISCONNECTIONS_TOTAL: &str = "relay_disconnections_total";
/// Sessions currently open (gauge).
pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Events delivered by the router (counter, labels: path).
pub const EVENTS_ROUTED_TOTAL: &str = "relay_events_routed_total";
/// Routing failures (counter, labels: kind).
pub const ROUTE_ERRORS_TOTAL: &str = "relay_route_errors_total";
/// Inbound frames that failed to decode (counter).
pub const DECODE_ERRORS_TOTAL: &str = "relay_decode_errors_total";
/// Broker messages handed to a local session (counter).
pub const BRIDGE_DELIVERIES_TOTAL: &str = "relay_bridge_deliveries_total";
/// Broker messages discarded by the bridge (counter, labels: reason).
pub const BRIDGE_DROPPED_TOTAL: &str = "relay_bridge_dropped_total";
/// Full-queue events (counter, labels: policy).
pub const QUEUE_OVERFLOW_TOTAL: &str = "relay_queue_overflow_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            CONNECTIONS_TOTAL,
            DISCONNECTIONS_TOTAL,
            CONNECTIONS_ACTIVE,
            EVENTS_ROUTED_TOTAL,
            ROUTE_ERRORS_TOTAL,
            DECODE_ERRORS_TOTAL,
            BRIDGE_DELIVERIES_TOTAL,
            BRIDGE_DROPPED_TOTAL,
            QUEUE_OVERFLOW_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("relay_"), "{name} lacks relay_ prefix");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
