//! `RelayServer`: Axum HTTP + `WebSocket` server for one relay instance.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use relay_cluster::{Broker, PresenceDirectory};
use relay_core::{ServerId, UserId};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::RelayConfig;
use crate::error::ServerError;
use crate::health::{self, HealthResponse};
use crate::shutdown::{DEFAULT_DRAIN_GRACE, ShutdownCoordinator};
use crate::websocket::bridge::SubscribeBridge;
use crate::websocket::frame::Frame;
use crate::websocket::hub::Hub;
use crate::websocket::router::EventRouter;
use crate::websocket::session::{SessionDeps, run_session};

/// Upgrade endpoint path.
pub const WS_PATH: &str = "/api/v1/ws";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Dependencies handed to every new session.
    pub session: SessionDeps,
    /// This instance's id.
    pub server_id: ServerId,
    /// Largest inbound `WebSocket` message.
    pub max_message_bytes: usize,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// One relay instance.
pub struct RelayServer {
    config: RelayConfig,
    hub: Arc<Hub>,
    router: Arc<EventRouter>,
    bridge: Arc<SubscribeBridge>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl RelayServer {
    /// Create an instance over the given shared backends.
    pub fn new(
        config: RelayConfig,
        directory: Arc<dyn PresenceDirectory>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let hub = Arc::new(Hub::new(config.server_id.clone(), directory.clone()));
        let router = Arc::new(EventRouter::new(hub.clone(), directory, broker.clone()));
        let bridge = Arc::new(SubscribeBridge::new(hub.clone(), broker, config.call_timeout));
        Self {
            config,
            hub,
            router,
            bridge,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from this handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            session: SessionDeps {
                hub: self.hub.clone(),
                router: self.router.clone(),
                config: self.config.session,
                call_timeout: self.config.call_timeout,
                shutdown: self.shutdown.token(),
            },
            server_id: self.config.server_id.clone(),
            max_message_bytes: self.config.max_message_bytes,
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(WS_PATH, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind, start the subscribe bridge, and serve on a background task.
    pub async fn listen(&self) -> Result<RunningServer, ServerError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let bridge = self.bridge.clone().start(self.shutdown.token()).await?;

        let app = self.router();
        let token = self.shutdown.token();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "http server failed");
            }
        });

        info!(%local_addr, server_id = %self.config.server_id, "relay listening");
        Ok(RunningServer {
            local_addr,
            tasks: vec![server, bridge],
        })
    }

    /// Close every session, stop the bridge and listener, and wait up to
    /// `timeout` (default [`DEFAULT_DRAIN_GRACE`]) for background tasks.
    pub async fn shutdown_gracefully(&self, running: RunningServer, timeout: Option<Duration>) {
        info!(server_id = %self.config.server_id, "shutting down");
        let grace = timeout.unwrap_or(DEFAULT_DRAIN_GRACE);
        let _ = self.shutdown.drain(&self.hub, running.tasks, grace).await;
    }

    /// Connection registry.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// This instance's id.
    pub fn server_id(&self) -> &ServerId {
        &self.config.server_id
    }
}

/// Handle to a listening instance.
#[derive(Debug)]
pub struct RunningServer {
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Address actually bound (resolves port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    user_id: Option<String>,
}

/// GET /api/v1/ws?user_id=<id>
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(user_id) = params.user_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing user_id").into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let deps = state.session;
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            let stream = stream.map(|msg| msg.map(Frame::from));
            let sink = sink.with(|frame: Frame| {
                futures::future::ready(Ok::<_, axum::Error>(Message::from(frame)))
            });
            let _ = run_session(stream, sink, UserId::from(user_id), deps).await;
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.session.hub.len();
    Json(health::health_check(
        state.start_time,
        state.server_id.as_str(),
        connections,
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
