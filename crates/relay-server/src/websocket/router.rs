//! Event routing.
//!
//! A `send_message` event goes straight onto the recipient's queue when the
//! recipient is attached to this instance. Otherwise the presence directory
//! names the owning instance and the payload is published on that instance's
//! broker channel. Every other kind is rejected.

use std::sync::Arc;

use metrics::counter;
use relay_cluster::{Broker, BrokerError, DirectoryError, PresenceDirectory};
use relay_core::{CallContext, Event, EventKind, RemoteDeliveryPayload, ServerId, UserId};
use thiserror::Error;
use tracing::{debug, trace};

use super::connection::{ClientConnection, EnqueueError};
use super::hub::Hub;
use crate::metrics::EVENTS_ROUTED_TOTAL;

/// Where a routed event went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Enqueued on a session attached to this instance.
    Local,
    /// Published to the owning instance's channel.
    Remote {
        /// Owning instance.
        server: ServerId,
    },
}

/// Routing failure. Any of these ends the originating session.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The `type` field is outside the recognized set.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    /// A recognized kind that clients may not route.
    #[error("event type {0} is not routable")]
    Unsupported(EventKind),
    /// Neither this instance nor the directory knows the recipient.
    #[error("recipient {0} not found")]
    RecipientNotFound(UserId),
    /// Directory lookup failed.
    #[error("presence lookup failed: {0}")]
    Directory(#[from] DirectoryError),
    /// Publishing to the owning instance failed.
    #[error("publish to {server} failed: {source}")]
    Publish {
        /// Destination channel.
        server: ServerId,
        /// Broker failure.
        #[source]
        source: BrokerError,
    },
    /// The broker payload could not be serialized.
    #[error("failed to encode broker payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RouteError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownEventType(_) => "unknown_type",
            Self::Unsupported(_) => "unsupported",
            Self::RecipientNotFound(_) => "not_found",
            Self::Directory(_) => "directory",
            Self::Publish { .. } => "publish",
            Self::Encode(_) => "encode",
        }
    }

    /// Whether the client sent something the protocol forbids, as opposed to
    /// an infrastructure or addressing failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::UnknownEventType(_) | Self::Unsupported(_))
    }
}

/// Routes inbound events to local sessions or remote instances.
pub struct EventRouter {
    hub: Arc<Hub>,
    directory: Arc<dyn PresenceDirectory>,
    broker: Arc<dyn Broker>,
}

impl EventRouter {
    /// Create a router over this instance's registry and the shared backends.
    pub fn new(
        hub: Arc<Hub>,
        directory: Arc<dyn PresenceDirectory>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            hub,
            directory,
            broker,
        }
    }

    /// Route one event received from `from`.
    pub async fn route(
        &self,
        event: &Event,
        from: &ClientConnection,
        ctx: &CallContext,
    ) -> Result<Delivery, RouteError> {
        let kind = event
            .kind()
            .map_err(|e| RouteError::UnknownEventType(e.0))?;

        let delivery = match kind {
            EventKind::SendMessage => self.send_message(event, ctx).await?,
            EventKind::NewMessage | EventKind::ChangeRoom => {
                return Err(RouteError::Unsupported(kind));
            }
        };

        let path = match delivery {
            Delivery::Local => "local",
            Delivery::Remote { .. } => "remote",
        };
        counter!(EVENTS_ROUTED_TOTAL, "path" => path).increment(1);
        trace!(from = %from.user_id(), to = %event.to, path, "event routed");
        Ok(delivery)
    }

    async fn send_message(&self, event: &Event, ctx: &CallContext) -> Result<Delivery, RouteError> {
        if let Some(target) = self.hub.lookup(&event.to) {
            deliver_local(&target, event.payload.clone()).await;
            return Ok(Delivery::Local);
        }

        let server = ctx
            .run(self.directory.lookup(&event.to))
            .await?
            .ok_or_else(|| RouteError::RecipientNotFound(event.to.clone()))?;

        // Recipient detached between the registry check and the lookup. Our
        // own bridge delivers if they are back and drops otherwise.
        if &server == self.hub.server_id() {
            debug!(to = %event.to, "presence points at this instance, publishing to own channel");
        }

        let payload = RemoteDeliveryPayload::from_event(event).encode()?;
        let _ = ctx
            .run(self.broker.publish(&server, payload))
            .await
            .map_err(|source| RouteError::Publish {
                server: server.clone(),
                source,
            })?;
        Ok(Delivery::Remote { server })
    }
}

/// Put `message` on a local session's queue.
///
/// A full-queue drop or a closed target is the recipient's problem, not the
/// sender's: it is logged and never becomes a routing error.
pub async fn deliver_local(target: &ClientConnection, message: String) -> bool {
    match target.enqueue(message).await {
        Ok(()) => true,
        Err(EnqueueError::Closed) => {
            debug!(to = %target.user_id(), "target session closed, message discarded");
            false
        }
        Err(e) => {
            debug!(to = %target.user_id(), error = %e, "message not queued");
            false
        }
    }
}
