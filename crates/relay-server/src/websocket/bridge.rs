//! Subscribe bridge: the receiving half of cross-instance delivery.
//!
//! Consumes this instance's broker channel and hands each payload to the
//! addressed local session, exactly like local delivery. A payload for a user
//! who has since left is dropped without error.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use relay_cluster::{Broker, BrokerError, Subscription};
use relay_core::{CallContext, RemoteDeliveryPayload};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::hub::Hub;
use super::router::deliver_local;
use crate::metrics::{BRIDGE_DELIVERIES_TOTAL, BRIDGE_DROPPED_TOTAL};

/// Outcome of handling one broker message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Enqueued on a local session.
    Delivered,
    /// Addressed to a user not attached here.
    NoRecipient,
    /// Recipient present but the frame was not queued (closed or overflow).
    NotQueued,
    /// Not a valid delivery payload.
    Malformed,
}

/// Per-instance consumer of the broker channel named after the server id.
pub struct SubscribeBridge {
    hub: Arc<Hub>,
    broker: Arc<dyn Broker>,
    call_timeout: Duration,
}

impl SubscribeBridge {
    /// Create a bridge delivering into `hub`.
    pub fn new(hub: Arc<Hub>, broker: Arc<dyn Broker>, call_timeout: Duration) -> Self {
        Self {
            hub,
            broker,
            call_timeout,
        }
    }

    /// Subscribe to this instance's channel.
    pub async fn subscribe(&self, cancel: &CancellationToken) -> Result<Subscription, BrokerError> {
        let ctx = CallContext::new(self.call_timeout, cancel.clone());
        ctx.run(self.broker.subscribe(self.hub.server_id())).await
    }

    /// Subscribe, then consume on a background task until `cancel` fires or
    /// the subscription ends.
    ///
    /// The subscription is live when this returns, so anything published
    /// afterwards reaches the bridge.
    pub async fn start(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, BrokerError> {
        let sub = self.subscribe(&cancel).await?;
        let span = info_span!("subscribe_bridge", server_id = %self.hub.server_id());
        Ok(tokio::spawn(
            async move { self.run(sub, cancel).await }.instrument(span),
        ))
    }

    /// Consume `sub` until cancelled or exhausted.
    pub async fn run(&self, mut sub: Subscription, cancel: CancellationToken) {
        info!(channel = sub.channel(), "subscribe bridge started");
        loop {
            let raw = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("subscribe bridge cancelled");
                    break;
                }
                msg = sub.next() => match msg {
                    Some(raw) => raw,
                    None => {
                        warn!("broker subscription ended");
                        break;
                    }
                },
            };
            let _ = self.dispatch(&raw).await;
        }
    }

    /// Decode one broker message and deliver it locally.
    pub async fn dispatch(&self, raw: &str) -> BridgeOutcome {
        let payload = match RemoteDeliveryPayload::decode(raw) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed broker message, skipping");
                counter!(BRIDGE_DROPPED_TOTAL, "reason" => "malformed").increment(1);
                return BridgeOutcome::Malformed;
            }
        };

        let Some(target) = self.hub.lookup(&payload.to) else {
            debug!(to = %payload.to, "recipient not attached, dropping");
            counter!(BRIDGE_DROPPED_TOTAL, "reason" => "no_recipient").increment(1);
            return BridgeOutcome::NoRecipient;
        };

        if deliver_local(&target, payload.message).await {
            counter!(BRIDGE_DELIVERIES_TOTAL).increment(1);
            BridgeOutcome::Delivered
        } else {
            counter!(BRIDGE_DROPPED_TOTAL, "reason" => "not_queued").increment(1);
            BridgeOutcome::NotQueued
        }
    }
}
