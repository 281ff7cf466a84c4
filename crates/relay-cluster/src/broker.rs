//! Pub/sub broker addressed by server id.
//!
//! Each relay subscribes to the channel named after its own server id and
//! publishes cross-instance deliveries to the owner's channel. Delivery is
//! at-most-once: a publish to a channel with no live subscriber is lost.

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{trace, warn};

use crate::error::BrokerError;

/// Default per-channel buffer for [`MemoryBroker`].
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Publish/subscribe transport between relay instances.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` on `channel`. Returns how many subscribers received it.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BrokerError>;

    /// Open a subscription on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;
}

/// A live subscription yielding raw message payloads in publish order.
pub struct Subscription {
    channel: String,
    inner: BoxStream<'static, String>,
}

impl Subscription {
    /// Wrap any payload stream as a subscription on `channel`.
    pub fn from_stream(
        channel: impl Into<String>,
        stream: impl futures::Stream<Item = String> + Send + 'static,
    ) -> Self {
        Self {
            channel: channel.into(),
            inner: stream.boxed(),
        }
    }

    /// Channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<String> {
        self.inner.next().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// In-process broker built on `tokio::sync::broadcast`.
///
/// A subscriber that falls more than the channel capacity behind loses the
/// oldest messages; the loss is logged and the stream continues.
#[derive(Debug)]
pub struct MemoryBroker {
    channels: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a broker with [`DEFAULT_CHANNEL_CAPACITY`] per channel.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a broker with a custom per-channel buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of channels currently held open.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |tx| tx.receiver_count())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BrokerError> {
        // Err only means every receiver is gone
        let delivered = match self.channels.get(channel) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            // Receiver count is re-checked under the shard lock
            let pruned = self
                .channels
                .remove_if(channel, |_, tx| tx.receiver_count() == 0)
                .is_some();
            trace!(channel, pruned, "publish with no subscribers");
        } else {
            trace!(channel, delivered, "published");
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let rx = self
            .channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let name = channel.to_owned();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let out = match item {
                Ok(payload) => Some(payload),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(channel = %name, skipped, "subscriber lagged, messages dropped");
                    None
                }
            };
            futures::future::ready(out)
        });
        Ok(Subscription::from_stream(channel, stream))
    }
}
