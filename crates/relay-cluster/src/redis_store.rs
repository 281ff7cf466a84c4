//! Redis-backed presence directory and broker.
//!
//! Every relay pointed at the same Redis shares presence data and can reach
//! every other relay. Presence entries are plain string keys
//! (`user:<id>` → server id) with no expiry. Deliveries use Redis pub/sub on
//! the channel named after the owning server id.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, Script};
use relay_core::{ServerId, UserId, presence_key};
use tracing::{debug, trace, warn};

use crate::broker::{Broker, Subscription};
use crate::directory::PresenceDirectory;
use crate::error::{BrokerError, DirectoryError};

/// Delete `KEYS[1]` only while it still holds `ARGV[1]`.
const REMOVE_IF_OWNER: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

fn directory_error(e: RedisError) -> DirectoryError {
    DirectoryError::Unavailable(e.to_string())
}

fn broker_error(e: RedisError) -> BrokerError {
    BrokerError::Unavailable(e.to_string())
}

/// Presence directory stored in Redis.
///
/// Holds one multiplexed connection; calls clone the handle and pipeline over
/// the same socket.
pub struct RedisDirectory {
    conn: MultiplexedConnection,
    remove_if_owner: Script,
}

impl RedisDirectory {
    /// Connect to the Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self, DirectoryError> {
        let client = Client::open(url).map_err(directory_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(directory_error)?;
        debug!("presence directory connected to redis");
        Ok(Self {
            conn,
            remove_if_owner: Script::new(REMOVE_IF_OWNER),
        })
    }
}

impl std::fmt::Debug for RedisDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDirectory").finish_non_exhaustive()
    }
}

#[async_trait]
impl PresenceDirectory for RedisDirectory {
    async fn set(&self, user: &UserId, server: &ServerId) -> Result<(), DirectoryError> {
        let key = presence_key(user);
        trace!(key, %server, "presence set");
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, server.as_str())
            .await
            .map_err(directory_error)
    }

    async fn lookup(&self, user: &UserId) -> Result<Option<ServerId>, DirectoryError> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = conn
            .get(presence_key(user))
            .await
            .map_err(directory_error)?;
        Ok(owner.map(ServerId::from))
    }

    async fn remove(&self, user: &UserId, owner: &ServerId) -> Result<bool, DirectoryError> {
        let key = presence_key(user);
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .remove_if_owner
            .key(key.as_str())
            .arg(owner.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(directory_error)?;
        trace!(key, %owner, removed = deleted > 0, "presence remove");
        Ok(deleted > 0)
    }
}

/// Pub/sub broker over Redis.
///
/// Publishes share one multiplexed connection. Each subscription opens its
/// own pub/sub connection, which closes when the [`Subscription`] is dropped.
pub struct RedisBroker {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisBroker {
    /// Connect to the Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(broker_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(broker_error)?;
        debug!("broker connected to redis");
        Ok(Self { client, conn })
    }
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker").finish_non_exhaustive()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BrokerError> {
        let mut conn = self.conn.clone();
        let delivered: usize = conn
            .publish(channel, payload)
            .await
            .map_err(broker_error)?;
        trace!(channel, delivered, "published");
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(broker_error)?;
        pubsub.subscribe(channel).await.map_err(broker_error)?;
        debug!(channel, "redis subscription open");

        let name = channel.to_owned();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let out = match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(channel = %name, error = %e, "skipping unreadable pub/sub payload");
                    None
                }
            };
            futures::future::ready(out)
        });
        Ok(Subscription::from_stream(channel, stream))
    }
}
