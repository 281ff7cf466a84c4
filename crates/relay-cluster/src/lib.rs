//! # relay-cluster
//!
//! The two shared services that let relay instances reach each other:
//!
//! - [`PresenceDirectory`]: user id → owning server id
//! - [`Broker`]: publish/subscribe addressed by server id
//!
//! Both are async traits so the server can run against any backend.
//! [`RedisDirectory`] and [`RedisBroker`] share state across processes. The
//! in-memory implementations ([`MemoryDirectory`], [`MemoryBroker`]) can be
//! shared by several instances inside one process.

#![deny(unsafe_code)]

pub mod broker;
pub mod directory;
pub mod error;
pub mod redis_store;

pub use broker::{Broker, MemoryBroker, Subscription};
pub use directory::{MemoryDirectory, PresenceDirectory};
pub use error::{BrokerError, DirectoryError};
pub use redis_store::{RedisBroker, RedisDirectory};
