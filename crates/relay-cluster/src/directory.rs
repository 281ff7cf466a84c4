//! Presence directory: which relay instance holds a user's connection.
//!
//! Entries never expire. They are written when a session registers and
//! deleted when it tears down, with no transaction tying them to the local
//! registry, so a lookup from another instance can briefly see a stale owner.

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::{ServerId, UserId, presence_key};
use tracing::trace;

use crate::error::DirectoryError;

/// Shared user → owning server mapping.
#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    /// Record `server` as the owner of `user`, replacing any previous owner.
    async fn set(&self, user: &UserId, server: &ServerId) -> Result<(), DirectoryError>;

    /// Current owner of `user`, if any.
    async fn lookup(&self, user: &UserId) -> Result<Option<ServerId>, DirectoryError>;

    /// Delete the entry for `user` if it still names `owner`.
    ///
    /// Returns whether an entry was removed. An entry that already points at
    /// another server belongs to a newer connection and is left alone.
    async fn remove(&self, user: &UserId, owner: &ServerId) -> Result<bool, DirectoryError>;
}

/// In-process directory backed by a concurrent map.
///
/// Share one instance (behind an `Arc`) between every relay that should see
/// the same presence data.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: DashMap<String, ServerId>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PresenceDirectory for MemoryDirectory {
    async fn set(&self, user: &UserId, server: &ServerId) -> Result<(), DirectoryError> {
        let key = presence_key(user);
        trace!(key, %server, "presence set");
        let _ = self.entries.insert(key, server.clone());
        Ok(())
    }

    async fn lookup(&self, user: &UserId) -> Result<Option<ServerId>, DirectoryError> {
        let key = presence_key(user);
        Ok(self.entries.get(&key).map(|e| e.value().clone()))
    }

    async fn remove(&self, user: &UserId, owner: &ServerId) -> Result<bool, DirectoryError> {
        let key = presence_key(user);
        let removed = self.entries.remove_if(&key, |_, v| v == owner).is_some();
        trace!(key, %owner, removed, "presence remove");
        Ok(removed)
    }
}
