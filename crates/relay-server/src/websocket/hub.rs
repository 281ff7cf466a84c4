//! Connection registry.
//!
//! One map per instance from user id to the attached session, behind a
//! reader/writer lock. Lookups share the lock; register and unregister take it
//! exclusively. The lock is never held across an await: presence directory
//! writes happen after the in-process mutation and are best-effort.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use relay_cluster::PresenceDirectory;
use relay_core::{CallContext, ServerId, UserId};
use tracing::{debug, info, warn};

use super::connection::ClientConnection;

/// Per-instance registry of attached sessions.
pub struct Hub {
    server_id: ServerId,
    clients: RwLock<HashMap<UserId, Arc<ClientConnection>>>,
    directory: Arc<dyn PresenceDirectory>,
}

impl Hub {
    /// Create an empty registry for the instance `server_id`.
    pub fn new(server_id: ServerId, directory: Arc<dyn PresenceDirectory>) -> Self {
        Self {
            server_id,
            clients: RwLock::new(HashMap::new()),
            directory,
        }
    }

    /// Id of the instance this registry belongs to.
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Attach a session, replacing any session already registered for the
    /// same user, then record this instance as the user's owner.
    ///
    /// A displaced session is closed. Directory failure is logged and the
    /// registration stands.
    pub async fn register(&self, conn: Arc<ClientConnection>, ctx: &CallContext) {
        let user_id = conn.user_id().clone();
        let displaced = self.clients.write().insert(user_id.clone(), conn.clone());

        if let Some(old) = displaced.filter(|old| !Arc::ptr_eq(old, &conn)) {
            info!(%user_id, old_conn = %old.id, new_conn = %conn.id, "session displaced by reconnect");
            old.close();
        }

        self.set_presence(&user_id, ctx).await;
    }

    /// Detach whatever session is registered for `user_id` and delete the
    /// presence entry. Returns the removed session, which is closed.
    ///
    /// Calling this for an absent user only repeats the directory delete, so
    /// unregistering twice is the same as unregistering once.
    pub async fn unregister(
        &self,
        user_id: &UserId,
        ctx: &CallContext,
    ) -> Option<Arc<ClientConnection>> {
        let removed = self.clients.write().remove(user_id);
        if let Some(conn) = &removed {
            conn.close();
        }
        self.remove_presence(user_id, ctx).await;
        removed
    }

    /// Detach `conn` only if it is still the registered session for its user.
    ///
    /// Session teardown goes through here so a session that was displaced by
    /// a reconnect cannot evict its replacement. Returns whether it was
    /// removed.
    pub async fn release(&self, conn: &Arc<ClientConnection>, ctx: &CallContext) -> bool {
        let user_id = conn.user_id();
        let removed = {
            let mut clients = self.clients.write();
            let is_current = clients
                .get(user_id)
                .is_some_and(|current| Arc::ptr_eq(current, conn));
            is_current && clients.remove(user_id).is_some()
        };

        if removed {
            self.remove_presence(user_id, ctx).await;
        } else {
            debug!(%user_id, conn_id = %conn.id, "release skipped, session already replaced or removed");
        }
        removed
    }

    async fn set_presence(&self, user_id: &UserId, ctx: &CallContext) {
        if let Err(e) = ctx.run(self.directory.set(user_id, &self.server_id)).await {
            warn!(%user_id, error = %e, "presence write failed");
        }
    }

    async fn remove_presence(&self, user_id: &UserId, ctx: &CallContext) {
        let removed = match ctx.run(self.directory.remove(user_id, &self.server_id)).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(%user_id, error = %e, "presence delete failed");
                return;
            }
        };
        // A reconnect can register between the map removal and this delete,
        // in which case the entry we just deleted was the new session's.
        if removed && self.lookup(user_id).is_some() {
            debug!(%user_id, "session re-attached during presence delete, restoring entry");
            self.set_presence(user_id, ctx).await;
        }
    }

    /// Session registered for `user_id`, if any.
    pub fn lookup(&self, user_id: &UserId) -> Option<Arc<ClientConnection>> {
        self.clients.read().get(user_id).cloned()
    }

    /// Number of attached sessions.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether no session is attached.
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Attached user ids, sorted.
    pub fn user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.clients.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every attached session. Each session unregisters itself as it
    /// tears down.
    pub fn close_all(&self) {
        let clients = self.clients.read();
        info!(count = clients.len(), "closing all sessions");
        for conn in clients.values() {
            conn.close();
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("server_id", &self.server_id)
            .field("clients", &self.len())
            .finish_non_exhaustive()
    }
}
