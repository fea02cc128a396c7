use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tracing::warn;
use uuid::Uuid;

use parley_types::events::ServerEvent;

/// Capacity of the per-connection outbound queue. A client that cannot
/// drain this many events is disconnected rather than allowed to stall
/// fan-out for everyone else.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// One live connection of an identity. The registry owns the only
/// long-lived sender clone; dropping it ends the connection's writer task.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    fn enqueue(&self, event: ServerEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

/// Outcome of removing a connection from the registry.
pub enum Unregistered {
    /// The connection was not registered (already removed) — a no-op.
    NotFound,
    /// Removed, but the identity still has other live connections.
    StillOnline,
    /// Removed the identity's last connection; it is now offline.
    WentOffline { user_id: Uuid, username: String },
}

/// Maps authenticated identities to their live connections. One identity
/// may own many concurrent connections (one per tab/device); every lookup
/// other components do to find "where is this user now" lands here.
#[derive(Clone)]
pub struct PresenceRegistry {
    inner: Arc<RwLock<PresenceInner>>,
}

#[derive(Default)]
struct PresenceInner {
    /// identity -> conn_id -> handle
    by_identity: HashMap<Uuid, HashMap<Uuid, ConnectionHandle>>,
    /// conn_id -> identity, so unregister needs only the connection id
    owners: HashMap<Uuid, Uuid>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(PresenceInner::default())),
        }
    }

    /// Bind a new connection under an identity. Additive and infallible;
    /// concurrent registrations for the same identity coexist. Returns the
    /// connection id, the outbound receiver for its writer task, and
    /// whether this is the identity's first live connection.
    pub async fn register(
        &self,
        user_id: Uuid,
        username: &str,
    ) -> (Uuid, mpsc::Receiver<ServerEvent>, bool) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let handle = ConnectionHandle {
            conn_id,
            user_id,
            username: username.to_string(),
            connected_at: Utc::now(),
            tx,
        };

        let mut inner = self.inner.write().await;
        let conns = inner.by_identity.entry(user_id).or_default();
        let first = conns.is_empty();
        conns.insert(conn_id, handle);
        inner.owners.insert(conn_id, user_id);
        (conn_id, rx, first)
    }

    /// Remove a connection from whatever identity owns it. Idempotent.
    pub async fn unregister(&self, conn_id: Uuid) -> Unregistered {
        let mut inner = self.inner.write().await;
        let Some(user_id) = inner.owners.remove(&conn_id) else {
            return Unregistered::NotFound;
        };

        let Some(conns) = inner.by_identity.get_mut(&user_id) else {
            return Unregistered::NotFound;
        };
        let removed = conns.remove(&conn_id);
        if conns.is_empty() {
            inner.by_identity.remove(&user_id);
            if let Some(handle) = removed {
                return Unregistered::WentOffline {
                    user_id,
                    username: handle.username,
                };
            }
        }
        Unregistered::StillOnline
    }

    /// The live fan-out set for an identity; empty means offline.
    pub async fn connections_for(&self, user_id: Uuid) -> Vec<ConnectionHandle> {
        let inner = self.inner.read().await;
        inner
            .by_identity
            .get(&user_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        let inner = self.inner.read().await;
        inner.by_identity.contains_key(&user_id)
    }

    /// Snapshot of everyone currently online (identity, username).
    pub async fn online_users(&self) -> Vec<(Uuid, String)> {
        let inner = self.inner.read().await;
        inner
            .by_identity
            .iter()
            .filter_map(|(id, conns)| {
                conns.values().next().map(|h| (*id, h.username.clone()))
            })
            .collect()
    }

    /// Deliver an event to every live connection of an identity, optionally
    /// skipping one connection (the originator). Returns how many
    /// connections accepted the event.
    pub async fn send_to_identity(
        &self,
        user_id: Uuid,
        skip_conn: Option<Uuid>,
        event: ServerEvent,
    ) -> usize {
        let handles = self.connections_for(user_id).await;
        self.deliver(handles, skip_conn, event).await
    }

    /// Deliver an event to one specific connection.
    pub async fn send_to_conn(&self, conn_id: Uuid, event: ServerEvent) {
        let handle = {
            let inner = self.inner.read().await;
            inner
                .owners
                .get(&conn_id)
                .and_then(|uid| inner.by_identity.get(uid))
                .and_then(|conns| conns.get(&conn_id))
                .cloned()
        };
        if let Some(handle) = handle {
            self.deliver([handle], None, event).await;
        }
    }

    /// Deliver an event to every connection of every identity except one.
    /// Used for presence announcements.
    pub async fn broadcast_except(&self, except: Uuid, event: ServerEvent) {
        let handles: Vec<ConnectionHandle> = {
            let inner = self.inner.read().await;
            inner
                .by_identity
                .iter()
                .filter(|(id, _)| **id != except)
                .flat_map(|(_, conns)| conns.values().cloned())
                .collect()
        };
        self.deliver(handles, None, event).await;
    }

    /// Queue an event on each handle; connections whose queue is full are
    /// treated as transport failures and forcibly dropped.
    pub async fn deliver(
        &self,
        handles: impl IntoIterator<Item = ConnectionHandle>,
        skip_conn: Option<Uuid>,
        event: ServerEvent,
    ) -> usize {
        let mut delivered = 0;
        let mut stalled = Vec::new();
        for handle in handles {
            if Some(handle.conn_id) == skip_conn {
                continue;
            }
            if handle.enqueue(event.clone()) {
                delivered += 1;
            } else {
                stalled.push(handle.conn_id);
            }
        }

        for conn_id in stalled {
            warn!(
                "Outbound queue full for connection {}, dropping it",
                conn_id
            );
            self.unregister(conn_id).await;
        }
        delivered
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_is_additive_and_unregister_idempotent() {
        let presence = PresenceRegistry::new();
        let user = Uuid::new_v4();

        let (c1, _rx1, first) = presence.register(user, "alice").await;
        assert!(first);
        let (c2, _rx2, first) = presence.register(user, "alice").await;
        assert!(!first);

        assert!(presence.is_online(user).await);
        assert_eq!(presence.connections_for(user).await.len(), 2);

        assert!(matches!(
            presence.unregister(c1).await,
            Unregistered::StillOnline
        ));
        assert!(matches!(
            presence.unregister(c1).await,
            Unregistered::NotFound
        ));
        assert!(matches!(
            presence.unregister(c2).await,
            Unregistered::WentOffline { user_id, .. } if user_id == user
        ));
        assert!(!presence.is_online(user).await);
    }

    #[tokio::test]
    async fn send_to_identity_skips_the_originating_connection() {
        let presence = PresenceRegistry::new();
        let user = Uuid::new_v4();

        let (origin, mut origin_rx, _) = presence.register(user, "alice").await;
        let (_other, mut other_rx, _) = presence.register(user, "alice").await;

        let delivered = presence
            .send_to_identity(
                user,
                Some(origin),
                ServerEvent::PresenceUpdate {
                    user_id: user,
                    username: "alice".into(),
                    online: true,
                },
            )
            .await;

        assert_eq!(delivered, 1);
        assert!(other_rx.try_recv().is_ok());
        assert!(origin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_outbound_queue_drops_the_connection() {
        let presence = PresenceRegistry::new();
        let user = Uuid::new_v4();

        // Register and never drain the receiver
        let (conn, _rx, _) = presence.register(user, "alice").await;
        let event = ServerEvent::PresenceUpdate {
            user_id: user,
            username: "alice".into(),
            online: true,
        };
        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            presence.send_to_identity(user, None, event.clone()).await;
        }
        assert!(presence.is_online(user).await);

        // One more event overflows the queue and evicts the connection
        presence.send_to_identity(user, None, event.clone()).await;
        assert!(!presence.is_online(user).await);
        assert!(matches!(
            presence.unregister(conn).await,
            Unregistered::NotFound
        ));
    }
}
