pub mod calls;
pub mod connection;
pub mod error;
pub mod presence;
pub mod rooms;
pub mod router;
pub mod translate;

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::ServerEvent;

use crate::calls::CallTable;
use crate::presence::PresenceRegistry;
use crate::rooms::RoomManager;
use crate::translate::Translator;

/// Identifies the connection a command arrived on. Every coordinator
/// operation is scoped to one of these — errors go back to it and fan-out
/// skips it.
#[derive(Debug, Clone)]
pub struct ConnCtx {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
}

/// Everything a new connection needs from the coordinator: its id, the
/// outbound event queue, and a snapshot of who was already online.
pub struct ConnectHandle {
    pub conn_id: Uuid,
    pub outbound: mpsc::Receiver<ServerEvent>,
    pub roster: Vec<(Uuid, String)>,
}

/// Shared realtime state: presence, rooms, calls, and the collaborators
/// the router depends on. Cheap to clone, handed to every connection.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    db: Arc<Database>,
    presence: PresenceRegistry,
    rooms: RoomManager,
    calls: CallTable,
    translator: Arc<dyn Translator>,
}

impl Coordinator {
    pub fn new(db: Arc<Database>, translator: Arc<dyn Translator>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                db,
                presence: PresenceRegistry::new(),
                rooms: RoomManager::new(),
                calls: CallTable::new(),
                translator,
            }),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.inner.db
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.inner.presence
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.inner.rooms
    }

    pub(crate) fn calls(&self) -> &CallTable {
        &self.inner.calls
    }

    pub(crate) fn translator(&self) -> &Arc<dyn Translator> {
        &self.inner.translator
    }

    /// Register a new connection: bind it in the presence registry, hydrate
    /// the identity's group rooms from the database, and announce the
    /// identity if this is its first live connection.
    pub async fn connect(&self, user_id: Uuid, username: &str) -> anyhow::Result<ConnectHandle> {
        // Snapshot the roster before registering so the new client's replay
        // does not include itself.
        let roster = self.inner.presence.online_users().await;

        let (conn_id, outbound, first) = self.inner.presence.register(user_id, username).await;

        // Group membership survives reconnects; rebuild the live room set
        // from the database on every connect.
        let db = self.inner.db.clone();
        let uid = user_id.to_string();
        let group_ids = tokio::task::spawn_blocking(move || db.group_ids_for_user(&uid)).await??;
        let group_ids = group_ids
            .iter()
            .filter_map(|id| id.parse::<Uuid>().ok())
            .collect();
        self.inner.rooms.hydrate(user_id, group_ids).await;

        if first {
            self.inner
                .presence
                .broadcast_except(
                    user_id,
                    ServerEvent::PresenceUpdate {
                        user_id,
                        username: username.to_string(),
                        online: true,
                    },
                )
                .await;
        }

        Ok(ConnectHandle {
            conn_id,
            outbound,
            roster,
        })
    }

    /// Tear down a connection. Idempotent. When the identity's last
    /// connection goes away, every call it was bound to is force-ended and
    /// the peer notified, then the identity is announced offline.
    pub async fn disconnect(&self, conn_id: Uuid) {
        use crate::presence::Unregistered;

        let (user_id, username) = match self.inner.presence.unregister(conn_id).await {
            // Another tab is still connected; sessions and presence stand.
            Unregistered::NotFound | Unregistered::StillOnline => return,
            Unregistered::WentOffline { user_id, username } => (user_id, username),
        };

        for session in self.inner.calls.take_involving(user_id).await {
            let peer = session.peer_of(user_id);
            self.inner
                .presence
                .send_to_identity(
                    peer,
                    None,
                    ServerEvent::CallEnded {
                        session_id: session.id,
                        ended_by: username.clone(),
                    },
                )
                .await;
        }

        self.inner
            .presence
            .broadcast_except(
                user_id,
                ServerEvent::PresenceUpdate {
                    user_id,
                    username,
                    online: false,
                },
            )
            .await;
    }
}
