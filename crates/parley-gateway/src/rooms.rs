use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use parley_types::models::RoomKey;

use crate::presence::{ConnectionHandle, PresenceRegistry};

/// Tracks which identities belong to which rooms.
///
/// Direct rooms need no tracking at all — membership is the pair itself.
/// Group membership is keyed by identity (not connection) so it survives
/// reconnects; it is hydrated from the database when a connection arrives
/// and mutated by explicit join/leave.
#[derive(Clone)]
pub struct RoomManager {
    groups: Arc<RwLock<HashMap<Uuid, HashSet<Uuid>>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn join_group(&self, user_id: Uuid, group_id: Uuid) {
        self.groups
            .write()
            .await
            .entry(group_id)
            .or_default()
            .insert(user_id);
    }

    pub async fn leave_group(&self, user_id: Uuid, group_id: Uuid) {
        let mut groups = self.groups.write().await;
        if let Some(members) = groups.get_mut(&group_id) {
            members.remove(&user_id);
            if members.is_empty() {
                groups.remove(&group_id);
            }
        }
    }

    /// Rebuild an identity's live membership from its persisted group list.
    pub async fn hydrate(&self, user_id: Uuid, group_ids: Vec<Uuid>) {
        let mut groups = self.groups.write().await;
        for group_id in group_ids {
            groups.entry(group_id).or_default().insert(user_id);
        }
    }

    pub async fn is_member(&self, group_id: Uuid, user_id: Uuid) -> bool {
        self.groups
            .read()
            .await
            .get(&group_id)
            .is_some_and(|members| members.contains(&user_id))
    }

    /// Current member identities of a room. Direct rooms are always the
    /// pair; group rooms reflect live membership.
    pub async fn members_of(&self, key: &RoomKey) -> Vec<Uuid> {
        match key {
            RoomKey::Direct { a, b } => {
                if a == b {
                    vec![*a]
                } else {
                    vec![*a, *b]
                }
            }
            RoomKey::Group(group_id) => self
                .groups
                .read()
                .await
                .get(group_id)
                .map(|members| members.iter().copied().collect())
                .unwrap_or_default(),
        }
    }

    /// The live connection set for a room, recomputed from current presence
    /// at every call — never a snapshot taken at join time.
    pub async fn fanout_targets(
        &self,
        key: &RoomKey,
        presence: &PresenceRegistry,
    ) -> Vec<ConnectionHandle> {
        let mut targets = Vec::new();
        for member in self.members_of(key).await {
            targets.extend(presence.connections_for(member).await);
        }
        targets
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}
