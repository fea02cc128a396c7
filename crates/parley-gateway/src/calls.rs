use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use parley_types::events::ServerEvent;
use parley_types::models::CallMode;

use crate::error::GatewayError;
use crate::{ConnCtx, Coordinator};

/// Call session lifecycle. `Ringing` and `Active` are the only states a
/// stored session can be in — reaching a terminal state removes it from
/// the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Active,
    Ended,
    Declined,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Declined | Self::Failed)
    }
}

/// Caption language preference of one call participant.
#[derive(Debug, Clone)]
pub struct TranslationPreference {
    pub enabled: bool,
    pub target_language: String,
    pub source_language: Option<String>,
}

/// One signaling session between exactly two identities. The dedicated
/// `room_id` exists for client-side correlation; signaling itself is always
/// routed to the two bound identities, never to a wider audience.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: Uuid,
    pub room_id: String,
    pub caller: Uuid,
    pub callee: Uuid,
    pub mode: CallMode,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub prefs: HashMap<Uuid, TranslationPreference>,
}

impl CallSession {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.caller == user_id || self.callee == user_id
    }

    pub fn peer_of(&self, user_id: Uuid) -> Uuid {
        if user_id == self.caller {
            self.callee
        } else {
            self.caller
        }
    }
}

fn generate_room_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// Manages the lifecycle of call sessions. All checks happen under the
/// table's write lock so concurrent requests for the same pair cannot both
/// succeed.
pub(crate) struct CallTable {
    sessions: Arc<RwLock<HashMap<Uuid, CallSession>>>,
}

impl CallTable {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<CallSession> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Attempt to start a call. A user already bound to any live session —
    /// as caller or callee — is busy.
    pub async fn start(
        &self,
        caller: Uuid,
        callee: Uuid,
        mode: CallMode,
    ) -> Result<CallSession, GatewayError> {
        let mut sessions = self.sessions.write().await;

        let busy = |user: Uuid| {
            sessions
                .values()
                .any(|s| s.caller == user || s.callee == user)
        };
        if busy(caller) {
            return Err(GatewayError::session("You already have an active call."));
        }
        if busy(callee) {
            return Err(GatewayError::session("That user is busy in another call."));
        }

        let session = CallSession {
            id: Uuid::new_v4(),
            room_id: generate_room_id(),
            caller,
            callee,
            mode,
            state: CallState::Ringing,
            started_at: Utc::now(),
            prefs: HashMap::new(),
        };
        sessions.insert(session.id, session.clone());
        debug!("Created call session {}", session.id);
        Ok(session)
    }

    /// Callee accepts a ringing call: `Ringing -> Active`.
    pub async fn accept(&self, id: Uuid, callee: Uuid) -> Result<CallSession, GatewayError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| GatewayError::session("Call not found."))?;
        if session.callee != callee {
            return Err(GatewayError::session("You are not part of this call."));
        }
        if session.state != CallState::Ringing {
            return Err(GatewayError::session("Call is no longer available."));
        }
        session.state = CallState::Active;
        Ok(session.clone())
    }

    /// Callee declines a ringing call: `Ringing -> Declined` (terminal).
    pub async fn decline(&self, id: Uuid, callee: Uuid) -> Result<CallSession, GatewayError> {
        let mut sessions = self.sessions.write().await;
        let Entry::Occupied(entry) = sessions.entry(id) else {
            return Err(GatewayError::session("Call not found."));
        };
        if entry.get().callee != callee {
            return Err(GatewayError::session("You are not part of this call."));
        }
        if entry.get().state != CallState::Ringing {
            return Err(GatewayError::session("Call is no longer available."));
        }
        let mut session = entry.remove();
        session.state = CallState::Declined;
        Ok(session)
    }

    /// Either participant ends a ringing or active call: `-> Ended`
    /// (terminal). Unknown sessions and non-participants yield None —
    /// stragglers are dropped, not errored loudly.
    pub async fn end(&self, id: Uuid, participant: Uuid) -> Option<CallSession> {
        let mut sessions = self.sessions.write().await;
        let Entry::Occupied(entry) = sessions.entry(id) else {
            return None;
        };
        if !entry.get().is_participant(participant) {
            return None;
        }
        let mut session = entry.remove();
        session.state = CallState::Ended;
        Some(session)
    }

    /// Remove a session outright (offline-callee race); `-> Failed`.
    pub async fn fail(&self, id: Uuid) -> Option<CallSession> {
        let mut session = self.sessions.write().await.remove(&id)?;
        session.state = CallState::Failed;
        Some(session)
    }

    /// Remove and return every live session an identity is bound to. Used
    /// when its last connection vanishes; sessions must never dangle.
    pub async fn take_involving(&self, user_id: Uuid) -> Vec<CallSession> {
        let mut sessions = self.sessions.write().await;
        let ids: Vec<Uuid> = sessions
            .values()
            .filter(|s| s.is_participant(user_id))
            .map(|s| s.id)
            .collect();
        ids.iter()
            .filter_map(|id| {
                sessions.remove(id).map(|mut s| {
                    s.state = CallState::Ended;
                    s
                })
            })
            .collect()
    }

    /// Store a participant's caption preference on a live session.
    pub async fn set_preference(
        &self,
        id: Uuid,
        user_id: Uuid,
        pref: TranslationPreference,
    ) -> Result<(), GatewayError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| GatewayError::session("Call not found."))?;
        if !session.is_participant(user_id) {
            return Err(GatewayError::session("You are not part of this call."));
        }
        session.prefs.insert(user_id, pref);
        Ok(())
    }
}

impl Coordinator {
    /// Initiate a call. Checks run in order: self-call, offline callee,
    /// busy parties; only then is a session created in `Ringing` and the
    /// callee's connections rung.
    pub async fn call_request(
        &self,
        ctx: &ConnCtx,
        target: Uuid,
        offer: serde_json::Value,
        mode: CallMode,
    ) -> Result<(), GatewayError> {
        if target == ctx.user_id {
            return Err(GatewayError::validation("You cannot call yourself."));
        }
        if !self.presence().is_online(target).await {
            return Err(GatewayError::RecipientUnavailable);
        }

        let session = self.calls().start(ctx.user_id, target, mode).await?;
        info!(
            "{} ({}) calling {} [session={}]",
            ctx.username, ctx.user_id, target, session.id
        );

        let delivered = self
            .presence()
            .send_to_identity(
                target,
                None,
                ServerEvent::CallIncoming {
                    session_id: session.id,
                    room_id: session.room_id.clone(),
                    caller_id: ctx.user_id,
                    caller: ctx.username.clone(),
                    offer,
                    mode,
                },
            )
            .await;

        // The callee vanished between the presence check and delivery.
        // The session fails immediately; nothing may linger.
        if delivered == 0 {
            self.calls().fail(session.id).await;
            return Err(GatewayError::RecipientUnavailable);
        }

        let recipient = self
            .presence()
            .connections_for(target)
            .await
            .first()
            .map(|h| h.username.clone())
            .unwrap_or_default();
        self.presence()
            .send_to_conn(
                ctx.conn_id,
                ServerEvent::CallOutgoing {
                    session_id: session.id,
                    room_id: session.room_id,
                    recipient,
                },
            )
            .await;

        Ok(())
    }

    /// Callee accepts or declines. Acceptance carries the SDP answer back
    /// to the caller; a decline frees the session.
    pub async fn call_answer(
        &self,
        ctx: &ConnCtx,
        session_id: Uuid,
        accepted: bool,
        answer: Option<serde_json::Value>,
    ) -> Result<(), GatewayError> {
        if !accepted {
            let session = self.calls().decline(session_id, ctx.user_id).await?;
            info!("{} declined call {}", ctx.username, session.id);
            self.presence()
                .send_to_identity(
                    session.caller,
                    None,
                    ServerEvent::CallDeclined { session_id },
                )
                .await;
            return Ok(());
        }

        let answer = answer.ok_or_else(|| GatewayError::validation("Missing WebRTC answer."))?;
        let session = self.calls().accept(session_id, ctx.user_id).await?;
        info!("{} answered call {}", ctx.username, session.id);
        self.presence()
            .send_to_identity(
                session.caller,
                None,
                ServerEvent::CallAnswered { session_id, answer },
            )
            .await;
        Ok(())
    }

    /// Relay an ICE candidate verbatim to the other participant. Candidates
    /// for unknown or terminal sessions, or from non-participants, are
    /// dropped silently — they are expected stragglers from network jitter.
    pub async fn relay_ice_candidate(
        &self,
        ctx: &ConnCtx,
        session_id: Uuid,
        candidate: serde_json::Value,
    ) {
        let Some(session) = self.calls().get(session_id).await else {
            return;
        };
        if !session.is_participant(ctx.user_id) {
            return;
        }

        self.presence()
            .send_to_identity(
                session.peer_of(ctx.user_id),
                None,
                ServerEvent::IceCandidate {
                    session_id,
                    candidate,
                },
            )
            .await;
    }

    /// Hang up a ringing or active call. Both participants' remaining
    /// connections learn who ended it; the hanger's own tab already knows.
    pub async fn call_hangup(&self, ctx: &ConnCtx, session_id: Uuid) {
        let Some(session) = self.calls().end(session_id, ctx.user_id).await else {
            return;
        };
        info!("{} ended call {}", ctx.username, session.id);

        let event = ServerEvent::CallEnded {
            session_id,
            ended_by: ctx.username.clone(),
        };
        self.presence()
            .send_to_identity(session.peer_of(ctx.user_id), None, event.clone())
            .await;
        self.presence()
            .send_to_identity(ctx.user_id, Some(ctx.conn_id), event)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_request_for_a_busy_pair_is_rejected() {
        let table = CallTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let first = table.start(a, b, CallMode::Audio).await.unwrap();
        assert_eq!(first.state, CallState::Ringing);

        let err = table.start(a, b, CallMode::Video).await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionState(_)));

        // The reverse direction is busy too
        let err = table.start(b, a, CallMode::Audio).await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionState(_)));

        // The first session is unaffected
        assert_eq!(table.get(first.id).await.unwrap().state, CallState::Ringing);
    }

    #[tokio::test]
    async fn accept_then_end_walks_the_state_machine() {
        let table = CallTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let session = table.start(a, b, CallMode::Video).await.unwrap();

        // Only the callee may answer
        let err = table.accept(session.id, a).await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionState(_)));

        let active = table.accept(session.id, b).await.unwrap();
        assert_eq!(active.state, CallState::Active);

        // Answering twice is a state error
        let err = table.accept(session.id, b).await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionState(_)));

        let ended = table.end(session.id, a).await.unwrap();
        assert_eq!(ended.state, CallState::Ended);
        assert!(ended.state.is_terminal());
        assert!(table.get(session.id).await.is_none());
    }

    #[tokio::test]
    async fn decline_frees_the_session() {
        let table = CallTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let session = table.start(a, b, CallMode::Audio).await.unwrap();
        let declined = table.decline(session.id, b).await.unwrap();
        assert_eq!(declined.state, CallState::Declined);
        assert!(table.get(session.id).await.is_none());

        // The pair is immediately callable again
        assert!(table.start(a, b, CallMode::Audio).await.is_ok());
    }

    #[tokio::test]
    async fn take_involving_clears_every_session_of_an_identity() {
        let table = CallTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let session = table.start(a, b, CallMode::Audio).await.unwrap();
        let taken = table.take_involving(b).await;
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].id, session.id);
        assert_eq!(taken[0].state, CallState::Ended);
        assert!(table.get(session.id).await.is_none());
    }

    #[tokio::test]
    async fn end_ignores_strangers_and_unknown_sessions() {
        let table = CallTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let stranger = Uuid::new_v4();

        let session = table.start(a, b, CallMode::Audio).await.unwrap();
        assert!(table.end(session.id, stranger).await.is_none());
        assert!(table.get(session.id).await.is_some());
        assert!(table.end(Uuid::new_v4(), a).await.is_none());
    }

    #[test]
    fn room_ids_are_distinct_and_well_formed() {
        let one = generate_room_id();
        let two = generate_room_id();
        assert_eq!(one.len(), 24);
        assert!(one.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(one, two);
    }
}
