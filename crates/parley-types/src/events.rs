use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AttachmentRef, CallMode, EncryptedPayload};

/// Commands sent FROM client TO server over the gateway socket.
///
/// SDP offers/answers and ICE candidates are `serde_json::Value` on purpose:
/// the server relays them verbatim and never inspects their internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Send a direct message to another user.
    SendMessage {
        recipient: Uuid,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        attachment_token: Option<String>,
        #[serde(default)]
        encrypted: Option<EncryptedPayload>,
    },

    /// Send a message to a group room.
    SendGroupMessage {
        group_id: Uuid,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        attachment_token: Option<String>,
        #[serde(default)]
        encrypted: Option<EncryptedPayload>,
    },

    /// Join a group room live without reconnecting (membership must already
    /// exist in the database).
    JoinGroupRoom { group_id: Uuid },

    /// Initiate a call to another user.
    CallRequest {
        target: Uuid,
        offer: serde_json::Value,
        #[serde(default)]
        mode: CallMode,
    },

    /// Accept or decline a ringing call.
    CallAnswer {
        session_id: Uuid,
        accepted: bool,
        #[serde(default)]
        answer: Option<serde_json::Value>,
    },

    /// Relay an ICE candidate to the call peer.
    IceCandidate {
        session_id: Uuid,
        candidate: serde_json::Value,
    },

    /// Hang up a ringing or active call.
    CallHangup { session_id: Uuid },

    /// Stream an audio chunk (base64) for live captioning.
    CallTranscriptionChunk {
        call_id: Uuid,
        audio_chunk: String,
        #[serde(default)]
        source_language: Option<String>,
    },

    /// Register or update caption language preferences for a call.
    SetTranslationPreferences {
        call_id: Uuid,
        enabled: bool,
        target_language: String,
        #[serde(default)]
        source_language: Option<String>,
    },
}

/// Events sent FROM server TO client over the gateway socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Server confirms the connection is authenticated and registered.
    Ready { user_id: Uuid, username: String },

    /// A direct message was delivered to this connection.
    ReceiveMessage {
        id: Uuid,
        sender_id: Uuid,
        sender_username: String,
        recipient_id: Uuid,
        body: Option<String>,
        attachment: Option<AttachmentRef>,
        encrypted: Option<EncryptedPayload>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A group message was delivered to this connection.
    ReceiveGroupMessage {
        id: Uuid,
        group_id: Uuid,
        sender_id: Uuid,
        sender_username: String,
        body: Option<String>,
        attachment: Option<AttachmentRef>,
        encrypted: Option<EncryptedPayload>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A user came online or went fully offline.
    PresenceUpdate {
        user_id: Uuid,
        username: String,
        online: bool,
    },

    /// Acknowledges a call request to the caller.
    CallOutgoing {
        session_id: Uuid,
        room_id: String,
        recipient: String,
    },

    /// Rings the callee with the caller's offer.
    CallIncoming {
        session_id: Uuid,
        room_id: String,
        caller_id: Uuid,
        caller: String,
        offer: serde_json::Value,
        mode: CallMode,
    },

    /// The callee accepted; carries the SDP answer back to the caller.
    CallAnswered {
        session_id: Uuid,
        answer: serde_json::Value,
    },

    /// The callee declined the call.
    CallDeclined { session_id: Uuid },

    /// ICE candidate relayed from the call peer.
    IceCandidate {
        session_id: Uuid,
        candidate: serde_json::Value,
    },

    /// The call reached a terminal state; `ended_by` names who ended it.
    CallEnded { session_id: Uuid, ended_by: String },

    /// Call-scoped error, reported only to the offending connection.
    CallError { error: String },

    /// A live caption rendered in this participant's preferred language.
    TranslatedCaption {
        session_id: Uuid,
        speaker_id: Uuid,
        language: String,
        caption: String,
    },

    /// The translation collaborator failed; the call itself is unaffected.
    TranslationError { session_id: Uuid, error: String },

    /// Messaging-scoped error, reported only to the offending connection.
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_names_match_protocol() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"send_message","data":{"recipient":"6d1a4f0e-8a68-4f44-9b9e-5d6a6a2a1c11","body":"hi"}}"#,
        )
        .unwrap();
        assert!(matches!(cmd, ClientCommand::SendMessage { .. }));

        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"call_request","data":{"target":"6d1a4f0e-8a68-4f44-9b9e-5d6a6a2a1c11","offer":{"sdp":"v=0"},"mode":"video"}}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::CallRequest { mode, .. } => assert_eq!(mode, CallMode::Video),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn event_wire_names_match_protocol() {
        let json = serde_json::to_value(ServerEvent::CallDeclined {
            session_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(json["type"], "call_declined");

        let json = serde_json::to_value(ServerEvent::Error {
            error: "nope".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["error"], "nope");
    }

    #[test]
    fn call_mode_defaults_to_audio() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"call_request","data":{"target":"6d1a4f0e-8a68-4f44-9b9e-5d6a6a2a1c11","offer":{}}}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::CallRequest { mode, .. } => assert_eq!(mode, CallMode::Audio),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
