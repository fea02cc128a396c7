use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use parley_db::models::{NewAttachment, NewMessage};
use parley_types::events::ServerEvent;
use parley_types::models::{AttachmentRef, EncryptedPayload, MediaType, RoomKey};

use crate::error::GatewayError;
use crate::{ConnCtx, Coordinator};

/// Original client limit; anything longer is rejected, not truncated.
const MAX_MESSAGE_CHARS: usize = 500;

impl Coordinator {
    /// Send a direct message. The message is durably persisted before any
    /// fan-out; delivery goes to every live connection of both parties
    /// except the one that originated the send (that tab already has it).
    /// Returns the delivery event so the caller can correlate the
    /// server-assigned id and timestamp.
    pub async fn send_direct(
        &self,
        ctx: &ConnCtx,
        recipient: Uuid,
        body: Option<String>,
        attachment_token: Option<String>,
        encrypted: Option<EncryptedPayload>,
    ) -> Result<ServerEvent, GatewayError> {
        let body = validate_body(body, attachment_token.as_deref(), encrypted.as_ref())?;

        let db = self.db().clone();
        let rid = recipient.to_string();
        let known = tokio::task::spawn_blocking(move || db.get_user_by_id(&rid))
            .await
            .map_err(|e| GatewayError::Persistence(e.into()))?
            .map_err(GatewayError::Persistence)?;
        if known.is_none() {
            return Err(GatewayError::validation("Recipient not found!"));
        }

        let attachment = self.resolve_attachment(ctx, attachment_token).await?;
        let (new_attachment, attachment_ref) = attachment.unzip();
        let (ciphertext, nonce) = decode_encrypted(encrypted.as_ref())?;

        let key = RoomKey::direct(ctx.user_id, recipient);
        let message_id = Uuid::new_v4();
        let timestamp = Utc::now();

        let record = NewMessage {
            id: message_id.to_string(),
            room_key: key.storage_key(),
            sender_id: ctx.user_id.to_string(),
            recipient_id: Some(recipient.to_string()),
            group_id: None,
            body: body.clone(),
            ciphertext,
            nonce,
            created_at: timestamp.to_rfc3339(),
            attachment: new_attachment,
        };
        self.persist(record).await?;

        let event = ServerEvent::ReceiveMessage {
            id: message_id,
            sender_id: ctx.user_id,
            sender_username: ctx.username.clone(),
            recipient_id: recipient,
            body,
            attachment: attachment_ref,
            encrypted,
            timestamp,
        };

        let targets = self.rooms().fanout_targets(&key, self.presence()).await;
        self.presence()
            .deliver(targets, Some(ctx.conn_id), event.clone())
            .await;

        Ok(event)
    }

    /// Send a message to a group room. Rejected unless the sender is a
    /// current member; otherwise identical contract to `send_direct` with
    /// the fan-out set being every member's live connections.
    pub async fn send_group(
        &self,
        ctx: &ConnCtx,
        group_id: Uuid,
        body: Option<String>,
        attachment_token: Option<String>,
        encrypted: Option<EncryptedPayload>,
    ) -> Result<ServerEvent, GatewayError> {
        if !self.rooms().is_member(group_id, ctx.user_id).await {
            return Err(GatewayError::NotAMember);
        }

        let body = validate_body(body, attachment_token.as_deref(), encrypted.as_ref())?;

        let attachment = self.resolve_attachment(ctx, attachment_token).await?;
        let (new_attachment, attachment_ref) = attachment.unzip();
        let (ciphertext, nonce) = decode_encrypted(encrypted.as_ref())?;

        let key = RoomKey::group(group_id);
        let message_id = Uuid::new_v4();
        let timestamp = Utc::now();

        let record = NewMessage {
            id: message_id.to_string(),
            room_key: key.storage_key(),
            sender_id: ctx.user_id.to_string(),
            recipient_id: None,
            group_id: Some(group_id.to_string()),
            body: body.clone(),
            ciphertext,
            nonce,
            created_at: timestamp.to_rfc3339(),
            attachment: new_attachment,
        };
        self.persist(record).await?;

        let event = ServerEvent::ReceiveGroupMessage {
            id: message_id,
            group_id,
            sender_id: ctx.user_id,
            sender_username: ctx.username.clone(),
            body,
            attachment: attachment_ref,
            encrypted,
            timestamp,
        };

        let targets = self.rooms().fanout_targets(&key, self.presence()).await;
        self.presence()
            .deliver(targets, Some(ctx.conn_id), event.clone())
            .await;

        Ok(event)
    }

    /// Join a group room live, after verifying membership in the database
    /// (membership itself is managed by the group endpoints).
    pub async fn join_group_room(&self, ctx: &ConnCtx, group_id: Uuid) -> Result<(), GatewayError> {
        let db = self.db().clone();
        let gid = group_id.to_string();
        let uid = ctx.user_id.to_string();
        let member = tokio::task::spawn_blocking(move || db.is_group_member(&gid, &uid))
            .await
            .map_err(|e| GatewayError::Persistence(e.into()))?
            .map_err(GatewayError::Persistence)?;
        if !member {
            return Err(GatewayError::NotAMember);
        }
        self.rooms().join_group(ctx.user_id, group_id).await;
        Ok(())
    }

    /// Durable write, awaited before any fan-out. A failure here suppresses
    /// delivery entirely.
    async fn persist(&self, record: NewMessage) -> Result<(), GatewayError> {
        let db = self.db().clone();
        tokio::task::spawn_blocking(move || db.append_message(&record))
            .await
            .map_err(|e| GatewayError::Persistence(e.into()))?
            .map_err(GatewayError::Persistence)
    }

    /// Exchange an upload token for the attachment it references. Tokens
    /// are single-use and expire; both cases read as validation failures.
    async fn resolve_attachment(
        &self,
        ctx: &ConnCtx,
        token: Option<String>,
    ) -> Result<Option<(NewAttachment, AttachmentRef)>, GatewayError> {
        let Some(token) = token else {
            return Ok(None);
        };

        let db = self.db().clone();
        let uid = ctx.user_id.to_string();
        let row = tokio::task::spawn_blocking(move || {
            db.consume_upload_token(&token, &uid, Utc::now())
        })
        .await
        .map_err(|e| GatewayError::Persistence(e.into()))?
        .map_err(GatewayError::Persistence)?
        .ok_or_else(|| {
            GatewayError::validation("Attachment upload is invalid or has expired.")
        })?;

        let media_type = row.media_type.parse::<MediaType>().unwrap_or_else(|e| {
            warn!("Corrupt media type on upload token: {}", e);
            MediaType::File
        });

        let new_attachment = NewAttachment {
            id: Uuid::new_v4().to_string(),
            media_type: row.media_type.clone(),
            storage_path: row.storage_path.clone(),
            mime_type: row.mime_type.clone(),
            duration_seconds: row.duration_seconds,
        };
        let attachment_ref = AttachmentRef {
            media_type,
            url: format!("/uploads/{}", row.storage_path),
            mime_type: row.mime_type,
            duration_seconds: row.duration_seconds,
        };
        Ok(Some((new_attachment, attachment_ref)))
    }
}

/// The encrypted payload is stored as raw bytes; the base64 on the wire is
/// transport framing, not part of the opaque ciphertext.
fn decode_encrypted(
    encrypted: Option<&EncryptedPayload>,
) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>), GatewayError> {
    let Some(enc) = encrypted else {
        return Ok((None, None));
    };
    let ciphertext = B64
        .decode(&enc.ciphertext)
        .map_err(|_| GatewayError::validation("Invalid encrypted payload encoding."))?;
    let nonce = B64
        .decode(&enc.nonce)
        .map_err(|_| GatewayError::validation("Invalid encrypted payload encoding."))?;
    Ok((Some(ciphertext), Some(nonce)))
}

/// A message must carry at least one of text, attachment, or encrypted
/// payload; text is trimmed and capped at the protocol limit.
fn validate_body(
    body: Option<String>,
    attachment_token: Option<&str>,
    encrypted: Option<&EncryptedPayload>,
) -> Result<Option<String>, GatewayError> {
    let body = body
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty());

    if body.is_none() && attachment_token.is_none() && encrypted.is_none() {
        return Err(GatewayError::validation("Message cannot be empty!"));
    }
    if let Some(text) = &body {
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(GatewayError::validation(
                "Message must be at most 500 characters long!",
            ));
        }
    }
    Ok(body)
}
