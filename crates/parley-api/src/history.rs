use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::Deserialize;
use tracing::{error, warn};
use uuid::Uuid;

use parley_db::models::MessageRow;
use parley_types::api::{Claims, HistoryMessage};
use parley_types::models::{AttachmentRef, EncryptedPayload, MediaType, RoomKey};

use crate::auth::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination — pass the `created_at` timestamp of the
    /// oldest message from the previous page to fetch older messages.
    pub before: Option<String>,
}

fn default_limit() -> u32 {
    50
}

/// GET /history/direct/{peer_id} — the caller's conversation with one peer.
/// Read-only; not part of the routing hot path.
pub async fn direct_history(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let key = RoomKey::direct(claims.sub, peer_id);
    fetch_room(state, key, query).await
}

/// GET /history/group/{group_id} — requires current membership.
pub async fn group_history(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let is_member = {
        let db = state.db.clone();
        let gid = group_id.to_string();
        let uid = claims.sub.to_string();
        tokio::task::spawn_blocking(move || db.is_group_member(&gid, &uid))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    };
    if !is_member {
        return Err(StatusCode::FORBIDDEN);
    }

    fetch_room(state, RoomKey::group(group_id), query).await
}

async fn fetch_room(
    state: AppState,
    key: RoomKey,
    query: HistoryQuery,
) -> Result<Json<Vec<HistoryMessage>>, StatusCode> {
    let db = state.db.clone();
    let room_key = key.storage_key();
    let limit = query.limit.min(200);
    let before = query.before;

    let rows = tokio::task::spawn_blocking(move || {
        db.get_room_messages(&room_key, limit, before.as_deref())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(rows.into_iter().map(row_to_message).collect()))
}

fn row_to_message(row: MessageRow) -> HistoryMessage {
    let encrypted = match (&row.ciphertext, &row.nonce) {
        (Some(ciphertext), Some(nonce)) => Some(EncryptedPayload {
            ciphertext: B64.encode(ciphertext),
            nonce: B64.encode(nonce),
        }),
        _ => None,
    };

    let attachment = row.attachment.map(|att| AttachmentRef {
        media_type: att.media_type.parse::<MediaType>().unwrap_or_else(|e| {
            warn!("Corrupt media type on message '{}': {}", row.id, e);
            MediaType::File
        }),
        url: format!("/uploads/{}", att.storage_path),
        mime_type: att.mime_type,
        duration_seconds: att.duration_seconds,
    });

    HistoryMessage {
        id: row.id.parse().unwrap_or_else(|e| {
            warn!("Corrupt message id '{}': {}", row.id, e);
            Uuid::default()
        }),
        sender_id: row.sender_id.parse().unwrap_or_else(|e| {
            warn!("Corrupt sender_id '{}' on message '{}': {}", row.sender_id, row.id, e);
            Uuid::default()
        }),
        sender_username: row.sender_username,
        body: row.body,
        attachment,
        encrypted,
        created_at: row
            .created_at
            .parse::<chrono::DateTime<chrono::Utc>>()
            .unwrap_or_else(|e| {
                warn!("Corrupt created_at '{}' on message '{}': {}", row.created_at, row.id, e);
                chrono::DateTime::default()
            }),
    }
}
