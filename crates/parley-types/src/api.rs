use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AttachmentRef, EncryptedPayload, MediaType};

// -- JWT Claims --

/// JWT claims shared across parley-api (REST middleware) and parley-server
/// (WebSocket upgrade authentication). Canonical definition lives here in
/// parley-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- History --

#[derive(Debug, Serialize)]
pub struct HistoryMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub body: Option<String>,
    pub attachment: Option<AttachmentRef>,
    pub encrypted: Option<EncryptedPayload>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// -- Groups --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct GroupResponse {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// -- Uploads --

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub token: String,
    pub media_type: MediaType,
    pub url: String,
}
