/// Database row types — these map directly to SQLite rows.
/// Distinct from parley-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct GroupRow {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub room_key: String,
    pub sender_id: String,
    pub sender_username: String,
    pub recipient_id: Option<String>,
    pub group_id: Option<String>,
    pub body: Option<String>,
    pub ciphertext: Option<Vec<u8>>,
    pub nonce: Option<Vec<u8>>,
    pub created_at: String,
    pub attachment: Option<AttachmentRow>,
}

pub struct AttachmentRow {
    pub media_type: String,
    pub storage_path: String,
    pub mime_type: Option<String>,
    pub duration_seconds: Option<f64>,
}

pub struct UploadTokenRow {
    pub token: String,
    pub user_id: String,
    pub storage_path: String,
    pub media_type: String,
    pub mime_type: Option<String>,
    pub duration_seconds: Option<f64>,
    pub created_at: String,
}

/// A message plus optional attachment, persisted in one transaction before
/// any fan-out happens.
pub struct NewMessage {
    pub id: String,
    pub room_key: String,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub group_id: Option<String>,
    pub body: Option<String>,
    pub ciphertext: Option<Vec<u8>>,
    pub nonce: Option<Vec<u8>>,
    pub created_at: String,
    pub attachment: Option<NewAttachment>,
}

pub struct NewAttachment {
    pub id: String,
    pub media_type: String,
    pub storage_path: String,
    pub mime_type: Option<String>,
    pub duration_seconds: Option<f64>,
}
