use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A logical fan-out scope.
///
/// Direct rooms are a pure function of the two identities and are never
/// materialized as stored rows; group rooms are explicit entities whose
/// membership lives in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomKey {
    Direct { a: Uuid, b: Uuid },
    Group(Uuid),
}

impl RoomKey {
    /// Canonical key for the unordered identity pair: both participants
    /// compute the same key regardless of who is sending.
    pub fn direct(x: Uuid, y: Uuid) -> Self {
        if x <= y {
            Self::Direct { a: x, b: y }
        } else {
            Self::Direct { a: y, b: x }
        }
    }

    pub fn group(id: Uuid) -> Self {
        Self::Group(id)
    }

    /// Stable key the persisted message log is indexed by.
    pub fn storage_key(&self) -> String {
        match self {
            Self::Direct { a, b } => format!("d:{a}:{b}"),
            Self::Group(id) => format!("g:{id}"),
        }
    }
}

/// Call media mode requested by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    #[default]
    Audio,
    Video,
}

/// Opaque end-to-end encrypted payload. The server stores and relays it
/// without ever decrypting; both fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub nonce: String,
}

/// Broad media category derived from the MIME type at upload time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Audio,
    Video,
    File,
}

impl MediaType {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.trim();
        if mime.is_empty() {
            return None;
        }
        if mime.starts_with("image/") {
            Some(Self::Image)
        } else if mime.starts_with("audio/") {
            Some(Self::Audio)
        } else if mime.starts_with("video/") {
            Some(Self::Video)
        } else if mime.starts_with("application/") || mime.starts_with("text/") {
            Some(Self::File)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::File => "file",
        }
    }
}

impl std::str::FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "file" => Ok(Self::File),
            other => Err(format!("unknown media type: {other}")),
        }
    }
}

/// Stable reference to an uploaded media blob. The router only ever carries
/// this reference; the bytes live with the upload store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub media_type: MediaType,
    pub url: String,
    pub mime_type: Option<String>,
    pub duration_seconds: Option<f64>,
}
