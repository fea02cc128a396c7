use axum::{
    Extension, Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use tracing::{error, info};
use uuid::Uuid;

use parley_types::api::{Claims, UploadResponse};
use parley_types::models::MediaType;

use crate::auth::AppState;

/// Upload size limit; the body extractor enforces it at the server layer,
/// this is a belt check for callers that lie about content length.
pub const MAX_UPLOAD_SIZE: usize = 25 * 1024 * 1024;

/// POST /uploads — accept a raw media blob and issue a single-use token
/// that a later message can attach. The message router consumes the token;
/// unconsumed tokens expire after an hour.
///
/// The blob arrives as the request body; `Content-Type` determines the
/// media category, the optional `X-Filename` header supplies an extension,
/// and `X-Duration` carries clip length in seconds for audio/video.
pub async fn create_upload(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    if body.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if body.len() > MAX_UPLOAD_SIZE {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let media_type = mime_type
        .as_deref()
        .and_then(MediaType::from_mime)
        .ok_or(StatusCode::BAD_REQUEST)?;

    let duration_seconds = headers
        .get("x-duration")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok());

    let extension = headers
        .get("x-filename")
        .and_then(|v| v.to_str().ok())
        .and_then(|name| std::path::Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();

    let filename = format!("{}{}", Uuid::new_v4().simple(), extension);
    let path = state.upload_dir.join(&filename);

    tokio::fs::write(&path, &body).await.map_err(|e| {
        error!("Unable to save uploaded file: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let token = Uuid::new_v4().simple().to_string();
    let created = {
        let db = state.db.clone();
        let tok = token.clone();
        let uid = claims.sub.to_string();
        let fname = filename.clone();
        let mime = mime_type.clone();
        let now = chrono::Utc::now().to_rfc3339();
        tokio::task::spawn_blocking(move || {
            db.create_upload_token(
                &tok,
                &uid,
                &fname,
                media_type.as_str(),
                mime.as_deref(),
                duration_seconds,
                &now,
            )
        })
        .await
    };

    match created {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Unable to record upload token: {}", e);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    info!(
        "{} uploaded {} blob {} ({} bytes)",
        claims.username,
        media_type.as_str(),
        filename,
        body.len()
    );

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            token,
            media_type,
            url: format!("/uploads/{filename}"),
        }),
    ))
}
