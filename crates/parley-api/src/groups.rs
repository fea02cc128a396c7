use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{error, info};
use uuid::Uuid;

use parley_db::models::GroupRow;
use parley_types::api::{Claims, CreateGroupRequest, GroupResponse};

use crate::auth::AppState;

/// POST /groups — create a group owned by the caller. The owner becomes a
/// member immediately, in the database and in the live room table.
pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let name = req.name.trim().to_string();
    if name.is_empty() || name.len() > 100 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let group_id = Uuid::new_v4();
    {
        let db = state.db.clone();
        let gid = group_id.to_string();
        let owner = claims.sub.to_string();
        let gname = name.clone();
        tokio::task::spawn_blocking(move || db.create_group(&gid, &gname, &owner))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    }

    state
        .coordinator
        .rooms()
        .join_group(claims.sub, group_id)
        .await;

    info!("{} created group {} ({})", claims.username, name, group_id);
    Ok((
        StatusCode::CREATED,
        Json(GroupResponse {
            id: group_id,
            name,
            owner_id: claims.sub,
            created_at: chrono::Utc::now(),
        }),
    ))
}

/// POST /groups/{group_id}/join
pub async fn join_group(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    {
        let db = state.db.clone();
        let gid = group_id.to_string();
        let uid = claims.sub.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            if db.get_group(&gid)?.is_none() {
                return Ok(false);
            }
            db.add_group_member(&gid, &uid)?;
            Ok(true)
        })
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .then_some(())
        .ok_or(StatusCode::NOT_FOUND)?;
    }

    // Membership is live immediately; no reconnect needed for fan-out
    state
        .coordinator
        .rooms()
        .join_group(claims.sub, group_id)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /groups/{group_id}/leave
pub async fn leave_group(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    {
        let db = state.db.clone();
        let gid = group_id.to_string();
        let uid = claims.sub.to_string();
        tokio::task::spawn_blocking(move || db.remove_group_member(&gid, &uid))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    }

    state
        .coordinator
        .rooms()
        .leave_group(claims.sub, group_id)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /groups — the caller's groups.
pub async fn list_groups(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();
    let rows = tokio::task::spawn_blocking(move || db.groups_for_user(&uid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let groups: Vec<GroupResponse> = rows.into_iter().map(row_to_group).collect();
    Ok(Json(groups))
}

fn row_to_group(row: GroupRow) -> GroupResponse {
    GroupResponse {
        id: row.id.parse().unwrap_or_default(),
        name: row.name,
        owner_id: row.owner_id.parse().unwrap_or_default(),
        created_at: row
            .created_at
            .parse::<chrono::DateTime<chrono::Utc>>()
            .or_else(|_| {
                // SQLite default timestamps are "YYYY-MM-DD HH:MM:SS"
                // without timezone; parse as naive UTC and convert.
                chrono::NaiveDateTime::parse_from_str(&row.created_at, "%Y-%m-%d %H:%M:%S")
                    .map(|ndt| ndt.and_utc())
            })
            .unwrap_or_default(),
    }
}
