use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::auth::{self, AppState, AppStateInner};
use parley_api::middleware::require_auth;
use parley_api::{groups, history, uploads};
use parley_gateway::connection;
use parley_gateway::{Coordinator, translate::HttpTranslator};
use parley_types::api::Claims;

#[derive(Clone)]
struct ServerState {
    coordinator: Coordinator,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into());
    let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLEY_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let upload_dir =
        PathBuf::from(std::env::var("PARLEY_UPLOAD_DIR").unwrap_or_else(|_| "uploads".into()));
    let translate_url = std::env::var("PARLEY_TRANSLATE_URL").ok();

    // Init database and upload storage
    let db = Arc::new(parley_db::Database::open(&PathBuf::from(&db_path))?);
    tokio::fs::create_dir_all(&upload_dir).await?;

    // Shared state
    let translator = Arc::new(HttpTranslator::new(translate_url));
    let coordinator = Coordinator::new(db.clone(), translator);
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret: jwt_secret.clone(),
        coordinator: coordinator.clone(),
        upload_dir: upload_dir.clone(),
    });

    let state = ServerState {
        coordinator,
        jwt_secret,
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/groups", post(groups::create_group))
        .route("/groups", get(groups::list_groups))
        .route("/groups/{group_id}/join", post(groups::join_group))
        .route("/groups/{group_id}/leave", post(groups::leave_group))
        .route("/history/direct/{peer_id}", get(history::direct_history))
        .route("/history/group/{group_id}", get(history::group_history))
        .route(
            "/api/uploads",
            post(uploads::create_upload).layer(DefaultBodyLimit::max(uploads::MAX_UPLOAD_SIZE)),
        )
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .nest_service("/uploads", ServeDir::new(&upload_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Deserialize)]
struct GatewayParams {
    token: String,
}

/// The JWT is validated here, at the upgrade layer; the gateway trusts the
/// resulting identity for the connection's lifetime.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(params): Query<GatewayParams>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let token_data = decode::<Claims>(
        &params.token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let user_id = token_data.claims.sub;
    let username = token_data.claims.username;

    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection_authenticated(socket, state.coordinator, user_id, username)
    }))
}
