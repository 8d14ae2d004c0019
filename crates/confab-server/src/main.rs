use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use confab_api::auth::{self, AppState, AppStateInner};
use confab_api::middleware::require_auth;
use confab_api::{chats, files, messages};
use confab_gateway::connection::{self, ConnectQuery, HandshakeError};
use confab_gateway::registry::SubscriptionRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confab=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let db_path = std::env::var("CONFAB_DB_PATH").unwrap_or_else(|_| "confab.db".into());
    let upload_dir = std::env::var("CONFAB_UPLOAD_DIR").unwrap_or_else(|_| "uploads".into());
    let host = std::env::var("CONFAB_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("CONFAB_PORT")
        .unwrap_or_else(|_| "8000".into())
        .parse()?;

    // Init database
    let db = Arc::new(confab_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let registry = SubscriptionRegistry::new();
    let state: AppState = Arc::new(AppStateInner {
        db,
        registry,
        upload_dir: PathBuf::from(upload_dir),
    });

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/chat", post(chats::create_chat).get(chats::list_chats))
        .route("/chat/{chat_id}", get(chats::get_chat))
        .route("/chat/{chat_id}/close", post(chats::close_chat))
        .route(
            "/chat/{chat_id}/messages",
            get(messages::list_messages).post(messages::send_message),
        )
        .route(
            "/chat/{chat_id}/messages/{message_id}/viewed",
            post(messages::mark_viewed),
        )
        .route(
            "/chat/{chat_id}/messages/{message_id}/files",
            post(files::upload_file),
        )
        .route(
            "/files/{file_id}",
            get(files::download_file).delete(files::delete_file),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/ws/chat/{chat_id}", get(ws_subscribe))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(DefaultBodyLimit::max(files::MAX_FILE_SIZE))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Confab server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Websocket entry: the handshake (token + membership) runs before the
/// upgrade, so refusals surface as plain HTTP statuses instead of a
/// half-open socket.
async fn ws_subscribe(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let user = tokio::time::timeout(
        connection::HANDSHAKE_TIMEOUT,
        connection::authenticate_subscriber(state.db.clone(), query.token, chat_id),
    )
    .await
    .map_err(|_| StatusCode::REQUEST_TIMEOUT)?
    .map_err(|e| match e {
        HandshakeError::Unauthenticated => StatusCode::UNAUTHORIZED,
        HandshakeError::Forbidden => StatusCode::FORBIDDEN,
        HandshakeError::Internal(err) => {
            error!("handshake failed: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    })?;

    let registry = state.registry.clone();
    Ok(ws.on_upgrade(move |socket| connection::serve_subscriber(socket, registry, chat_id, user)))
}
