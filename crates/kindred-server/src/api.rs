use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::Method,
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use kindred_coordinator::{ConnId, Coordinator};
use kindred_shared::models::{ChatMessage, ChatSession, Reaction, SessionSummary};
use kindred_shared::types::{ChatPreference, MessageId, SessionFilter, SessionId, UserId};

use crate::auth::{self, AuthUser};
use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::repo::SqliteRepository;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub repo: SqliteRepository,
    pub coordinator: Arc<Coordinator<SqliteRepository>>,
    pub rate_limiter: RateLimiter,
    /// Inbound frame budget for WebSocket connections.
    pub ws_limiter: RateLimiter<ConnId>,
}

impl AppState {
    pub fn token_ttl_secs(&self) -> i64 {
        self.config.token_ttl.as_secs() as i64
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::ws_handler))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/me", get(auth::me))
        .route("/auth/profile", put(auth::update_profile))
        .route("/auth/chat-preference", put(auth::update_chat_preference))
        .route("/chat", get(list_sessions))
        .route("/chat/start-search", post(start_search))
        .route("/chat/create-session", post(create_session))
        .route("/chat/block/{user_id}", post(block_user))
        .route("/chat/unblock/{user_id}", post(unblock_user))
        .route("/chat/{id}", get(get_session))
        .route("/chat/{id}/end", put(end_session))
        .route("/chat/{id}/archive", put(archive_session))
        .route("/chat/{id}/unarchive", put(unarchive_session))
        .route("/chat/{id}/messages", get(list_messages).post(post_message))
        .route("/chat/{id}/messages/search", get(search_messages))
        .route("/messages/{id}", put(edit_message).delete(delete_message))
        .route("/messages/{id}/reactions", post(add_reaction))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ListSessionsQuery {
    #[serde(default)]
    filter: SessionFilter,
}

async fn list_sessions(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let sessions = state.coordinator.list_sessions(user, query.filter).await?;
    Ok(Json(sessions))
}

async fn get_session(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<ChatSession>, ApiError> {
    Ok(Json(state.coordinator.get_session(user, id).await?))
}

#[derive(Serialize)]
struct EndedResponse {
    ended: bool,
}

async fn end_session(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<EndedResponse>, ApiError> {
    state.coordinator.end_session(user, id).await?;
    Ok(Json(EndedResponse { ended: true }))
}

async fn archive_session(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.coordinator.archive_session(user, id, true).await?;
    Ok(Json(serde_json::json!({ "archived": true })))
}

async fn unarchive_session(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.coordinator.archive_session(user, id, false).await?;
    Ok(Json(serde_json::json!({ "archived": false })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    partner_id: UserId,
    #[serde(default)]
    kind: Option<ChatPreference>,
}

async fn create_session(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<ChatSession>, ApiError> {
    let kind = req.kind.unwrap_or(ChatPreference::Friendship);
    let session = state
        .coordinator
        .create_session(user, req.partner_id, kind)
        .await?;
    Ok(Json(session))
}

async fn start_search(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.coordinator.start_search(user).await?;
    Ok(Json(serde_json::json!({ "searching": true })))
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    50
}

async fn list_messages(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let messages = state
        .coordinator
        .paginate_messages(user, id, query.page, query.limit)
        .await?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
struct PostMessageRequest {
    content: String,
}

async fn post_message(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(req): Json<PostMessageRequest>,
) -> Result<Json<ChatMessage>, ApiError> {
    let message = state.coordinator.send_message(user, id, &req.content).await?;
    Ok(Json(message))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_limit")]
    limit: u32,
}

async fn search_messages(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let messages = state
        .coordinator
        .search_messages(user, id, &query.q, query.limit)
        .await?;
    Ok(Json(messages))
}

#[derive(Deserialize)]
struct EditMessageRequest {
    content: String,
}

async fn edit_message(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<MessageId>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<ChatMessage>, ApiError> {
    let message = state
        .coordinator
        .edit_message(user, id, &req.content)
        .await?;
    Ok(Json(message))
}

async fn delete_message(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<MessageId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.coordinator.delete_message(user, id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Deserialize)]
struct ReactionRequest {
    emoji: String,
}

async fn add_reaction(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<MessageId>,
    Json(req): Json<ReactionRequest>,
) -> Result<Json<Reaction>, ApiError> {
    let reaction = state.coordinator.add_reaction(user, id, &req.emoji).await?;
    Ok(Json(reaction))
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

async fn block_user(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(blocked): Path<UserId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let blocked_set = {
        let db = state.repo.db().lock().await;
        db.block_user(user, blocked)?;
        db.blocked_by(user)?
    };
    state.coordinator.set_blocked(user, blocked_set).await;
    Ok(Json(serde_json::json!({ "blocked": true })))
}

async fn unblock_user(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(blocked): Path<UserId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let blocked_set = {
        let db = state.repo.db().lock().await;
        db.unblock_user(user, blocked)?;
        db.blocked_by(user)?
    };
    state.coordinator.set_blocked(user, blocked_set).await;
    Ok(Json(serde_json::json!({ "blocked": false })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    tracing::info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
