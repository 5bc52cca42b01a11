//! HTTP surface: conversation/group management plus the websocket upgrade.
//!
//! Authentication happens upstream; handlers trust the `x-user-id` header
//! as the acting user.  Everything mutating goes through the engine so
//! that fan-out and locking stay consistent with the push channel.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::ws::WebSocketUpgrade,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use parley_shared::{Conversation, ConversationId, Message, User, UserId};

use crate::engine::{ChatEngine, MembershipChange};
use crate::error::ServerError;
use crate::session::run_session;

pub type AppState = Arc<ChatEngine>;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .route("/users", post(register_user))
        .route("/conversations", get(list_conversations))
        .route("/conversations/direct", post(open_direct))
        .route("/conversations/:id/messages", get(conversation_messages))
        .route("/groups", post(create_group))
        .route("/groups/:id/name", put(rename_group))
        .route("/groups/:id/members", post(add_member))
        .route("/groups/:id/members/:user_id", delete(remove_member))
        .route("/groups/:id/admins", post(promote_admin))
        .route("/groups/:id/admins/:user_id", delete(demote_admin))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the HTTP listener and serve until the task is cancelled.
pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP API listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Acting user, taken from the `x-user-id` header set by the auth gateway.
pub struct ActingUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for ActingUser
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ServerError::BadRequest("missing x-user-id header".to_string()))?;
        let id = header
            .parse::<Uuid>()
            .map_err(|_| ServerError::BadRequest("malformed x-user-id header".to_string()))?;
        Ok(ActingUser(UserId(id)))
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenDirectRequest {
    peer_id: UserId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupRequest {
    name: String,
    member_ids: Vec<UserId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameGroupRequest {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberRequest {
    user_id: UserId,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ws_upgrade(State(engine): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    if engine.hub.connection_count().await >= engine.config.max_connections {
        tracing::warn!("connection cap reached, refusing websocket upgrade");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    upgrade.on_upgrade(move |socket| run_session(socket, engine))
}

/// Upsert the caller's profile snapshot.  Identity is owned by the auth
/// gateway; this only mirrors what the chat core needs for previews.
async fn register_user(
    State(engine): State<AppState>,
    Json(user): Json<User>,
) -> Result<StatusCode, ServerError> {
    engine.upsert_user(&user).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_conversations(
    State(engine): State<AppState>,
    ActingUser(user): ActingUser,
) -> Result<Json<Vec<Conversation>>, ServerError> {
    Ok(Json(engine.conversations_for_user(user).await?))
}

async fn open_direct(
    State(engine): State<AppState>,
    ActingUser(user): ActingUser,
    Json(req): Json<OpenDirectRequest>,
) -> Result<Json<Conversation>, ServerError> {
    Ok(Json(engine.open_direct(user, req.peer_id).await?))
}

async fn conversation_messages(
    State(engine): State<AppState>,
    ActingUser(user): ActingUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, ServerError> {
    Ok(Json(
        engine
            .messages_for_conversation(user, ConversationId(id))
            .await?,
    ))
}

async fn create_group(
    State(engine): State<AppState>,
    ActingUser(user): ActingUser,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<Conversation>, ServerError> {
    Ok(Json(
        engine.create_group(user, &req.name, &req.member_ids).await?,
    ))
}

async fn rename_group(
    State(engine): State<AppState>,
    ActingUser(user): ActingUser,
    Path(id): Path<Uuid>,
    Json(req): Json<RenameGroupRequest>,
) -> Result<Json<Conversation>, ServerError> {
    Ok(Json(
        engine
            .rename_group(user, ConversationId(id), &req.name)
            .await?,
    ))
}

async fn add_member(
    State(engine): State<AppState>,
    ActingUser(user): ActingUser,
    Path(id): Path<Uuid>,
    Json(req): Json<MemberRequest>,
) -> Result<Json<MembershipChange>, ServerError> {
    Ok(Json(
        engine
            .add_member(user, ConversationId(id), req.user_id)
            .await?,
    ))
}

async fn remove_member(
    State(engine): State<AppState>,
    ActingUser(user): ActingUser,
    Path((id, target)): Path<(Uuid, Uuid)>,
) -> Result<Json<MembershipChange>, ServerError> {
    Ok(Json(
        engine
            .remove_member(user, ConversationId(id), UserId(target))
            .await?,
    ))
}

async fn promote_admin(
    State(engine): State<AppState>,
    ActingUser(user): ActingUser,
    Path(id): Path<Uuid>,
    Json(req): Json<MemberRequest>,
) -> Result<Json<MembershipChange>, ServerError> {
    Ok(Json(
        engine
            .promote_admin(user, ConversationId(id), req.user_id)
            .await?,
    ))
}

async fn demote_admin(
    State(engine): State<AppState>,
    ActingUser(user): ActingUser,
    Path((id, target)): Path<(Uuid, Uuid)>,
) -> Result<Json<MembershipChange>, ServerError> {
    Ok(Json(
        engine
            .demote_admin(user, ConversationId(id), UserId(target))
            .await?,
    ))
}
