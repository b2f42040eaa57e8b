/// Live chat endpoints: WebSocket upgrade and message REST calls
use crate::{
    api::middleware::{check_origin, require_user, AuthUser},
    chat::{connection, ChatMessage},
    context::AppContext,
    error::AppResult,
};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 200;

/// Build chat routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/ws/chat", get(chat_socket))
        .route("/api/chat/messages", get(list_messages).post(post_message))
        .route("/api/chat/messages/:id", delete(delete_message))
}

/// Upgrade to the chat protocol. Origin is checked before the session.
async fn chat_socket(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    check_origin(&headers, &ctx.config.chat.allowed_origins)?;
    let user = require_user(&ctx, &headers).await?;

    tracing::debug!(user_id = user.id, family_id = user.family_id, "Chat upgrade accepted");

    let hub = ctx.hub.clone();
    Ok(ws.on_upgrade(move |socket| connection::serve(socket, hub, user)))
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl PageParams {
    /// Clamped limit and offset
    pub fn window(&self) -> (usize, usize) {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        (limit, self.offset.unwrap_or(0))
    }
}

#[derive(Debug, Serialize)]
struct MessagesResponse {
    messages: Vec<ChatMessage>,
}

async fn list_messages(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Query(params): Query<PageParams>,
) -> AppResult<Json<MessagesResponse>> {
    let (limit, offset) = params.window();
    let messages = ctx.chat.list_messages(&user, limit, offset).await?;
    Ok(Json(MessagesResponse { messages }))
}

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    content: String,
    #[serde(default)]
    client_id: Option<String>,
}

async fn post_message(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Json(req): Json<PostMessageRequest>,
) -> AppResult<impl IntoResponse> {
    let message = ctx
        .chat
        .submit_message(&user, &req.content, req.client_id)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn delete_message(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Path(id): Path<u64>,
) -> AppResult<StatusCode> {
    ctx.chat.delete_message(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
