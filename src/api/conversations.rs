//! Conversation handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use super::{prepare_metadata, AppState};
use crate::auth::AuthContext;
use crate::error::ServiceError;
use crate::types::{CreateConversationRequest, SendMessageRequest};
use crate::validation;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// POST /api/v1/conversations
pub async fn create_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    prepare_metadata(req.metadata.clone())?;
    let (conversation, first_message) = state
        .conversations
        .create_conversation(&ctx.user_id, req.title, req.initial_message)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "conversation": conversation,
            "message": first_message,
        })),
    ))
}

/// GET /api/v1/conversations
pub async fn list_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let conversations = state
        .conversations
        .list_conversations(
            &ctx.user_id,
            query.limit.unwrap_or(50).min(100),
            query.offset.unwrap_or(0),
            query.include_archived,
        )
        .await;

    let count = conversations.len();
    Json(json!({
        "conversations": conversations,
        "count": count,
    }))
}

/// GET /api/v1/conversations/{id}
pub async fn get_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let conversation = state
        .conversations
        .get_conversation(&conversation_id, &ctx.user_id)
        .await?;
    Ok(Json(json!({ "conversation": conversation })))
}

/// DELETE /api/v1/conversations/{id} - archives, never destroys
pub async fn archive_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let conversation = state
        .conversations
        .archive_conversation(&conversation_id, &ctx.user_id)
        .await?;
    Ok(Json(json!({
        "conversation": conversation,
        "message": "Conversation archived",
    })))
}

/// POST /api/v1/conversations/{id}/messages
pub async fn send_message_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(conversation_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    prepare_metadata(req.metadata.clone())?;
    validation::validate_send_message(&req)?;
    let reply = state
        .conversations
        .send_message(&conversation_id, &ctx.user_id, &req.content)
        .await?;
    Ok(Json(json!({ "message": reply })))
}

/// GET /api/v1/conversations/{id}/history
pub async fn history_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let limit = query.limit.unwrap_or(50).min(200);
    let offset = query.offset.unwrap_or(0);

    let messages = state
        .conversations
        .get_history(&conversation_id, &ctx.user_id, limit, offset)
        .await?;

    let count = messages.len();
    Ok(Json(json!({
        "conversation_id": conversation_id,
        "messages": messages,
        "pagination": {
            "limit": limit,
            "offset": offset,
            "count": count,
        },
    })))
}
