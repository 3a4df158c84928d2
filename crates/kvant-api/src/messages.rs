use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use kvant_types::api::{
    Claims, DeleteMessageRequest, DeleteMessageResponse, EditMessageRequest, MarkReadResponse,
    SuccessResponse,
};

use crate::error::status_for;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Defaults to 100, capped at 200.
    pub limit: Option<u32>,
}

/// Conversation between the caller and user `{id}`, oldest first.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(other_user): Path<String>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let messages = state
        .engine
        .conversation(&claims.sub, &other_user, query.limit)
        .await
        .map_err(status_for)?;
    Ok(Json(messages))
}

pub async fn recent_chats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let chats = state.engine.recent_chats(&claims.sub).await.map_err(status_for)?;
    Ok(Json(chats))
}

/// Marks everything user `{id}` sent to the caller as read.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(sender_id): Path<String>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let updated = state
        .engine
        .mark_read(&claims.sub, &sender_id)
        .await
        .map_err(status_for)?;
    Ok(Json(MarkReadResponse {
        success: true,
        updated,
    }))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let message = state
        .engine
        .edit_message(&claims.sub, message_id, req.text)
        .await
        .map_err(status_for)?;
    Ok(Json(message))
}

/// The body is optional; without one the message is hidden for the caller only.
pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let req: DeleteMessageRequest = if body.is_empty() {
        DeleteMessageRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?
    };

    state
        .engine
        .delete_message(&claims.sub, message_id, req.delete_for_everyone)
        .await
        .map_err(status_for)?;
    Ok(Json(DeleteMessageResponse {
        success: true,
        deleted_for_everyone: req.delete_for_everyone,
    }))
}

pub async fn pin_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let pinned_at = state
        .engine
        .pin_message(&claims.sub, message_id)
        .await
        .map_err(status_for)?;
    Ok(Json(serde_json::json!({ "success": true, "pinned_at": pinned_at })))
}

pub async fn unpin_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .engine
        .unpin_message(&claims.sub, message_id)
        .await
        .map_err(status_for)?;
    Ok(Json(SuccessResponse::ok()))
}
