use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use kvant_types::api::{Claims, ReactionQuery, ReactionRequest};

use crate::error::status_for;
use crate::state::AppState;

/// Adding a reaction twice is not an error; `added` is false the second time.
pub async fn add_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ReactionRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let added = state
        .engine
        .add_reaction(&claims.sub, message_id, &req.emoji)
        .await
        .map_err(status_for)?;
    Ok(Json(serde_json::json!({ "success": true, "added": added })))
}

pub async fn remove_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Query(query): Query<ReactionQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let removed = state
        .engine
        .remove_reaction(&claims.sub, message_id, &query.emoji)
        .await
        .map_err(status_for)?;
    Ok(Json(serde_json::json!({ "success": true, "removed": removed })))
}
