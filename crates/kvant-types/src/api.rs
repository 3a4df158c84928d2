use serde::{Deserialize, Serialize};

use crate::models::{Message, RepliedMessage, UserId};

// -- JWT Claims --

/// Claims of the externally issued access token. Shared by the REST
/// middleware and the WebSocket upgrade so both agree on the user identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    #[serde(default)]
    pub username: String,
    pub exp: usize,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteMessageRequest {
    #[serde(default)]
    pub delete_for_everyone: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteMessageResponse {
    pub success: bool,
    pub deleted_for_everyone: bool,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub success: bool,
    pub updated: usize,
}

/// A history row: the stored message plus display data.
#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    #[serde(flatten)]
    pub message: Message,
    pub sender_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replied_message: Option<RepliedMessage>,
    pub reactions: Vec<ReactionGroup>,
}

// -- Reactions --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Deserialize)]
pub struct ReactionQuery {
    #[serde(default)]
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}
