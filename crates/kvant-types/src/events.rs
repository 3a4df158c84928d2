use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageType, RepliedMessage, UserId};

/// Events sent FROM client TO server, one per WebSocket text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Send a direct message. `[image]<url>` / `[file]<url>` text prefixes
    /// mark attachments.
    SendMessage {
        receiver_id: UserId,
        text: String,
        #[serde(default, deserialize_with = "blank_uuid_as_none")]
        reply_to_id: Option<Uuid>,
    },

    /// Older clients send a bare `typing` for start.
    #[serde(alias = "typing")]
    TypingStart { receiver_id: UserId },

    TypingStop { receiver_id: UserId },

    /// Mark every message from `sender_id` to self as read.
    MarkRead { sender_id: UserId },
}

/// Events sent FROM server TO client. Serialized flat with a `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Delivered to the receiver only; the sender renders optimistically.
    NewMessage {
        id: Uuid,
        sender_id: UserId,
        receiver_id: UserId,
        text: String,
        message_type: MessageType,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_url: Option<String>,
        sender_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_avatar_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        replied_message: Option<RepliedMessage>,
        is_read: bool,
        created_at: DateTime<Utc>,
    },

    /// Full message after an edit.
    MessageEdited(Message),

    MessageDeleted {
        id: Uuid,
        deleted_for_everyone: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        deleted_for: Option<UserId>,
    },

    ReactionAdded {
        message_id: Uuid,
        user_id: UserId,
        emoji: String,
    },

    ReactionRemoved {
        message_id: Uuid,
        user_id: UserId,
        emoji: String,
    },

    MessagePinned {
        message_id: Uuid,
        pinned_at: DateTime<Utc>,
        pinner_id: UserId,
    },

    MessageUnpinned { message_id: Uuid },

    /// Read receipt, delivered to the original sender.
    MessagesRead {
        reader_id: UserId,
        sender_id: UserId,
        read_at: DateTime<Utc>,
    },

    TypingStart { user_id: UserId },

    TypingStop { user_id: UserId },

    /// Presence snapshot, broadcast on every register/unregister.
    OnlineUsers { users: Vec<UserId> },
}

impl ServerEvent {
    pub fn new_message(
        msg: &Message,
        sender_name: String,
        sender_avatar_url: Option<String>,
        replied_message: Option<RepliedMessage>,
    ) -> Self {
        Self::NewMessage {
            id: msg.id,
            sender_id: msg.sender_id.clone(),
            receiver_id: msg.receiver_id.clone(),
            text: msg.text.clone(),
            message_type: msg.message_type,
            file_url: msg.file_url.clone(),
            sender_name,
            sender_avatar_url,
            reply_to_id: msg.reply_to_id,
            replied_message,
            is_read: false,
            created_at: msg.created_at,
        }
    }

    /// Wire name of the event, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::MessageEdited(_) => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::ReactionAdded { .. } => "reaction_added",
            Self::ReactionRemoved { .. } => "reaction_removed",
            Self::MessagePinned { .. } => "message_pinned",
            Self::MessageUnpinned { .. } => "message_unpinned",
            Self::MessagesRead { .. } => "messages_read",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::OnlineUsers { .. } => "online_users",
        }
    }
}

/// Clients send `"reply_to_id": ""` when not replying.
fn blank_uuid_as_none<'de, D>(deserializer: D) -> Result<Option<Uuid>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}
