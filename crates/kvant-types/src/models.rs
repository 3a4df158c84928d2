use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque user identifier handed to us by the authentication layer.
/// The core never parses or validates it beyond non-emptiness.
pub type UserId = String;

/// Text stored in place of a message that was deleted for everyone.
pub const DELETED_PLACEHOLDER: &str = "[deleted]";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            other => Err(format!("unknown message type '{}'", other)),
        }
    }
}

/// The unordered pair of users a direct conversation belongs to.
/// `ConversationPair::new(a, b) == ConversationPair::new(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationPair {
    low: UserId,
    high: UserId,
}

impl ConversationPair {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self { low: a.to_string(), high: b.to_string() }
        } else {
            Self { low: b.to_string(), high: a.to_string() }
        }
    }

    pub fn members(&self) -> (&str, &str) {
        (&self.low, &self.high)
    }
}

/// A direct message as persisted. Never physically removed; deletion only
/// flips the visibility fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
    pub is_read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_for_sender: bool,
    pub deleted_for_receiver: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn pair(&self) -> ConversationPair {
        ConversationPair::new(&self.sender_id, &self.receiver_id)
    }

    pub fn is_party(&self, user_id: &str) -> bool {
        self.sender_id == user_id || self.receiver_id == user_id
    }

    /// Deleted for everyone. Dominates the per-party flags.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether `user_id` should still see this message in their history.
    pub fn visible_to(&self, user_id: &str) -> bool {
        if self.is_deleted() || !self.is_party(user_id) {
            return false;
        }
        let hidden_as_sender = self.sender_id == user_id && self.deleted_for_sender;
        let hidden_as_receiver = self.receiver_id == user_id && self.deleted_for_receiver;
        !(hidden_as_sender || hidden_as_receiver)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: Uuid,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

/// Display data for a user, owned by the account system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// One-hop summary of the message being replied to. Reply chains are never
/// walked further than this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepliedMessage {
    pub id: Uuid,
    pub sender_id: UserId,
    pub text: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

impl From<&Message> for RepliedMessage {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id,
            sender_id: msg.sender_id.clone(),
            text: msg.text.clone(),
            message_type: msg.message_type,
            file_url: msg.file_url.clone(),
        }
    }
}

/// A counterpart the user has exchanged messages with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentChat {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub last_message_time: DateTime<Utc>,
}
