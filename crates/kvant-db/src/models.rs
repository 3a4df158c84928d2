//! Database row types. These map directly to SQLite rows and are converted
//! into the shared `kvant-types` models at the store boundary.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use kvant_types::models::{Message, Reaction, RecentChat, UserProfile};

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    pub message_type: String,
    pub file_url: Option<String>,
    pub reply_to_id: Option<String>,
    pub is_read: bool,
    pub read_at: Option<String>,
    pub edited_at: Option<String>,
    pub deleted_at: Option<String>,
    pub deleted_for_sender: bool,
    pub deleted_for_receiver: bool,
    pub pinned_at: Option<String>,
    pub created_at: String,
}

/// Column list matching `MessageRow::from_row`.
pub const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, text, message_type, file_url, \
     reply_to_id, is_read, read_at, edited_at, deleted_at, deleted_for_sender, \
     deleted_for_receiver, pinned_at, created_at";

impl MessageRow {
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sender_id: row.get(1)?,
            receiver_id: row.get(2)?,
            text: row.get(3)?,
            message_type: row.get(4)?,
            file_url: row.get(5)?,
            reply_to_id: row.get(6)?,
            is_read: row.get(7)?,
            read_at: row.get(8)?,
            edited_at: row.get(9)?,
            deleted_at: row.get(10)?,
            deleted_for_sender: row.get(11)?,
            deleted_for_receiver: row.get(12)?,
            pinned_at: row.get(13)?,
            created_at: row.get(14)?,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        Ok(Message {
            id: row.id.parse().with_context(|| format!("corrupt message id '{}'", row.id))?,
            message_type: row
                .message_type
                .parse()
                .map_err(|e: String| anyhow::anyhow!("message {}: {}", row.id, e))?,
            reply_to_id: row
                .reply_to_id
                .as_deref()
                .map(str::parse)
                .transpose()
                .with_context(|| format!("corrupt reply_to_id on message '{}'", row.id))?,
            read_at: parse_opt_timestamp(row.read_at.as_deref())?,
            edited_at: parse_opt_timestamp(row.edited_at.as_deref())?,
            deleted_at: parse_opt_timestamp(row.deleted_at.as_deref())?,
            pinned_at: parse_opt_timestamp(row.pinned_at.as_deref())?,
            created_at: parse_timestamp(&row.created_at)?,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            text: row.text,
            file_url: row.file_url,
            is_read: row.is_read,
            deleted_for_sender: row.deleted_for_sender,
            deleted_for_receiver: row.deleted_for_receiver,
        })
    }
}

pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

impl TryFrom<ReactionRow> for Reaction {
    type Error = anyhow::Error;

    fn try_from(row: ReactionRow) -> Result<Self> {
        Ok(Reaction {
            message_id: row
                .message_id
                .parse()
                .with_context(|| format!("corrupt reaction message_id '{}'", row.message_id))?,
            created_at: parse_timestamp(&row.created_at)?,
            user_id: row.user_id,
            emoji: row.emoji,
        })
    }
}

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub avatar_url: Option<String>,
}

impl From<UserRow> for UserProfile {
    fn from(row: UserRow) -> Self {
        UserProfile {
            id: row.id,
            username: row.username,
            avatar_url: row.avatar_url,
        }
    }
}

pub struct RecentChatRow {
    pub id: String,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub last_message_time: String,
}

impl TryFrom<RecentChatRow> for RecentChat {
    type Error = anyhow::Error;

    fn try_from(row: RecentChatRow) -> Result<Self> {
        Ok(RecentChat {
            last_message_time: parse_timestamp(&row.last_message_time)?,
            username: row.username.unwrap_or_else(|| "unknown".to_string()),
            id: row.id,
            avatar_url: row.avatar_url,
        })
    }
}

/// Timestamps are stored as RFC 3339 UTC with millisecond precision so that
/// lexical order in SQLite equals chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') stores "YYYY-MM-DD HH:MM:SS" without timezone.
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .with_context(|| format!("corrupt timestamp '{}'", raw))
}

fn parse_opt_timestamp(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_timestamp).transpose()
}
