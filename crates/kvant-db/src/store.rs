use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use kvant_types::models::{ConversationPair, Message, Reaction, RecentChat, UserProfile};

/// Which visibility flag a delete sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityChange {
    /// Global soft delete: sets `deleted_at` and redacts the text.
    Everyone { at: DateTime<Utc> },
    ForSender,
    ForReceiver,
}

/// Persistence operations the message lifecycle depends on.
///
/// Implementations must be safe to call concurrently. Calls are blocking;
/// async callers go through `spawn_blocking`. Mutations return whether a row
/// actually changed so callers can skip notifications for no-ops.
pub trait MessageStore: Send + Sync {
    fn insert_message(&self, msg: &Message) -> Result<()>;

    fn get_message(&self, id: Uuid) -> Result<Option<Message>>;

    fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;

    /// Sets text and `edited_at`. Refuses (returns false) on globally deleted rows.
    fn update_message_text(&self, id: Uuid, text: &str, edited_at: DateTime<Utc>) -> Result<bool>;

    fn set_message_visibility(&self, id: Uuid, change: VisibilityChange) -> Result<bool>;

    /// Clears any pin in `pair` and pins `id`, as one transaction.
    /// Returns false (and changes nothing) if `id` is not a live message of `pair`.
    fn set_pinned(&self, pair: &ConversationPair, id: Uuid, pinned_at: DateTime<Utc>) -> Result<bool>;

    fn clear_pinned(&self, id: Uuid) -> Result<bool>;

    /// Marks every unread message `from -> to` as read. Returns the number of rows changed.
    fn mark_messages_read(&self, from: &str, to: &str, read_at: DateTime<Utc>) -> Result<usize>;

    /// Returns false if the tuple already existed.
    fn add_reaction(&self, message_id: Uuid, user_id: &str, emoji: &str) -> Result<bool>;

    fn remove_reaction(&self, message_id: Uuid, user_id: &str, emoji: &str) -> Result<bool>;

    /// The newest `limit` messages of the pair still visible to `viewer`,
    /// oldest first. Globally deleted rows and rows hidden for the viewer's
    /// role are excluded before the limit applies.
    fn list_messages(&self, pair: &ConversationPair, viewer: &str, limit: u32) -> Result<Vec<Message>>;

    fn list_reactions(&self, message_ids: &[Uuid]) -> Result<Vec<Reaction>>;

    fn recent_chats(&self, user_id: &str, limit: u32) -> Result<Vec<RecentChat>>;
}
