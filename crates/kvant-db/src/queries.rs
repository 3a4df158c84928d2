use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use uuid::Uuid;

use kvant_types::models::{
    ConversationPair, DELETED_PLACEHOLDER, Message, Reaction, RecentChat, UserProfile,
};

use crate::Database;
use crate::models::{
    MESSAGE_COLUMNS, MessageRow, ReactionRow, RecentChatRow, UserRow, format_timestamp,
};
use crate::store::{MessageStore, VisibilityChange};

/// Matches both directions of a conversation; binds the pair as ?A and ?B.
const PAIR_FILTER: &str =
    "((sender_id = ?A AND receiver_id = ?B) OR (sender_id = ?B AND receiver_id = ?A))";

impl Database {
    // -- Users --

    /// Upsert a profile. Accounts are owned elsewhere; this exists for
    /// seeding and tests.
    pub fn upsert_user(&self, id: &str, username: &str, avatar_url: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, avatar_url) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username, avatar_url = excluded.avatar_url",
                params![id, username, avatar_url],
            )?;
            Ok(())
        })
    }
}

impl MessageStore for Database {
    // -- Messages --

    fn insert_message(&self, msg: &Message) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    MESSAGE_COLUMNS
                ),
                params![
                    msg.id.to_string(),
                    msg.sender_id,
                    msg.receiver_id,
                    msg.text,
                    msg.message_type.as_str(),
                    msg.file_url,
                    msg.reply_to_id.map(|id| id.to_string()),
                    msg.is_read,
                    msg.read_at.as_ref().map(format_timestamp),
                    msg.edited_at.as_ref().map(format_timestamp),
                    msg.deleted_at.as_ref().map(format_timestamp),
                    msg.deleted_for_sender,
                    msg.deleted_for_receiver,
                    msg.pinned_at.as_ref().map(format_timestamp),
                    format_timestamp(&msg.created_at),
                ],
            )?;
            Ok(())
        })
    }

    fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        let row = self.with_conn(|conn| query_message(conn, &id.to_string()))?;
        row.map(Message::try_from).transpose()
    }

    fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, username, avatar_url FROM users WHERE id = ?1",
                    [user_id],
                    |row| {
                        Ok(UserRow {
                            id: row.get(0)?,
                            username: row.get(1)?,
                            avatar_url: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })?;
        Ok(row.map(UserProfile::from))
    }

    fn update_message_text(&self, id: Uuid, text: &str, edited_at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET text = ?1, edited_at = ?2 WHERE id = ?3 AND deleted_at IS NULL",
                params![text, format_timestamp(&edited_at), id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    fn set_message_visibility(&self, id: Uuid, change: VisibilityChange) -> Result<bool> {
        self.with_conn(|conn| {
            let id = id.to_string();
            let changed = match change {
                VisibilityChange::Everyone { at } => conn.execute(
                    "UPDATE messages SET deleted_at = ?1, text = ?2 WHERE id = ?3 AND deleted_at IS NULL",
                    params![format_timestamp(&at), DELETED_PLACEHOLDER, id],
                )?,
                VisibilityChange::ForSender => conn.execute(
                    "UPDATE messages SET deleted_for_sender = 1
                     WHERE id = ?1 AND deleted_for_sender = 0 AND deleted_at IS NULL",
                    [&id],
                )?,
                VisibilityChange::ForReceiver => conn.execute(
                    "UPDATE messages SET deleted_for_receiver = 1
                     WHERE id = ?1 AND deleted_for_receiver = 0 AND deleted_at IS NULL",
                    [&id],
                )?,
            };
            Ok(changed > 0)
        })
    }

    fn set_pinned(&self, pair: &ConversationPair, id: Uuid, pinned_at: DateTime<Utc>) -> Result<bool> {
        let (a, b) = pair.members();
        self.with_conn_mut(|conn| {
            // IMMEDIATE takes the write lock up front so two pins on the same
            // pair cannot interleave their clear and set steps.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            tx.execute(
                &format!(
                    "UPDATE messages SET pinned_at = NULL WHERE pinned_at IS NOT NULL AND {}",
                    pair_filter(1)
                ),
                params![a, b],
            )?;

            let pinned = tx.execute(
                &format!(
                    "UPDATE messages SET pinned_at = ?1 WHERE id = ?2 AND deleted_at IS NULL AND {}",
                    pair_filter(3)
                ),
                params![format_timestamp(&pinned_at), id.to_string(), a, b],
            )?;

            if pinned == 0 {
                tx.rollback()?;
                return Ok(false);
            }

            tx.commit()?;
            Ok(true)
        })
    }

    fn clear_pinned(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET pinned_at = NULL WHERE id = ?1 AND pinned_at IS NOT NULL",
                [id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    fn mark_messages_read(&self, from: &str, to: &str, read_at: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_read = 1, read_at = ?1
                 WHERE sender_id = ?2 AND receiver_id = ?3 AND is_read = 0",
                params![format_timestamp(&read_at), from, to],
            )?;
            Ok(changed)
        })
    }

    fn list_messages(&self, pair: &ConversationPair, viewer: &str, limit: u32) -> Result<Vec<Message>> {
        let rows = self.with_conn(|conn| query_messages(conn, pair, viewer, limit))?;
        // Fetched newest first so LIMIT keeps the latest page; hand back oldest first.
        rows.into_iter().rev().map(Message::try_from).collect()
    }

    // -- Reactions --

    fn add_reaction(&self, message_id: Uuid, user_id: &str, emoji: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![message_id.to_string(), user_id, emoji, format_timestamp(&Utc::now())],
            )?;
            Ok(inserted > 0)
        })
    }

    fn remove_reaction(&self, message_id: Uuid, user_id: &str, emoji: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                params![message_id.to_string(), user_id, emoji],
            )?;
            Ok(removed > 0)
        })
    }

    /// Batch-fetch reactions for a set of message IDs.
    fn list_reactions(&self, message_ids: &[Uuid]) -> Result<Vec<Reaction>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<String> = message_ids.iter().map(Uuid::to_string).collect();
        let rows = self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, user_id, emoji, created_at FROM reactions
                 WHERE message_id IN ({}) ORDER BY created_at",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                    Ok(ReactionRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        emoji: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })?;

        rows.into_iter().map(Reaction::try_from).collect()
    }

    fn recent_chats(&self, user_id: &str, limit: u32) -> Result<Vec<RecentChat>> {
        let rows = self.with_conn(|conn| {
            // Bare username/avatar columns next to MAX() are fine in SQLite:
            // they come from the same group.
            let mut stmt = conn.prepare(
                "SELECT other.id, u.username, u.avatar_url, other.last_time
                 FROM (
                     SELECT CASE WHEN sender_id = ?1 THEN receiver_id ELSE sender_id END AS id,
                            MAX(created_at) AS last_time
                     FROM messages
                     WHERE sender_id = ?1 OR receiver_id = ?1
                     GROUP BY 1
                 ) AS other
                 LEFT JOIN users u ON u.id = other.id
                 ORDER BY other.last_time DESC
                 LIMIT ?2",
            )?;

            let rows = stmt
                .query_map(params![user_id, limit], |row| {
                    Ok(RecentChatRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        avatar_url: row.get(2)?,
                        last_message_time: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })?;

        rows.into_iter().map(RecentChat::try_from).collect()
    }
}

/// `PAIR_FILTER` with its two parameters numbered from `first`.
fn pair_filter(first: usize) -> String {
    PAIR_FILTER
        .replace("?A", &format!("?{}", first))
        .replace("?B", &format!("?{}", first + 1))
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
            [id],
            MessageRow::from_row,
        )
        .optional()?;
    Ok(row)
}

fn query_messages(
    conn: &Connection,
    pair: &ConversationPair,
    viewer: &str,
    limit: u32,
) -> Result<Vec<MessageRow>> {
    let (a, b) = pair.members();
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages
         WHERE {}
           AND deleted_at IS NULL
           AND NOT (sender_id = ?3 AND deleted_for_sender = 1)
           AND NOT (receiver_id = ?3 AND deleted_for_receiver = 1)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?4",
        MESSAGE_COLUMNS,
        pair_filter(1)
    ))?;

    let rows = stmt
        .query_map(params![a, b, viewer, limit], MessageRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use kvant_types::models::MessageType;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn base_time() -> DateTime<Utc> {
        "2026-03-01T12:00:00.000Z".parse().unwrap()
    }

    fn message(sender: &str, receiver: &str, text: &str, offset_ms: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id: sender.into(),
            receiver_id: receiver.into(),
            text: text.into(),
            message_type: MessageType::Text,
            file_url: None,
            reply_to_id: None,
            is_read: false,
            read_at: None,
            edited_at: None,
            deleted_at: None,
            deleted_for_sender: false,
            deleted_for_receiver: false,
            pinned_at: None,
            created_at: base_time() + Duration::milliseconds(offset_ms),
        }
    }

    fn insert(db: &Database, sender: &str, receiver: &str, text: &str, offset_ms: i64) -> Message {
        let msg = message(sender, receiver, text, offset_ms);
        db.insert_message(&msg).unwrap();
        msg
    }

    fn pinned_count(db: &Database, pair: &ConversationPair) -> usize {
        db.list_messages(pair, pair.members().0, 1000)
            .unwrap()
            .iter()
            .filter(|m| m.pinned_at.is_some())
            .count()
    }

    #[test]
    fn insert_and_get_preserves_fields() {
        let db = db();
        let parent = insert(&db, "alice", "bob", "first", 0);
        let mut msg = message("bob", "alice", "", 10);
        msg.message_type = MessageType::Image;
        msg.file_url = Some("https://cdn.example/cat.png".into());
        msg.reply_to_id = Some(parent.id);
        db.insert_message(&msg).unwrap();

        let stored = db.get_message(msg.id).unwrap().unwrap();
        assert_eq!(stored, msg);
        assert!(db.get_message(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn list_messages_returns_latest_page_oldest_first_for_both_directions() {
        let db = db();
        insert(&db, "alice", "bob", "one", 0);
        insert(&db, "bob", "alice", "two", 1);
        insert(&db, "alice", "carol", "elsewhere", 2);
        insert(&db, "alice", "bob", "three", 3);

        let pair = ConversationPair::new("bob", "alice");
        let texts: Vec<String> = db.list_messages(&pair, "alice", 10).unwrap().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);

        let texts: Vec<String> = db.list_messages(&pair, "alice", 2).unwrap().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["two", "three"]);
    }

    #[test]
    fn duplicate_reaction_is_stored_once_and_removed_fully() {
        let db = db();
        let msg = insert(&db, "alice", "bob", "hi", 0);

        assert!(db.add_reaction(msg.id, "bob", "👍").unwrap());
        assert!(!db.add_reaction(msg.id, "bob", "👍").unwrap());
        assert!(db.add_reaction(msg.id, "alice", "👍").unwrap());
        assert_eq!(db.list_reactions(&[msg.id]).unwrap().len(), 2);

        assert!(db.remove_reaction(msg.id, "bob", "👍").unwrap());
        assert!(!db.remove_reaction(msg.id, "bob", "👍").unwrap());
        let left = db.list_reactions(&[msg.id]).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].user_id, "alice");
    }

    #[test]
    fn list_messages_filters_for_viewer_before_limiting() {
        let db = db();
        let visible = insert(&db, "alice", "bob", "visible", 0);
        let hidden = insert(&db, "alice", "bob", "hidden from bob", 1);
        let gone = insert(&db, "bob", "alice", "gone", 2);
        db.set_message_visibility(hidden.id, VisibilityChange::ForReceiver).unwrap();
        db.set_message_visibility(gone.id, VisibilityChange::Everyone { at: base_time() }).unwrap();

        let pair = ConversationPair::new("alice", "bob");
        let ids: Vec<Uuid> = db.list_messages(&pair, "bob", 1).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![visible.id]);

        let ids: Vec<Uuid> = db.list_messages(&pair, "alice", 10).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![visible.id, hidden.id]);
    }

    #[test]
    fn list_reactions_with_no_ids_is_empty() {
        assert!(db().list_reactions(&[]).unwrap().is_empty());
    }

    #[test]
    fn pinning_replaces_previous_pin_in_pair_only() {
        let db = db();
        let first = insert(&db, "alice", "bob", "first", 0);
        let second = insert(&db, "bob", "alice", "second", 1);
        let other = insert(&db, "alice", "carol", "other", 2);
        let ab = ConversationPair::new("alice", "bob");
        let ac = ConversationPair::new("alice", "carol");

        assert!(db.set_pinned(&ac, other.id, base_time()).unwrap());
        assert!(db.set_pinned(&ab, first.id, base_time()).unwrap());
        assert!(db.set_pinned(&ab, second.id, base_time()).unwrap());

        assert!(db.get_message(first.id).unwrap().unwrap().pinned_at.is_none());
        assert!(db.get_message(second.id).unwrap().unwrap().pinned_at.is_some());
        assert!(db.get_message(other.id).unwrap().unwrap().pinned_at.is_some());
        assert_eq!(pinned_count(&db, &ab), 1);
    }

    #[test]
    fn pinning_a_message_outside_the_pair_changes_nothing() {
        let db = db();
        let ab_msg = insert(&db, "alice", "bob", "ab", 0);
        let ac_msg = insert(&db, "alice", "carol", "ac", 1);
        let ab = ConversationPair::new("alice", "bob");

        assert!(db.set_pinned(&ab, ab_msg.id, base_time()).unwrap());
        assert!(!db.set_pinned(&ab, ac_msg.id, base_time()).unwrap());
        // rolled back: the existing pin survives
        assert!(db.get_message(ab_msg.id).unwrap().unwrap().pinned_at.is_some());
    }

    #[test]
    fn pinning_a_globally_deleted_message_is_refused() {
        let db = db();
        let kept = insert(&db, "alice", "bob", "kept", 0);
        let redacted = insert(&db, "alice", "bob", "redacted", 1);
        let pair = ConversationPair::new("alice", "bob");

        assert!(db.set_pinned(&pair, kept.id, base_time()).unwrap());
        db.set_message_visibility(redacted.id, VisibilityChange::Everyone { at: base_time() }).unwrap();

        assert!(!db.set_pinned(&pair, redacted.id, base_time()).unwrap());
        assert!(db.get_message(redacted.id).unwrap().unwrap().pinned_at.is_none());
        assert!(db.get_message(kept.id).unwrap().unwrap().pinned_at.is_some());
    }

    #[test]
    fn clear_pinned_reports_change() {
        let db = db();
        let msg = insert(&db, "alice", "bob", "pin me", 0);
        assert!(!db.clear_pinned(msg.id).unwrap());
        db.set_pinned(&msg.pair(), msg.id, base_time()).unwrap();
        assert!(db.clear_pinned(msg.id).unwrap());
        assert!(db.get_message(msg.id).unwrap().unwrap().pinned_at.is_none());
    }

    #[test]
    fn concurrent_pins_leave_exactly_one_pinned() {
        let db = std::sync::Arc::new(db());
        let ids: Vec<Uuid> = (0..8)
            .map(|i| insert(&db, if i % 2 == 0 { "alice" } else { "bob" }, if i % 2 == 0 { "bob" } else { "alice" }, "m", i).id)
            .collect();
        let pair = ConversationPair::new("alice", "bob");

        let handles: Vec<_> = ids
            .iter()
            .map(|&id| {
                let db = db.clone();
                let pair = pair.clone();
                std::thread::spawn(move || db.set_pinned(&pair, id, Utc::now()).unwrap())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }

        assert_eq!(pinned_count(&db, &pair), 1);
    }

    #[test]
    fn mark_read_only_touches_unread_from_counterpart() {
        let db = db();
        insert(&db, "alice", "bob", "1", 0);
        insert(&db, "alice", "bob", "2", 1);
        insert(&db, "bob", "alice", "reply", 2);

        assert_eq!(db.mark_messages_read("alice", "bob", base_time()).unwrap(), 2);
        assert_eq!(db.mark_messages_read("alice", "bob", base_time()).unwrap(), 0);

        let msgs = db.list_messages(&ConversationPair::new("alice", "bob"), "alice", 10).unwrap();
        assert!(msgs.iter().filter(|m| m.sender_id == "alice").all(|m| m.is_read && m.read_at.is_some()));
        assert!(msgs.iter().filter(|m| m.sender_id == "bob").all(|m| !m.is_read));
    }

    #[test]
    fn delete_for_everyone_redacts_and_blocks_later_edits() {
        let db = db();
        let msg = insert(&db, "alice", "bob", "secret", 0);

        assert!(db.set_message_visibility(msg.id, VisibilityChange::Everyone { at: base_time() }).unwrap());
        assert!(!db.set_message_visibility(msg.id, VisibilityChange::Everyone { at: base_time() }).unwrap());
        assert!(!db.update_message_text(msg.id, "revived", base_time()).unwrap());
        assert!(!db.set_message_visibility(msg.id, VisibilityChange::ForReceiver).unwrap());

        let stored = db.get_message(msg.id).unwrap().unwrap();
        assert_eq!(stored.text, DELETED_PLACEHOLDER);
        assert!(stored.deleted_at.is_some());
    }

    #[test]
    fn per_party_delete_keeps_text() {
        let db = db();
        let msg = insert(&db, "alice", "bob", "keep", 0);

        assert!(db.set_message_visibility(msg.id, VisibilityChange::ForSender).unwrap());
        assert!(!db.set_message_visibility(msg.id, VisibilityChange::ForSender).unwrap());

        let stored = db.get_message(msg.id).unwrap().unwrap();
        assert_eq!(stored.text, "keep");
        assert!(stored.deleted_for_sender);
        assert!(!stored.deleted_for_receiver);
    }

    #[test]
    fn edit_updates_text_and_timestamp() {
        let db = db();
        let msg = insert(&db, "alice", "bob", "typo", 0);
        let at = base_time() + Duration::seconds(5);
        assert!(db.update_message_text(msg.id, "fixed", at).unwrap());

        let stored = db.get_message(msg.id).unwrap().unwrap();
        assert_eq!(stored.text, "fixed");
        assert_eq!(stored.edited_at, Some(at));
    }

    #[test]
    fn profiles_and_recent_chats() {
        let db = db();
        db.upsert_user("bob", "bobby", Some("https://cdn.example/b.png")).unwrap();
        db.upsert_user("bob", "bob", None).unwrap();

        insert(&db, "alice", "bob", "old", 0);
        insert(&db, "carol", "alice", "newer", 5);
        insert(&db, "bob", "alice", "newest", 10);

        let profile = db.get_user_profile("bob").unwrap().unwrap();
        assert_eq!(profile.username, "bob");
        assert_eq!(profile.avatar_url, None);
        assert!(db.get_user_profile("nobody").unwrap().is_none());

        let chats = db.recent_chats("alice", 50).unwrap();
        let ids: Vec<&str> = chats.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["bob", "carol"]);
        assert_eq!(chats[0].username, "bob");
        assert_eq!(chats[1].username, "unknown");
        assert_eq!(chats[0].last_message_time, base_time() + Duration::milliseconds(10));
    }
}
