use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (direct messages)");
        conn.execute_batch(
            "
            -- Profiles are written by the account service; we only read them.
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                username    TEXT NOT NULL UNIQUE,
                avatar_url  TEXT,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE messages (
                id                    TEXT PRIMARY KEY,
                sender_id             TEXT NOT NULL,
                receiver_id           TEXT NOT NULL,
                text                  TEXT NOT NULL,
                message_type          TEXT NOT NULL DEFAULT 'text',
                file_url              TEXT,
                reply_to_id           TEXT REFERENCES messages(id) ON DELETE SET NULL,
                is_read               INTEGER NOT NULL DEFAULT 0,
                read_at               TEXT,
                edited_at             TEXT,
                deleted_at            TEXT,
                deleted_for_sender    INTEGER NOT NULL DEFAULT 0,
                deleted_for_receiver  INTEGER NOT NULL DEFAULT 0,
                pinned_at             TEXT,
                created_at            TEXT NOT NULL
            );

            CREATE INDEX idx_messages_pair
                ON messages(sender_id, receiver_id, created_at);

            CREATE INDEX idx_messages_unread
                ON messages(receiver_id, sender_id) WHERE is_read = 0;

            -- At most one pinned message per unordered pair.
            CREATE UNIQUE INDEX idx_messages_one_pin_per_pair
                ON messages(min(sender_id, receiver_id), max(sender_id, receiver_id))
                WHERE pinned_at IS NOT NULL;

            CREATE TABLE reactions (
                message_id  TEXT NOT NULL REFERENCES messages(id),
                user_id     TEXT NOT NULL,
                emoji       TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id, emoji)
            );

            CREATE INDEX idx_reactions_message
                ON reactions(message_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
