use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS groups (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            owner_id    TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS group_members (
            group_id    TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL REFERENCES users(id),
            joined_at   TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (group_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_group_members_user
            ON group_members(user_id);

        -- One log for both room kinds; room_key is 'd:{lo}:{hi}' for direct
        -- pairs and 'g:{group_id}' for group rooms.
        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            room_key        TEXT NOT NULL,
            sender_id       TEXT NOT NULL REFERENCES users(id),
            recipient_id    TEXT REFERENCES users(id),
            group_id        TEXT REFERENCES groups(id),
            body            TEXT,
            ciphertext      BLOB,
            nonce           BLOB,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_key, created_at);

        CREATE TABLE IF NOT EXISTS attachments (
            id                TEXT PRIMARY KEY,
            message_id        TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            media_type        TEXT NOT NULL,
            storage_path      TEXT NOT NULL,
            mime_type         TEXT,
            duration_seconds  REAL,
            created_at        TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_attachments_message
            ON attachments(message_id);

        -- Single-use upload records awaiting attachment to a message.
        CREATE TABLE IF NOT EXISTS upload_tokens (
            token             TEXT PRIMARY KEY,
            user_id           TEXT NOT NULL REFERENCES users(id),
            storage_path      TEXT NOT NULL,
            media_type        TEXT NOT NULL,
            mime_type         TEXT,
            duration_seconds  REAL,
            created_at        TEXT NOT NULL,
            consumed_at       TEXT
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
