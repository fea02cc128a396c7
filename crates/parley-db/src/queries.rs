use crate::Database;
use crate::models::{
    AttachmentRow, GroupRow, MessageRow, NewMessage, UploadTokenRow, UserRow,
};
use anyhow::{Result, anyhow};
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn get_username_by_id(&self, id: &str) -> Result<String> {
        self.with_conn(|conn| {
            conn.query_row("SELECT username FROM users WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map_err(|_| anyhow!("User not found: {}", id))
        })
    }

    // -- Groups --

    pub fn create_group(&self, id: &str, name: &str, owner_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO groups (id, name, owner_id) VALUES (?1, ?2, ?3)",
                (id, name, owner_id),
            )?;
            // The owner is always a member of their own group
            tx.execute(
                "INSERT INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                (id, owner_id),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_group(&self, id: &str) -> Result<Option<GroupRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, owner_id, created_at FROM groups WHERE id = ?1")?;
            let row = stmt
                .query_row([id], |row| {
                    Ok(GroupRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        owner_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    pub fn add_group_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                (group_id, user_id),
            )?;
            Ok(())
        })
    }

    pub fn remove_group_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                (group_id, user_id),
            )?;
            Ok(())
        })
    }

    pub fn is_group_member(&self, group_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                    (group_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// All group ids the user belongs to — used to hydrate live room
    /// membership when a connection arrives.
    pub fn group_ids_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT group_id FROM group_members WHERE user_id = ?1")?;
            let ids = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    pub fn groups_for_user(&self, user_id: &str) -> Result<Vec<GroupRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.id, g.name, g.owner_id, g.created_at
                 FROM groups g
                 JOIN group_members m ON m.group_id = g.id
                 WHERE m.user_id = ?1
                 ORDER BY g.created_at",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(GroupRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        owner_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    /// Durably record a message (and its attachment, if any) in a single
    /// transaction. The router must not fan out until this returns Ok.
    pub fn append_message(&self, msg: &NewMessage) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages
                   (id, room_key, sender_id, recipient_id, group_id, body, ciphertext, nonce, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    msg.id,
                    msg.room_key,
                    msg.sender_id,
                    msg.recipient_id,
                    msg.group_id,
                    msg.body,
                    msg.ciphertext,
                    msg.nonce,
                    msg.created_at,
                ],
            )?;
            if let Some(att) = &msg.attachment {
                tx.execute(
                    "INSERT INTO attachments
                       (id, message_id, media_type, storage_path, mime_type, duration_seconds)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        att.id,
                        msg.id,
                        att.media_type,
                        att.storage_path,
                        att.mime_type,
                        att.duration_seconds,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// History fetch for a room, newest first, with cursor pagination via the
    /// `created_at` of the oldest message from the previous page.
    pub fn get_room_messages(
        &self,
        room_key: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_room_messages(conn, room_key, limit, before))
    }

    // -- Upload tokens --

    pub fn create_upload_token(
        &self,
        token: &str,
        user_id: &str,
        storage_path: &str,
        media_type: &str,
        mime_type: Option<&str>,
        duration_seconds: Option<f64>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO upload_tokens
                   (token, user_id, storage_path, media_type, mime_type, duration_seconds, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    token,
                    user_id,
                    storage_path,
                    media_type,
                    mime_type,
                    duration_seconds,
                    created_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Consume an upload token for the given user. Single use: a consumed,
    /// expired, missing, or foreign token all return None.
    pub fn consume_upload_token(
        &self,
        token: &str,
        user_id: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<UploadTokenRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let row = {
                let mut stmt = tx.prepare(
                    "SELECT token, user_id, storage_path, media_type, mime_type,
                            duration_seconds, created_at
                     FROM upload_tokens
                     WHERE token = ?1 AND user_id = ?2 AND consumed_at IS NULL",
                )?;
                stmt.query_row((token, user_id), |row| {
                    Ok(UploadTokenRow {
                        token: row.get(0)?,
                        user_id: row.get(1)?,
                        storage_path: row.get(2)?,
                        media_type: row.get(3)?,
                        mime_type: row.get(4)?,
                        duration_seconds: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })
                .optional()?
            };

            let Some(row) = row else {
                return Ok(None);
            };

            // Tokens expire one hour after upload
            let created = row
                .created_at
                .parse::<chrono::DateTime<chrono::Utc>>()
                .map_err(|e| anyhow!("Corrupt upload token timestamp: {}", e))?;
            if now - created > chrono::Duration::hours(1) {
                return Ok(None);
            }

            tx.execute(
                "UPDATE upload_tokens SET consumed_at = ?1 WHERE token = ?2",
                (now.to_rfc3339(), token),
            )?;
            tx.commit()?;
            Ok(Some(row))
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT id, username, password, created_at FROM users WHERE {column} = ?1");
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_room_messages(
    conn: &Connection,
    room_key: &str,
    limit: u32,
    before: Option<&str>,
) -> Result<Vec<MessageRow>> {
    // JOIN users for the sender name and LEFT JOIN the (at most one)
    // attachment in a single query
    let sql = format!(
        "SELECT m.id, m.room_key, m.sender_id, u.username, m.recipient_id, m.group_id,
                m.body, m.ciphertext, m.nonce, m.created_at,
                a.media_type, a.storage_path, a.mime_type, a.duration_seconds
         FROM messages m
         LEFT JOIN users u ON m.sender_id = u.id
         LEFT JOIN attachments a ON a.message_id = m.id
         WHERE m.room_key = ?1 {}
         ORDER BY m.created_at DESC
         LIMIT ?2",
        if before.is_some() {
            "AND m.created_at < ?3"
        } else {
            ""
        }
    );

    let mut stmt = conn.prepare(&sql)?;
    let map_row = |row: &rusqlite::Row<'_>| {
        let media_type: Option<String> = row.get(10)?;
        let attachment = media_type.map(|media_type| {
            Ok::<_, rusqlite::Error>(AttachmentRow {
                media_type,
                storage_path: row.get(11)?,
                mime_type: row.get(12)?,
                duration_seconds: row.get(13)?,
            })
        });
        Ok(MessageRow {
            id: row.get(0)?,
            room_key: row.get(1)?,
            sender_id: row.get(2)?,
            sender_username: row
                .get::<_, Option<String>>(3)?
                .unwrap_or_else(|| "unknown".to_string()),
            recipient_id: row.get(4)?,
            group_id: row.get(5)?,
            body: row.get(6)?,
            ciphertext: row.get(7)?,
            nonce: row.get(8)?,
            created_at: row.get(9)?,
            attachment: attachment.transpose()?,
        })
    };

    let rows = match before {
        Some(before) => stmt
            .query_map(rusqlite::params![room_key, limit, before], map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?,
        None => stmt
            .query_map(rusqlite::params![room_key, limit], map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?,
    };

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
