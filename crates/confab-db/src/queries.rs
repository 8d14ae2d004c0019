use crate::Database;
use crate::models::{ChatRow, FileRow, MessageRow, UserRow};
use anyhow::{Result, anyhow};
use rusqlite::Connection;

use confab_types::models::{ChatMembership, MessageStatus};

impl Database {
    // -- Users --

    pub fn create_user(&self, username: &str, email: &str, password_hash: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, email, password) VALUES (?1, ?2, ?3)",
                (username, email, password_hash),
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_username(conn, username))
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    // -- Tokens --

    pub fn create_token(&self, token: &str, user_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tokens (token, user_id) VALUES (?1, ?2)",
                rusqlite::params![token, user_id],
            )?;
            Ok(())
        })
    }

    /// Resolve an opaque bearer token to its user. Unknown or revoked tokens
    /// and deactivated users all resolve to `Ok(None)`, never an error.
    pub fn resolve_token(&self, token: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.username, u.email, u.password, u.is_active, u.created_at
                 FROM tokens t
                 JOIN users u ON t.user_id = u.id
                 WHERE t.token = ?1 AND u.is_active = 1",
            )?;

            let row = stmt.query_row([token], map_user_row).optional()?;
            Ok(row)
        })
    }

    // -- Chats --

    pub fn create_chat(&self, title: &str, creator_id: i64, invited: &[i64]) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chats (title, creator_id) VALUES (?1, ?2)",
                rusqlite::params![title, creator_id],
            )?;
            let chat_id = tx.last_insert_rowid();

            for user_id in invited {
                // The creator is implicitly a participant
                if *user_id == creator_id {
                    continue;
                }
                tx.execute(
                    "INSERT OR IGNORE INTO chat_invited (chat_id, user_id) VALUES (?1, ?2)",
                    rusqlite::params![chat_id, user_id],
                )?;
            }

            tx.commit()?;
            Ok(chat_id)
        })
    }

    pub fn get_chat(&self, chat_id: i64) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| query_chat(conn, chat_id))
    }

    pub fn get_chat_by_title(&self, title: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, creator_id, is_closed, created_at, updated_at
                 FROM chats WHERE title = ?1",
            )?;
            let row = stmt.query_row([title], map_chat_row).optional()?;
            Ok(row)
        })
    }

    pub fn get_chat_invited(&self, chat_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| query_invited(conn, chat_id))
    }

    /// The ChatRepository slice the authorization policy consumes. `None` for
    /// an unknown chat id.
    pub fn get_chat_membership(&self, chat_id: i64) -> Result<Option<ChatMembership>> {
        self.with_conn(|conn| {
            let Some(chat) = query_chat(conn, chat_id)? else {
                return Ok(None);
            };
            let invited_ids = query_invited(conn, chat_id)?;
            Ok(Some(ChatMembership {
                creator_id: chat.creator_id,
                invited_ids,
                is_closed: chat.is_closed,
            }))
        })
    }

    /// Chats the user created or was invited to, most recently active first.
    pub fn list_chats_for_user(&self, user_id: i64) -> Result<Vec<ChatRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, creator_id, is_closed, created_at, updated_at
                 FROM chats
                 WHERE creator_id = ?1
                    OR id IN (SELECT chat_id FROM chat_invited WHERE user_id = ?1)
                 ORDER BY updated_at DESC",
            )?;

            let rows = stmt
                .query_map([user_id], map_chat_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn close_chat(&self, chat_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE chats SET is_closed = 1, updated_at = datetime('now') WHERE id = ?1",
                [chat_id],
            )?;
            Ok(())
        })
    }

    // -- Messages --

    /// Insert a message (status defaults to not-viewed) and bump the chat's
    /// activity timestamp. Returns the persisted row.
    pub fn insert_message(&self, chat_id: i64, sender_id: i64, text: &str) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (chat_id, sender_id, text, status) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![chat_id, sender_id, text, MessageStatus::NotViewed.as_db()],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE chats SET updated_at = datetime('now') WHERE id = ?1",
                [chat_id],
            )?;
            let row = query_message(&tx, id)?
                .ok_or_else(|| anyhow!("message {} missing after insert", id))?;
            tx.commit()?;
            Ok(row)
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Newest-first page of a chat's messages. `before` is the id of the
    /// oldest message from the previous page. Ids are monotonic, so the
    /// rowid cursor keeps paging stable even when a burst of messages
    /// shares one created_at second.
    pub fn get_messages(
        &self,
        chat_id: i64,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let (sql, params): (&str, Vec<&dyn rusqlite::types::ToSql>) = match before {
                Some(ref cursor) => (
                    "SELECT id, chat_id, sender_id, text, status, created_at, updated_at
                     FROM messages
                     WHERE chat_id = ?1 AND id < ?2
                     ORDER BY id DESC
                     LIMIT ?3",
                    vec![&chat_id, cursor, &limit],
                ),
                None => (
                    "SELECT id, chat_id, sender_id, text, status, created_at, updated_at
                     FROM messages
                     WHERE chat_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2",
                    vec![&chat_id, &limit],
                ),
            };

            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params.as_slice(), map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// One-way status transition not-viewed -> viewed. Returns true when the
    /// row changed; already-viewed messages are left untouched.
    pub fn mark_message_viewed(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND status = ?3",
                rusqlite::params![
                    MessageStatus::Viewed.as_db(),
                    id,
                    MessageStatus::NotViewed.as_db()
                ],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Files --

    pub fn insert_file(&self, message_id: i64, name: &str, size: i64) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO files (message_id, name, size) VALUES (?1, ?2, ?3)",
                rusqlite::params![message_id, name, size],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_file(&self, id: i64) -> Result<Option<FileRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message_id, name, size, created_at FROM files WHERE id = ?1",
            )?;
            let row = stmt
                .query_row([id], |row| {
                    Ok(FileRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        name: row.get(2)?,
                        size: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    /// Remove a file row. The caller deletes the backing blob afterwards, so
    /// a crash in between orphans a blob rather than dangling a row.
    pub fn delete_file(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM files WHERE id = ?1", [id])?;
            Ok(deleted > 0)
        })
    }
}

fn map_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password: row.get(3)?,
        is_active: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn map_chat_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRow> {
    Ok(ChatRow {
        id: row.get(0)?,
        title: row.get(1)?,
        creator_id: row.get(2)?,
        is_closed: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        text: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn query_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, email, password, is_active, created_at
         FROM users WHERE username = ?1",
    )?;

    let row = stmt.query_row([username], map_user_row).optional()?;
    Ok(row)
}

fn query_user_by_id(conn: &Connection, id: i64) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, email, password, is_active, created_at
         FROM users WHERE id = ?1",
    )?;

    let row = stmt.query_row([id], map_user_row).optional()?;
    Ok(row)
}

fn query_chat(conn: &Connection, chat_id: i64) -> Result<Option<ChatRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, creator_id, is_closed, created_at, updated_at
         FROM chats WHERE id = ?1",
    )?;

    let row = stmt.query_row([chat_id], map_chat_row).optional()?;
    Ok(row)
}

fn query_invited(conn: &Connection, chat_id: i64) -> Result<Vec<i64>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM chat_invited WHERE chat_id = ?1 ORDER BY user_id")?;

    let ids = stmt
        .query_map([chat_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn query_message(conn: &Connection, id: i64) -> Result<Option<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, chat_id, sender_id, text, status, created_at, updated_at
         FROM messages WHERE id = ?1",
    )?;

    let row = stmt.query_row([id], map_message_row).optional()?;
    Ok(row)
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

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn user(db: &Database, name: &str) -> i64 {
        db.create_user(name, &format!("{name}@example.com"), "hash")
            .unwrap()
    }

    #[test]
    fn unknown_token_resolves_to_none() {
        let db = db();
        assert!(db.resolve_token("no-such-token").unwrap().is_none());
        // malformed input is just another unknown token
        assert!(db.resolve_token("").unwrap().is_none());
    }

    #[test]
    fn token_resolves_to_its_user() {
        let db = db();
        let alice = user(&db, "alice");
        db.create_token("tok-alice", alice).unwrap();

        let resolved = db.resolve_token("tok-alice").unwrap().unwrap();
        assert_eq!(resolved.id, alice);
        assert_eq!(resolved.username, "alice");
    }

    #[test]
    fn membership_is_none_for_unknown_chat() {
        let db = db();
        assert!(db.get_chat_membership(9999).unwrap().is_none());
    }

    #[test]
    fn membership_reflects_creator_and_invited() {
        let db = db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        // inviting the creator is a no-op
        let chat_id = db.create_chat("t1", alice, &[bob, alice]).unwrap();

        let membership = db.get_chat_membership(chat_id).unwrap().unwrap();
        assert_eq!(membership.creator_id, alice);
        assert_eq!(membership.invited_ids, vec![bob]);
        assert!(!membership.is_closed);

        db.close_chat(chat_id).unwrap();
        let membership = db.get_chat_membership(chat_id).unwrap().unwrap();
        assert!(membership.is_closed);
    }

    #[test]
    fn list_chats_covers_created_and_invited() {
        let db = db();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let mine = db.create_chat("mine", alice, &[]).unwrap();
        let joined = db.create_chat("joined", bob, &[alice]).unwrap();
        db.create_chat("other", bob, &[]).unwrap();

        let mut ids: Vec<i64> = db
            .list_chats_for_user(alice)
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![mine, joined]);
    }

    #[test]
    fn inserted_message_starts_not_viewed() {
        let db = db();
        let alice = user(&db, "alice");
        let chat_id = db.create_chat("t1", alice, &[]).unwrap();

        let row = db.insert_message(chat_id, alice, "hi").unwrap();
        assert_eq!(row.chat_id, chat_id);
        assert_eq!(MessageStatus::from_db(row.status), MessageStatus::NotViewed);

        let fetched = db.get_message(row.id).unwrap().unwrap();
        assert_eq!(fetched.text, "hi");
    }

    #[test]
    fn viewed_transition_is_one_way() {
        let db = db();
        let alice = user(&db, "alice");
        let chat_id = db.create_chat("t1", alice, &[]).unwrap();
        let row = db.insert_message(chat_id, alice, "hi").unwrap();

        assert!(db.mark_message_viewed(row.id).unwrap());
        // second call is a no-op
        assert!(!db.mark_message_viewed(row.id).unwrap());

        let fetched = db.get_message(row.id).unwrap().unwrap();
        assert_eq!(MessageStatus::from_db(fetched.status), MessageStatus::Viewed);
    }

    #[test]
    fn pagination_cursor_survives_same_second_inserts() {
        let db = db();
        let alice = user(&db, "alice");
        let chat_id = db.create_chat("t1", alice, &[]).unwrap();
        // a burst inside one created_at second must still page cleanly
        let first = db.insert_message(chat_id, alice, "first").unwrap();
        let second = db.insert_message(chat_id, alice, "second").unwrap();
        let third = db.insert_message(chat_id, alice, "third").unwrap();

        let page = db.get_messages(chat_id, 2, None).unwrap();
        assert_eq!(
            page.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![third.id, second.id]
        );

        let older = db.get_messages(chat_id, 2, Some(second.id)).unwrap();
        assert_eq!(
            older.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![first.id]
        );

        assert!(db.get_messages(chat_id, 2, Some(first.id)).unwrap().is_empty());
    }

    #[test]
    fn file_rows_round_trip_and_delete() {
        let db = db();
        let alice = user(&db, "alice");
        let chat_id = db.create_chat("t1", alice, &[]).unwrap();
        let message = db.insert_message(chat_id, alice, "hi").unwrap();

        let file_id = db.insert_file(message.id, "photo.png", 1234).unwrap();
        let row = db.get_file(file_id).unwrap().unwrap();
        assert_eq!(row.message_id, message.id);
        assert_eq!(row.name, "photo.png");
        assert_eq!(row.size, 1234);

        assert!(db.delete_file(file_id).unwrap());
        assert!(!db.delete_file(file_id).unwrap());
        assert!(db.get_file(file_id).unwrap().is_none());
    }
}
