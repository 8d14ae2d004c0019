/// Database row types — these map directly to SQLite rows.
/// Distinct from confab-types API models to keep the DB layer independent.

#[derive(Debug)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password: String,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug)]
pub struct ChatRow {
    pub id: i64,
    pub title: String,
    pub creator_id: i64,
    pub is_closed: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug)]
pub struct MessageRow {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: i64,
    pub text: String,
    pub status: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug)]
pub struct FileRow {
    pub id: i64,
    pub message_id: i64,
    pub name: String,
    pub size: i64,
    pub created_at: String,
}
