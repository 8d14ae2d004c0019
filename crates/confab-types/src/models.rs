use serde::{Deserialize, Serialize};

/// The identity resolved from a bearer token. Inserted as a request
/// extension by the REST middleware and carried by each gateway connection.
/// Canonical definition lives here so confab-api and confab-gateway agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: i64,
    pub username: String,
}

/// The slice of a chat the authorization policy needs: who owns it, who was
/// invited, and whether it has been closed for writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMembership {
    pub creator_id: i64,
    pub invited_ids: Vec<i64>,
    pub is_closed: bool,
}

/// Message read status. One-way transition: a message starts not viewed and
/// may become viewed, never the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Viewed,
    NotViewed,
}

impl MessageStatus {
    pub const fn as_db(self) -> i64 {
        match self {
            Self::Viewed => 1,
            Self::NotViewed => 2,
        }
    }

    pub fn from_db(value: i64) -> Self {
        match value {
            1 => Self::Viewed,
            _ => Self::NotViewed,
        }
    }
}
