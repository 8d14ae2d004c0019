use serde::{Deserialize, Serialize};

/// Events pushed to chat subscribers over the websocket gateway.
///
/// The wire shape is a flat tagged object, e.g.
/// `{"type":"send_json","text":"hi","created":true,"id":42}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A message was persisted in the chat. `created` is true for brand-new
    /// messages; false is reserved for future update events.
    SendJson {
        text: String,
        created: bool,
        id: i64,
    },
}
