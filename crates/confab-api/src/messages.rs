use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use confab_db::models::MessageRow;
use confab_types::api::{MessageResponse, SendMessageRequest};
use confab_types::events::ChatEvent;
use confab_types::models::{CurrentUser, MessageStatus};
use confab_types::policy;

use crate::auth::AppState;
use crate::error::{ApiError, run_blocking};
use crate::parse_sqlite_timestamp;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination — pass the id of the oldest message from the
    /// previous page to fetch older messages.
    pub before: Option<i64>,
}

fn default_limit() -> u32 {
    50
}

/// The message creation flow: authorize the sender, persist the message,
/// then fan the event out to the chat's live subscribers.
///
/// The publish happens strictly after the insert returns, so a subscriber
/// never observes an id that is not yet durably stored. A fan-out failure
/// (dead subscriber) is the registry's problem, never the sender's: once
/// the row is in, this function succeeds.
pub async fn create_message(
    state: &AppState,
    sender_id: i64,
    chat_id: i64,
    text: String,
) -> Result<MessageRow, ApiError> {
    let db = state.db.clone();
    let row = run_blocking(move || {
        let membership = db.get_chat_membership(chat_id)?;
        if !policy::can_send(sender_id, membership.as_ref()) {
            return Err(ApiError::Forbidden);
        }
        Ok(db.insert_message(chat_id, sender_id, &text)?)
    })
    .await?;

    state.registry.publish(
        chat_id,
        ChatEvent::SendJson {
            text: row.text.clone(),
            created: true,
            id: row.id,
        },
    );

    Ok(row)
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.text.is_empty() {
        return Err(ApiError::BadRequest("message text must not be empty"));
    }

    let row = create_message(&state, user.id, chat_id, req.text).await?;
    Ok((StatusCode::CREATED, Json(to_response(row))))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
    Query(query): Query<MessageQuery>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let limit = query.limit.min(200);
    let before = query.before;

    let rows = run_blocking(move || {
        let membership = db.get_chat_membership(chat_id)?;
        if !policy::can_read(user.id, membership.as_ref()) {
            return Err(ApiError::Forbidden);
        }
        Ok(db.get_messages(chat_id, limit, before)?)
    })
    .await?;

    let messages: Vec<MessageResponse> = rows.into_iter().map(to_response).collect();
    Ok(Json(messages))
}

/// One-way status transition not-viewed -> viewed. Marking an
/// already-viewed message again is a no-op, not an error.
pub async fn mark_viewed(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(i64, i64)>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let row = run_blocking(move || {
        let membership = db.get_chat_membership(chat_id)?;
        if !policy::can_read(user.id, membership.as_ref()) {
            return Err(ApiError::Forbidden);
        }

        // Chat-level authorization passed; a bad message id is a real 404.
        let message = db.get_message(message_id)?.ok_or(ApiError::NotFound)?;
        if message.chat_id != chat_id {
            return Err(ApiError::NotFound);
        }

        db.mark_message_viewed(message_id)?;
        Ok(db
            .get_message(message_id)?
            .ok_or_else(|| anyhow::anyhow!("message {} vanished", message_id))?)
    })
    .await?;

    Ok(Json(to_response(row)))
}

fn to_response(row: MessageRow) -> MessageResponse {
    let context = format!("message {}", row.id);
    MessageResponse {
        id: row.id,
        chat_id: row.chat_id,
        sender_id: row.sender_id,
        text: row.text,
        status: MessageStatus::from_db(row.status),
        created_at: parse_sqlite_timestamp(&row.created_at, &context),
        updated_at: parse_sqlite_timestamp(&row.updated_at, &context),
    }
}
