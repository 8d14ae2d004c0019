use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use confab_db::Database;
use confab_db::models::ChatRow;
use confab_types::api::{ChatResponse, CreateChatRequest};
use confab_types::models::CurrentUser;
use confab_types::policy;

use crate::auth::AppState;
use crate::error::{ApiError, run_blocking};
use crate::parse_sqlite_timestamp;

pub async fn create_chat(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<CreateChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.is_empty() || req.title.len() > 50 {
        return Err(ApiError::BadRequest("title must be 1-50 characters"));
    }

    let db = state.db.clone();
    let response = run_blocking(move || {
        if db.get_chat_by_title(&req.title)?.is_some() {
            return Err(ApiError::Conflict);
        }

        for invited_id in &req.invited {
            if db.get_user_by_id(*invited_id)?.is_none() {
                return Err(ApiError::BadRequest("invited user does not exist"));
            }
        }

        let chat_id = db.create_chat(&req.title, user.id, &req.invited)?;
        let chat = db
            .get_chat(chat_id)?
            .ok_or_else(|| anyhow::anyhow!("chat {} missing after insert", chat_id))?;
        chat_response(&db, chat)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn list_chats(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let chats = run_blocking(move || {
        db.list_chats_for_user(user.id)?
            .into_iter()
            .map(|chat| chat_response(&db, chat))
            .collect::<Result<Vec<_>, _>>()
    })
    .await?;

    Ok(Json(chats))
}

pub async fn get_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let response = run_blocking(move || {
        let membership = db.get_chat_membership(chat_id)?;
        if !policy::can_read(user.id, membership.as_ref()) {
            return Err(ApiError::Forbidden);
        }

        let chat = db
            .get_chat(chat_id)?
            .ok_or_else(|| anyhow::anyhow!("chat {} vanished after authorization", chat_id))?;
        chat_response(&db, chat)
    })
    .await?;

    Ok(Json(response))
}

/// Close the chat, turning it into a read-only archive. One-way.
pub async fn close_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let response = run_blocking(move || {
        let membership = db.get_chat_membership(chat_id)?;
        if !policy::can_write(user.id, membership.as_ref()) {
            return Err(ApiError::Forbidden);
        }

        db.close_chat(chat_id)?;
        let chat = db
            .get_chat(chat_id)?
            .ok_or_else(|| anyhow::anyhow!("chat {} vanished after authorization", chat_id))?;
        chat_response(&db, chat)
    })
    .await?;

    Ok(Json(response))
}

fn chat_response(db: &Database, chat: ChatRow) -> Result<ChatResponse, ApiError> {
    let invited = db.get_chat_invited(chat.id)?;
    let context = format!("chat {}", chat.id);
    Ok(ChatResponse {
        id: chat.id,
        title: chat.title,
        creator_id: chat.creator_id,
        invited,
        is_closed: chat.is_closed,
        created_at: parse_sqlite_timestamp(&chat.created_at, &context),
        updated_at: parse_sqlite_timestamp(&chat.updated_at, &context),
    })
}
