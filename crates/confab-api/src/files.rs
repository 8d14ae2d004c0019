use std::path::PathBuf;

use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{error, warn};

use confab_db::models::FileRow;
use confab_types::api::FileResponse;
use confab_types::models::{ChatMembership, CurrentUser};
use confab_types::policy;

use crate::auth::AppState;
use crate::error::{ApiError, run_blocking};
use crate::parse_sqlite_timestamp;

/// 50 MB upload limit for attached files.
pub const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub name: Option<String>,
}

/// POST /chat/{chat_id}/messages/{message_id}/files — accepts raw bytes
/// (application/octet-stream), inserts the DB row, then writes the blob to
/// the upload directory keyed by file id.
pub async fn upload_file(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(i64, i64)>,
    Query(query): Query<UploadQuery>,
    Extension(user): Extension<CurrentUser>,
    bytes: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("file body must not be empty"));
    }
    if bytes.len() > MAX_FILE_SIZE {
        return Err(ApiError::BadRequest("file exceeds the upload limit"));
    }

    let name = query.name.unwrap_or_else(|| "upload".into());
    if name.contains('/') || name.contains('\\') {
        return Err(ApiError::BadRequest("invalid file name"));
    }

    let size = bytes.len() as i64;
    let db = state.db.clone();
    let file_name = name.clone();
    let row = run_blocking(move || {
        let membership = db.get_chat_membership(chat_id)?;
        // Attaching a file writes into the chat, same rule as sending.
        if !policy::can_send(user.id, membership.as_ref()) {
            return Err(ApiError::Forbidden);
        }

        let message = db.get_message(message_id)?.ok_or(ApiError::NotFound)?;
        if message.chat_id != chat_id {
            return Err(ApiError::NotFound);
        }

        let file_id = db.insert_file(message_id, &file_name, size)?;
        Ok(db
            .get_file(file_id)?
            .ok_or_else(|| anyhow::anyhow!("file {} missing after insert", file_id))?)
    })
    .await?;

    tokio::fs::create_dir_all(&state.upload_dir).await.map_err(|e| {
        error!("Failed to create upload directory: {}", e);
        ApiError::Persistence(e.into())
    })?;

    let path = blob_path(&state.upload_dir, row.id);
    if let Err(e) = tokio::fs::write(&path, &bytes).await {
        error!("Failed to write blob {}: {}", path.display(), e);
        // Roll the row back so a failed upload leaves nothing behind.
        let db = state.db.clone();
        let file_id = row.id;
        let _ = run_blocking(move || Ok(db.delete_file(file_id)?)).await;
        return Err(ApiError::Persistence(e.into()));
    }

    Ok((StatusCode::CREATED, Json(to_response(row))))
}

/// GET /files/{file_id} — streams back the stored blob once the owning
/// message's chat authorizes the caller.
pub async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let row = run_blocking(move || authorize_file(&db, user.id, file_id, policy::can_read)).await?;

    let path = blob_path(&state.upload_dir, row.id);
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        error!("Failed to read blob {}: {}", path.display(), e);
        ApiError::NotFound
    })?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

/// DELETE /files/{file_id} — removes the row, then the backing blob. Row
/// first: a crash in between orphans a blob, never a dangling row.
pub async fn delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let row = run_blocking(move || {
        let row = authorize_file(&db, user.id, file_id, policy::can_write)?;
        db.delete_file(file_id)?;
        Ok(row)
    })
    .await?;

    // Storage delete-hook: the blob goes once the record is gone.
    let path = blob_path(&state.upload_dir, row.id);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!("Blob {} not removed: {}", path.display(), e);
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Walk file -> message -> chat and apply the given policy predicate.
fn authorize_file(
    db: &confab_db::Database,
    user_id: i64,
    file_id: i64,
    allowed: fn(i64, Option<&ChatMembership>) -> bool,
) -> Result<FileRow, ApiError> {
    let row = db.get_file(file_id)?.ok_or(ApiError::Forbidden)?;
    let message = db
        .get_message(row.message_id)?
        .ok_or_else(|| anyhow::anyhow!("message {} missing for file {}", row.message_id, file_id))?;

    let membership = db.get_chat_membership(message.chat_id)?;
    if !allowed(user_id, membership.as_ref()) {
        return Err(ApiError::Forbidden);
    }
    Ok(row)
}

fn blob_path(upload_dir: &std::path::Path, file_id: i64) -> PathBuf {
    upload_dir.join(file_id.to_string())
}

fn to_response(row: FileRow) -> FileResponse {
    let context = format!("file {}", row.id);
    FileResponse {
        id: row.id,
        message_id: row.message_id,
        name: row.name.clone(),
        size: row.size as u64,
        created_at: parse_sqlite_timestamp(&row.created_at, &context),
    }
}
