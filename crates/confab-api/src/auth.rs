use std::path::PathBuf;
use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use rand::RngCore;

use confab_db::Database;
use confab_gateway::registry::SubscriptionRegistry;
use confab_types::api::{LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};

use crate::error::{ApiError, run_blocking};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub registry: SubscriptionRegistry,
    pub upload_dir: PathBuf,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(ApiError::BadRequest("username must be 3-32 characters"));
    }
    if req.password.len() < 8 {
        return Err(ApiError::BadRequest("password must be at least 8 characters"));
    }
    if !req.email.contains('@') {
        return Err(ApiError::BadRequest("invalid email address"));
    }

    let db = state.db.clone();
    let (user_id, token) = run_blocking(move || {
        if db.get_user_by_username(&req.username)?.is_some() {
            return Err(ApiError::Conflict);
        }

        // Hash password with Argon2id
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(req.password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("password hash: {e}"))?
            .to_string();

        let user_id = db.create_user(&req.username, &req.email, &password_hash)?;
        let token = issue_token(&db, user_id)?;
        Ok((user_id, token))
    })
    .await?;

    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id, token })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let response = run_blocking(move || {
        let user = db
            .get_user_by_username(&req.username)?
            .filter(|u| u.is_active)
            .ok_or(ApiError::Unauthenticated)?;

        let parsed_hash = PasswordHash::new(&user.password)
            .map_err(|e| anyhow::anyhow!("stored password hash unreadable: {e}"))?;

        Argon2::default()
            .verify_password(req.password.as_bytes(), &parsed_hash)
            .map_err(|_| ApiError::Unauthenticated)?;

        // A fresh token per login; earlier tokens stay valid, one per device.
        let token = issue_token(&db, user.id)?;

        Ok(LoginResponse {
            user_id: user.id,
            username: user.username,
            token,
        })
    })
    .await?;

    Ok(Json(response))
}

/// Mint an opaque bearer token and persist it for the user.
fn issue_token(db: &Database, user_id: i64) -> Result<String, ApiError> {
    let mut raw = [0u8; 32];
    rand::rng().fill_bytes(&mut raw);
    let token = hex::encode(raw);

    db.create_token(&token, user_id)?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_round_trips() {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(b"correct horse", &salt)
            .unwrap()
            .to_string();

        let parsed = PasswordHash::new(&hash).unwrap();
        assert!(
            Argon2::default()
                .verify_password(b"correct horse", &parsed)
                .is_ok()
        );
        assert!(
            Argon2::default()
                .verify_password(b"wrong", &parsed)
                .is_err()
        );
    }

    #[test]
    fn issued_tokens_are_unique_and_resolvable() {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", "alice@example.com", "hash").unwrap();

        // one token per login, all concurrently valid
        let first = issue_token(&db, alice).unwrap();
        let second = issue_token(&db, alice).unwrap();
        assert_ne!(first, second);
        assert_eq!(first.len(), 64);

        assert_eq!(db.resolve_token(&first).unwrap().unwrap().id, alice);
        assert_eq!(db.resolve_token(&second).unwrap().unwrap().id, alice);
    }
}
