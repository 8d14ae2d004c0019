use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use confab_types::models::CurrentUser;

use crate::auth::AppState;
use crate::error::{ApiError, run_blocking};

/// Extract the bearer token from the Authorization header and resolve it
/// against the token table. The resolved identity rides as a request
/// extension; missing or unknown tokens refuse the request outright.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthenticated)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthenticated)?
        .to_string();

    let db = state.db.clone();
    let user = run_blocking(move || Ok(db.resolve_token(&token)?))
        .await?
        .ok_or(ApiError::Unauthenticated)?;

    req.extensions_mut().insert(CurrentUser {
        id: user.id,
        username: user.username,
    });
    Ok(next.run(req).await)
}
