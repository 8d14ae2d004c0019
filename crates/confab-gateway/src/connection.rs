use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use confab_db::Database;
use confab_types::models::CurrentUser;
use confab_types::policy;

use crate::registry::SubscriptionRegistry;

/// A connection that has not finished authenticating within this window is
/// refused, so slow or malicious clients cannot pile up half-open handshakes.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Query parameters accepted at connection establishment. The token rides in
/// the query string because websocket clients cannot reliably set headers.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
}

/// A handshake refusal. Terminal for the attempt; the server maps these onto
/// 401/403 before the upgrade ever happens.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("missing or unknown token")]
    Unauthenticated,
    #[error("not found or forbidden")]
    Forbidden,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Run the Authenticating and Authorizing phases for a pending connection:
/// resolve the bearer token, then check chat membership. An unknown chat and
/// a chat the user is not part of refuse identically.
pub async fn authenticate_subscriber(
    db: Arc<Database>,
    token: Option<String>,
    chat_id: i64,
) -> Result<CurrentUser, HandshakeError> {
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or(HandshakeError::Unauthenticated)?;

    let resolved = {
        let db = db.clone();
        tokio::task::spawn_blocking(move || db.resolve_token(&token))
            .await
            .map_err(|e| anyhow::anyhow!("token lookup task failed: {e}"))??
    };
    let user = resolved.ok_or(HandshakeError::Unauthenticated)?;

    let membership = tokio::task::spawn_blocking(move || db.get_chat_membership(chat_id))
        .await
        .map_err(|e| anyhow::anyhow!("membership lookup task failed: {e}"))??;

    if !policy::can_read(user.id, membership.as_ref()) {
        return Err(HandshakeError::Forbidden);
    }

    Ok(CurrentUser {
        id: user.id,
        username: user.username,
    })
}

/// Drive one subscribed connection until it goes away: forward registry
/// events to the client in publish order, answer pings, and watch for the
/// close frame. The subscription guard unregisters on every exit path.
pub async fn serve_subscriber(
    socket: WebSocket,
    registry: SubscriptionRegistry,
    chat_id: i64,
    user: CurrentUser,
) {
    let (subscription, mut events) = registry.join(chat_id);
    info!(user = %user.username, chat_id, "subscriber connected");

    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately
    let mut missed_heartbeats: u8 = 0;
    let mut pong_received = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(chat_id, "failed to serialize event: {e}");
                        continue;
                    }
                };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Pong(_))) => {
                        pong_received = true;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    // Subscribers only listen; other inbound frames carry nothing.
                    Some(Ok(_)) => {}
                }
            }
            _ = heartbeat.tick() => {
                if pong_received {
                    missed_heartbeats = 0;
                    pong_received = false;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!(
                            user = %user.username,
                            chat_id,
                            "heartbeat timeout (missed {} pongs), dropping connection",
                            missed_heartbeats
                        );
                        break;
                    }
                }
                if sender.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }

    subscription.leave();
    info!(user = %user.username, chat_id, "subscriber disconnected");
}
