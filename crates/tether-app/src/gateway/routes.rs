use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_terminal::TerminalRegistry;
use tether_types::AuthenticatedUser;

use crate::auth::{bearer_token, Authenticator};
use crate::sessions::SessionDirectory;

use super::connection::{Connection, OUTBOUND_CAPACITY};
use super::error::{ApiError, ApiResult};
use super::protocol::ServerMessage;

/// Upper bound on flushing queued frames once a connection ends
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Application state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub registry: TerminalRegistry,
    pub directory: Arc<SessionDirectory>,
    pub auth: Arc<dyn Authenticator>,
}

/// Create router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // WebSocket endpoint
        .route("/ws", get(websocket_handler))
        // API routes
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:id", delete(delete_session))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub name: Option<String>,
}

/// GET /api/health
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "backend": state.registry.bridge().backend_name(),
        "degraded": state.registry.is_degraded(),
        "terminals": state.registry.len(),
    }))
}

/// GET /api/sessions - Sessions of the calling user
async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let user = authenticate_request(&state, &headers).await?;
    let sessions = state.directory.list_for_user(&user.user_id).await?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

/// POST /api/sessions - Create a session
async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionRequest>,
) -> ApiResult<Response> {
    let user = authenticate_request(&state, &headers).await?;
    let name = payload.name.unwrap_or_default();
    let session = state.directory.create(&user.user_id, &name).await?;
    Ok((StatusCode::CREATED, Json(session)).into_response())
}

/// DELETE /api/sessions/:id - Delete a session and its terminals
async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let user = authenticate_request(&state, &headers).await?;
    if state.directory.delete(&user.user_id, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("session {}", id)))
    }
}

async fn authenticate_request(
    state: &AppState,
    headers: &HeaderMap,
) -> ApiResult<AuthenticatedUser> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| ApiError::unauthorized("missing or invalid authorization"))?;
    state
        .auth
        .validate_token(token)
        .await
        .ok_or_else(|| ApiError::unauthorized("invalid token"))
}

/// GET /ws - WebSocket endpoint
///
/// A `token` query parameter authenticates during the upgrade; without one the
/// client must send `authenticate` first.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    let user = match query.token.as_deref() {
        Some(token) => match state.auth.validate_token(token).await {
            Some(user) => Some(user),
            None => return ApiError::unauthorized("invalid token").into_response(),
        },
        None => None,
    };
    ws.on_upgrade(move |socket| handle_websocket(socket, state, user))
}

/// Drive one WebSocket connection until either side closes it.
async fn handle_websocket(socket: WebSocket, state: AppState, user: Option<AuthenticatedUser>) {
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Spawn task to send messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "failed to encode server message");
                    continue;
                }
            };
            if ws_sink.send(WsMessage::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let mut conn = match user {
        Some(user) => {
            let _ = out_tx
                .send(ServerMessage::Authenticated {
                    user_id: user.user_id.clone(),
                    username: user.username.clone(),
                })
                .await;
            Connection::with_user(state, out_tx, user)
        }
        None => Connection::new(state, out_tx),
    };
    info!(
        user_id = conn.user().map(|u| u.user_id.as_str()).unwrap_or("-"),
        "websocket connected"
    );

    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                if conn.handle_text(&text).await.is_break() {
                    break;
                }
            }
            Ok(WsMessage::Close(_)) => break,
            // Pings are answered by axum; binary frames carry nothing we understand.
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        }
    }

    let subscriptions = conn.subscription_count();
    // Dropping the connection stops its forwarders and releases the last sender.
    drop(conn);
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
    info!(subscriptions, "websocket disconnected");
}
