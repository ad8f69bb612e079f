//! The attach endpoint: upgrades an authenticated request to the chat
//! transport and registers the resulting Connection with the Hub. Never
//! blocks on fan-out; registration is handed off to the Hub's command loop
//! and the upgrade returns immediately after.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::stream::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    auth::{self, AuthError, Authenticator},
    connection::{self, Connection, OUTBOUND_QUEUE_CAP, ReaderContext, fallback_profile},
    hub::HubHandle,
    presence::PresenceCache,
    store::PersistenceGateway,
};

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub persistence: Arc<dyn PersistenceGateway>,
    pub presence: Arc<dyn PresenceCache>,
    pub authenticator: Arc<dyn Authenticator>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/ws", get(attach))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct AttachQuery {
    room_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum AttachError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for AttachError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AttachError::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()),
            AttachError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
        };
        (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<AuthError> for AttachError {
    fn from(_: AuthError) -> Self {
        AttachError::Unauthenticated
    }
}

/// `GET /api/v1/ws?room_id=<uint>`.
async fn attach(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AttachQuery>,
) -> Result<Response, AttachError> {
    let bearer = auth::parse_bearer(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
    )?;
    let identity = state.authenticator.verify(bearer).await?;

    let room_id = match query.room_id {
        None => 1,
        Some(raw) => raw
            .parse::<u64>()
            .map(|id| id as i64)
            .map_err(|_| AttachError::BadRequest(format!("invalid room_id: {raw}")))?,
    };

    let profile = state
        .persistence
        .load_user_public(identity.user_id)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| fallback_profile(&identity));

    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, user_id = identity.user_id, room_id, "attach: upgrading connection");

    Ok(ws.on_upgrade(move |socket| async move {
        let conn = Arc::new(Connection::new(conn_id.clone(), identity.user_id, room_id));
        let (tx, rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAP);
        let (ws_tx, ws_rx) = socket.split();

        let writer_handle = tokio::spawn(connection::run_writer(ws_tx, rx, conn_id.clone()));

        state.hub.register(conn.clone(), profile, tx).await;

        let reader_ctx = ReaderContext {
            conn,
            identity,
            hub: state.hub.clone(),
            persistence: state.persistence.clone(),
            presence: state.presence.clone(),
        };
        connection::run_reader(ws_rx, reader_ctx).await;

        let _ = writer_handle.await;
    }))
}
