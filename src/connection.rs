//! The Connection entity: one per attached client. Owns the socket, its
//! outbound queue, and the read/write pumps.

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    auth::AuthIdentity,
    hub::HubHandle,
    ingestion,
    model::PublicUserProfile,
    presence::PresenceCache,
    protocol::InboundFrame,
    store::PersistenceGateway,
};

/// Bounded FIFO depth for a connection's outbound queue.
pub const OUTBOUND_QUEUE_CAP: usize = 256;
/// Maximum inbound frame payload size in bytes.
pub const MAX_INBOUND_FRAME_BYTES: usize = 512;
/// Inbound read deadline, refreshed on activity.
pub const READ_DEADLINE: std::time::Duration = std::time::Duration::from_secs(60);
/// Outbound per-write deadline.
pub const WRITE_DEADLINE: std::time::Duration = std::time::Duration::from_secs(10);
/// Writer keepalive tick period: 90% of the peer's read deadline.
pub const KEEPALIVE_PERIOD: std::time::Duration = std::time::Duration::from_secs(54);

/// One attached client. `user_id` is immutable for the Connection's
/// lifetime; `room_id` is mutated in place by the Hub on `join_room` and is
/// therefore interior-mutable.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub user_id: i64,
    room_id: AtomicI64,
}

impl Connection {
    pub fn new(id: String, user_id: i64, room_id: i64) -> Self {
        Self {
            id,
            user_id,
            room_id: AtomicI64::new(room_id),
        }
    }

    pub fn room_id(&self) -> i64 {
        self.room_id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_room_id(&self, room_id: i64) {
        self.room_id.store(room_id, Ordering::SeqCst);
    }
}

/// Everything the reader task needs to dispatch inbound frames, beyond the
/// socket itself.
pub struct ReaderContext {
    pub conn: Arc<Connection>,
    pub identity: AuthIdentity,
    pub hub: HubHandle,
    pub persistence: Arc<dyn PersistenceGateway>,
    pub presence: Arc<dyn PresenceCache>,
}

/// Drains the outbound queue to the socket and runs the keepalive clock.
/// Exits (closing the socket) on any write error, write timeout, or once
/// the queue is closed by the Hub evicting this connection.
pub async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    conn_id: String,
) {
    let mut ticker = tokio::time::interval(KEEPALIVE_PERIOD);
    ticker.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(first) = frame else {
                    debug!(conn_id = %conn_id, "writer: queue closed, exiting");
                    break;
                };
                // Opportunistically coalesce any further already-queued
                // frames into the same write, bounded by what's pending.
                // Never blocks waiting for more.
                let mut batch = first;
                while let Ok(next) = rx.try_recv() {
                    batch.push('\n');
                    batch.push_str(&next);
                }
                match tokio::time::timeout(WRITE_DEADLINE, ws_tx.send(Message::Text(batch.into()))).await {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => {
                        debug!(conn_id = %conn_id, error = %e, "writer: send failed, exiting");
                        break;
                    },
                    Err(_) => {
                        warn!(conn_id = %conn_id, "writer: write deadline exceeded, exiting");
                        break;
                    },
                }
            }
            _ = ticker.tick() => {
                let probe = ws_tx.send(Message::Ping(Bytes::new()));
                match tokio::time::timeout(WRITE_DEADLINE, probe).await {
                    Ok(Ok(())) => {},
                    _ => {
                        debug!(conn_id = %conn_id, "writer: keepalive probe failed, exiting");
                        break;
                    },
                }
            }
        }
    }

    let _ = ws_tx.close().await;
}

/// Parses inbound frames and dispatches them. Exits on any read error,
/// protocol violation, oversize frame, or read-deadline expiry, always
/// funneling through `Hub.unregister` on the way out.
pub async fn run_reader(mut ws_rx: SplitStream<WebSocket>, ctx: ReaderContext) {
    loop {
        let next = match tokio::time::timeout(READ_DEADLINE, ws_rx.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!(conn_id = %ctx.conn.id, error = %e, "reader: protocol error, closing");
                break;
            },
            Ok(None) => {
                debug!(conn_id = %ctx.conn.id, "reader: stream ended, closing");
                break;
            },
            Err(_) => {
                warn!(conn_id = %ctx.conn.id, "reader: read deadline exceeded, closing");
                break;
            },
        };

        match next {
            Message::Text(text) => {
                let text = text.to_string();
                if text.as_bytes().len() > MAX_INBOUND_FRAME_BYTES {
                    warn!(conn_id = %ctx.conn.id, size = text.len(), "reader: frame exceeds size limit, closing");
                    break;
                }
                let frame: InboundFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(conn_id = %ctx.conn.id, error = %e, "reader: invalid frame, skipping");
                        continue;
                    },
                };
                if !dispatch(&ctx, frame).await {
                    break;
                }
            },
            Message::Close(_) => {
                debug!(conn_id = %ctx.conn.id, "reader: peer closed");
                break;
            },
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
        }
    }

    ctx.hub.unregister(ctx.conn.id.clone()).await;
}

/// Returns `false` when the reader loop should exit after handling this frame.
async fn dispatch(ctx: &ReaderContext, frame: InboundFrame) -> bool {
    match frame {
        InboundFrame::Message { content } => {
            ingestion::submit(ctx, &content).await;
            true
        },
        InboundFrame::JoinRoom { room_id } => {
            handle_join_room(ctx, room_id).await;
            true
        },
        InboundFrame::LeaveRoom => false,
    }
}

async fn handle_join_room(ctx: &ReaderContext, new_room_id: i64) {
    if let Err(e) = ctx
        .persistence
        .upsert_membership(new_room_id, ctx.conn.user_id)
        .await
    {
        warn!(conn_id = %ctx.conn.id, error = %e, "join_room: membership upsert failed");
        return;
    }

    let profile = ctx
        .persistence
        .load_user_public(ctx.conn.user_id)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| fallback_profile(&ctx.identity));

    ctx.hub
        .move_room(ctx.conn.id.clone(), new_room_id, profile)
        .await;
}

/// The public profile is a store read-through; when the store has no row
/// for this user (e.g. no registration system wired up), fall back to the
/// identity the Authenticator already verified rather than embedding nil.
/// This keeps the demo usable without inventing a user-registration flow.
pub fn fallback_profile(identity: &AuthIdentity) -> PublicUserProfile {
    PublicUserProfile {
        id: identity.user_id,
        username: identity.username.clone(),
        nickname: None,
        avatar: None,
    }
}
