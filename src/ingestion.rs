//! MessageIngestion: validates an inbound chat frame, persists it, updates
//! caches, and hands it to the Hub for fan-out. This pipeline is
//! deliberately not a distributed transaction. A crash between persisting
//! and broadcasting leaves a persisted-but-unbroadcast message, which is
//! the chosen failure mode.

use tracing::{debug, warn};

use crate::{
    connection::ReaderContext,
    model::{ChatKind, ChatRecordView},
    protocol::OutboundFrame,
};

/// Validate, persist, cache, and broadcast one chat message from `conn`.
/// Every early return here is a silent no-op to the sender by design:
/// this layer is fire-and-forget.
pub async fn submit(ctx: &ReaderContext, content: &str) {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return;
    }

    let room_id = ctx.conn.room_id();
    let user_id = ctx.conn.user_id;

    match ctx.persistence.is_member(room_id, user_id).await {
        Ok(true) => {},
        Ok(false) => {
            debug!(user_id, room_id, "ingestion: dropping message from non-member");
            return;
        },
        Err(e) => {
            warn!(user_id, room_id, error = %e, "ingestion: membership check failed");
            return;
        },
    }

    let record = match ctx
        .persistence
        .insert_chat_record(room_id, user_id, ChatKind::Text, trimmed)
        .await
    {
        Ok(record) => record,
        Err(e) => {
            warn!(user_id, room_id, error = %e, "ingestion: failed to persist chat record, aborting");
            return;
        },
    };

    // Embed nil when the author's public profile is unavailable, rather
    // than falling back. Unlike the join/attach path, this is the
    // contract for a message's author projection.
    let author = ctx
        .persistence
        .load_user_public(user_id)
        .await
        .unwrap_or(None);

    let view = ChatRecordView {
        record: record.clone(),
        user: author,
    };

    let serialized = match serde_json::to_string(&view) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "ingestion: failed to serialize chat record for cache");
            String::new()
        },
    };
    if !serialized.is_empty() {
        ctx.presence.push_recent_message(room_id, serialized).await;
    }

    ctx.hub
        .broadcast(room_id, OutboundFrame::Message { room_id, data: view })
        .await;
}
