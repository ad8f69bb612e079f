//! Domain types carried by the core, independent of the wire envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable chat message kind. The core only ever writes `Text` and `System`;
/// `Image`/`File` rows are read-through from the store unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Text,
    Image,
    File,
    System,
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: i64,
    pub room_id: i64,
    pub user_id: i64,
    pub kind: ChatKind,
    pub content: String,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A room membership role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Creator,
    Admin,
    Member,
}

/// A durable room membership row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub room_id: i64,
    pub user_id: i64,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

/// The public projection of a user, safe to embed in outbound frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicUserProfile {
    pub id: i64,
    pub username: String,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
}

/// A chat record with its author's public profile embedded, as delivered to
/// clients over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecordView {
    #[serde(flatten)]
    pub record: ChatRecord,
    pub user: Option<PublicUserProfile>,
}
