//! PresenceCache: an optional external map of user -> {room, timestamp}.
//! When unavailable, the Hub continues correctly and `online_users`
//! degrades to a best-effort (possibly empty) answer.
//!
//! [`InMemoryPresenceCache`] is the one concrete implementation shipped with
//! this crate: a `dashmap`-backed TTL map. It is a real, swappable
//! collaborator behind the trait, not a hardwired dependency of the Hub.

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

const PRESENCE_TTL: Duration = Duration::from_secs(30 * 60);
const RECENT_MESSAGES_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const RECENT_MESSAGES_CAP: usize = 100;

#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub user_id: i64,
    pub room_id: i64,
    pub unix_timestamp: i64,
}

#[async_trait]
pub trait PresenceCache: Send + Sync {
    async fn set_user_online(&self, user_id: i64, room_id: i64);
    async fn set_user_offline(&self, user_id: i64);
    async fn list_online_in_room(&self, room_id: i64) -> Vec<i64>;
    async fn push_recent_message(&self, room_id: i64, payload: String);
    async fn read_recent_messages(&self, room_id: i64, limit: usize) -> Vec<String>;
}

struct RecentEntry {
    payload: String,
    inserted_at: Instant,
}

/// A process-local stand-in for an external presence/recency cache (e.g.
/// Redis in a horizontally-scaled deployment). All operations are
/// infallible by construction: there is nothing to fail.
#[derive(Default)]
pub struct InMemoryPresenceCache {
    presence: DashMap<i64, (PresenceEntry, Instant)>,
    recent: DashMap<i64, VecDeque<RecentEntry>>,
}

impl InMemoryPresenceCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceCache for InMemoryPresenceCache {
    async fn set_user_online(&self, user_id: i64, room_id: i64) {
        let entry = PresenceEntry {
            user_id,
            room_id,
            unix_timestamp: chrono::Utc::now().timestamp(),
        };
        self.presence.insert(user_id, (entry, Instant::now()));
    }

    async fn set_user_offline(&self, user_id: i64) {
        self.presence.remove(&user_id);
    }

    async fn list_online_in_room(&self, room_id: i64) -> Vec<i64> {
        self.presence
            .iter()
            .filter(|entry| {
                let (presence, inserted_at) = entry.value();
                presence.room_id == room_id && inserted_at.elapsed() < PRESENCE_TTL
            })
            .map(|entry| entry.value().0.user_id)
            .collect()
    }

    async fn push_recent_message(&self, room_id: i64, payload: String) {
        let mut bucket = self.recent.entry(room_id).or_default();
        bucket.push_back(RecentEntry {
            payload,
            inserted_at: Instant::now(),
        });
        while bucket.len() > RECENT_MESSAGES_CAP {
            bucket.pop_front();
        }
    }

    async fn read_recent_messages(&self, room_id: i64, limit: usize) -> Vec<String> {
        match self.recent.get(&room_id) {
            Some(bucket) => bucket
                .iter()
                .filter(|entry| entry.inserted_at.elapsed() < RECENT_MESSAGES_TTL)
                .rev()
                .take(limit)
                .map(|entry| entry.payload.clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

/// A cache that performs no work and never retains anything. The fallback
/// when no cache is configured at all.
#[derive(Default)]
pub struct NoopPresenceCache;

#[async_trait]
impl PresenceCache for NoopPresenceCache {
    async fn set_user_online(&self, _user_id: i64, _room_id: i64) {}
    async fn set_user_offline(&self, _user_id: i64) {}
    async fn list_online_in_room(&self, _room_id: i64) -> Vec<i64> {
        Vec::new()
    }
    async fn push_recent_message(&self, _room_id: i64, _payload: String) {}
    async fn read_recent_messages(&self, _room_id: i64, _limit: usize) -> Vec<String> {
        Vec::new()
    }
}
