//! PersistenceGateway: the narrow adapter over the durable store the core
//! consumes. Six operations only; room CRUD, pagination, and history over
//! HTTP are out of scope and live elsewhere.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::model::{ChatKind, ChatRecord, PublicUserProfile};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn is_member(&self, room_id: i64, user_id: i64) -> StoreResult<bool>;
    async fn insert_chat_record(
        &self,
        room_id: i64,
        user_id: i64,
        kind: ChatKind,
        content: &str,
    ) -> StoreResult<ChatRecord>;
    async fn upsert_membership(&self, room_id: i64, user_id: i64) -> StoreResult<()>;
    async fn load_user_public(&self, user_id: i64) -> StoreResult<Option<PublicUserProfile>>;
    async fn set_user_presence(
        &self,
        user_id: i64,
        online: bool,
        last_seen: Option<chrono::DateTime<Utc>>,
    ) -> StoreResult<()>;
    async fn list_public_users(&self, user_ids: &[i64]) -> StoreResult<Vec<PublicUserProfile>>;
}

/// `sqlx`-backed implementation over SQLite, with embedded migrations run
/// at startup.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run the embedded migrations. Failure here is fatal at startup: the
    /// process exits non-zero rather than serving against an unmigrated
    /// schema.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Exposes the underlying pool for test fixtures that need to seed rows
    /// outside the `PersistenceGateway` surface (e.g. `users` rows with no
    /// corresponding operation).
    pub fn pool_for_tests(&self) -> SqlitePool {
        self.pool.clone()
    }
}

#[async_trait]
impl PersistenceGateway for SqliteStore {
    async fn is_member(&self, room_id: i64, user_id: i64) -> StoreResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM room_memberships WHERE room_id = ? AND user_id = ? LIMIT 1",
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn insert_chat_record(
        &self,
        room_id: i64,
        user_id: i64,
        kind: ChatKind,
        content: &str,
    ) -> StoreResult<ChatRecord> {
        let kind_str = match kind {
            ChatKind::Text => "text",
            ChatKind::Image => "image",
            ChatKind::File => "file",
            ChatKind::System => "system",
        };
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO chat_records (room_id, user_id, kind, content, created_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(kind_str)
        .bind(content)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(ChatRecord {
            id,
            room_id,
            user_id,
            kind,
            content: content.to_string(),
            file_url: None,
            file_name: None,
            created_at: now,
        })
    }

    async fn upsert_membership(&self, room_id: i64, user_id: i64) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO room_memberships (room_id, user_id, role, joined_at)
             VALUES (?, ?, 'member', ?)
             ON CONFLICT(room_id, user_id) DO NOTHING",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_user_public(&self, user_id: i64) -> StoreResult<Option<PublicUserProfile>> {
        let row: Option<(i64, String, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT id, username, nickname, avatar FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, username, nickname, avatar)| PublicUserProfile {
            id,
            username,
            nickname,
            avatar,
        }))
    }

    async fn set_user_presence(
        &self,
        user_id: i64,
        online: bool,
        last_seen: Option<chrono::DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE users SET is_online = ?, last_seen = COALESCE(?, last_seen) WHERE id = ?")
            .bind(online)
            .bind(last_seen)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_public_users(&self, user_ids: &[i64]) -> StoreResult<Vec<PublicUserProfile>> {
        let mut out = Vec::with_capacity(user_ids.len());
        for id in user_ids {
            if let Some(profile) = self.load_user_public(*id).await? {
                out.push(profile);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteStore {
        // A single connection so the in-memory database isn't reset between
        // pooled connections.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    async fn seed_user(store: &SqliteStore, id: i64, username: &str) {
        sqlx::query("INSERT INTO users (id, username, nickname, avatar, is_online) VALUES (?, ?, NULL, NULL, 0)")
            .bind(id)
            .bind(username)
            .execute(&store.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn membership_round_trips() {
        let store = test_store().await;
        seed_user(&store, 1, "ada").await;
        assert!(!store.is_member(1, 1).await.unwrap());
        store.upsert_membership(1, 1).await.unwrap();
        assert!(store.is_member(1, 1).await.unwrap());
        // Idempotent: a second upsert doesn't fail or duplicate.
        store.upsert_membership(1, 1).await.unwrap();
    }

    #[tokio::test]
    async fn chat_record_insert_and_profile_lookup() {
        let store = test_store().await;
        seed_user(&store, 1, "ada").await;
        let record = store
            .insert_chat_record(1, 1, ChatKind::Text, "hi")
            .await
            .unwrap();
        assert_eq!(record.content, "hi");
        assert!(record.id > 0);

        let profile = store.load_user_public(1).await.unwrap().unwrap();
        assert_eq!(profile.username, "ada");

        assert!(store.load_user_public(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn presence_update_does_not_clobber_last_seen_when_absent() {
        let store = test_store().await;
        seed_user(&store, 1, "ada").await;
        store.set_user_presence(1, true, None).await.unwrap();
    }
}
