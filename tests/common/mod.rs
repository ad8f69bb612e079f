//! Shared test server bootstrap for the end-to-end socket suite.

#![allow(dead_code)]

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use sqlx::sqlite::SqlitePoolOptions;

use chatfabric::{
    auth::{AuthIdentity, StaticTokenAuthenticator},
    hub,
    presence::InMemoryPresenceCache,
    routes::{AppState, build_router},
    store::{PersistenceGateway, SqliteStore},
};

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<SqliteStore>,
}

impl TestServer {
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }
}

/// Token -> (user_id, username) seeded into both the authenticator and the
/// `users` table so message/join_room author projections resolve.
pub async fn start_test_server(users: &[(&str, i64, &str)]) -> TestServer {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect in-memory sqlite");
    let store = Arc::new(SqliteStore::new(pool));
    store.migrate().await.expect("run migrations");

    let mut tokens = HashMap::new();
    for (token, user_id, username) in users {
        sqlx::query(
            "INSERT INTO users (id, username, nickname, avatar, is_online) VALUES (?, ?, NULL, NULL, 0)",
        )
        .bind(user_id)
        .bind(username)
        .execute(&store.pool_for_tests())
        .await
        .expect("seed user");
        tokens.insert(
            token.to_string(),
            AuthIdentity {
                user_id: *user_id,
                username: username.to_string(),
                email: format!("{username}@example.com"),
            },
        );
    }
    let authenticator = Arc::new(StaticTokenAuthenticator::new(tokens));

    let persistence: Arc<dyn chatfabric::store::PersistenceGateway> = store.clone();
    let presence: Arc<dyn chatfabric::presence::PresenceCache> = Arc::new(InMemoryPresenceCache::new());
    let hub_handle = hub::spawn(persistence.clone(), presence.clone());

    let state = AppState {
        hub: hub_handle,
        persistence,
        presence,
        authenticator,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server exited");
    });

    TestServer { addr, store }
}

/// Mark `room_id`/`user_id` as a member, bypassing the wire protocol so
/// tests can set up fixtures directly.
pub async fn seed_membership(store: &SqliteStore, room_id: i64, user_id: i64) {
    store
        .upsert_membership(room_id, user_id)
        .await
        .expect("seed membership");
}
