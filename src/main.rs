use std::{collections::HashMap, sync::Arc};

use clap::Parser;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{error, info};

use chatfabric::{
    auth::{AuthIdentity, StaticTokenAuthenticator},
    config::{AppConfig, init_telemetry},
    hub,
    presence::InMemoryPresenceCache,
    routes::{AppState, build_router},
    store::SqliteStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::parse();
    init_telemetry(&config);

    let pool = match SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "failed to connect to store");
            std::process::exit(1);
        },
    };

    let store = SqliteStore::new(pool);
    if let Err(e) = store.migrate().await {
        error!(error = %e, "failed to run store migrations");
        std::process::exit(1);
    }

    let persistence: Arc<dyn chatfabric::store::PersistenceGateway> = Arc::new(store);
    let presence: Arc<dyn chatfabric::presence::PresenceCache> = Arc::new(InMemoryPresenceCache::new());
    let hub_handle = hub::spawn(persistence.clone(), presence.clone());

    // Token minting and registration/login are out of scope for the core;
    // a fixed dev-time token table stands in so the fabric is exercisable
    // end to end.
    let mut tokens = HashMap::new();
    tokens.insert(
        "dev-token".to_string(),
        AuthIdentity {
            user_id: 1,
            username: "dev".to_string(),
            email: "dev@example.com".to_string(),
        },
    );
    let authenticator = Arc::new(StaticTokenAuthenticator::new(tokens));

    let state = AppState {
        hub: hub_handle,
        persistence,
        presence,
        authenticator,
    };

    let app = build_router(state);
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "chatfabric listening");

    axum::serve(listener, app).await?;

    Ok(())
}
