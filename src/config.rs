//! Layered startup configuration: CLI flags override environment
//! variables, which override the defaults below.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "chatfabric", about = "Multi-room real-time chat fabric")]
pub struct AppConfig {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "CHATFABRIC_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Port to listen on.
    #[arg(long, env = "CHATFABRIC_PORT", default_value_t = 8080)]
    pub port: u16,

    /// SQLite connection string for the durable store.
    #[arg(long, env = "CHATFABRIC_DATABASE_URL", default_value = "sqlite://chatfabric.db")]
    pub database_url: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CHATFABRIC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long, env = "CHATFABRIC_JSON_LOGS", default_value_t = false)]
    pub json_logs: bool,
}

impl AppConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Initialize `tracing` with an `EnvFilter`, human- or JSON-formatted
/// depending on `config.json_logs`.
pub fn init_telemetry(config: &AppConfig) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_ids(false))
            .init();
    }
}
