mod backend;
mod config;
mod error;
mod memory;
mod platform;
mod relay;
mod scheduler;
mod server;
mod signature;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::backend::DifyClient;
use crate::config::Config;
use crate::memory::{
    ConversationStore, InMemoryConversationStore, SeenEvents, SqliteConversationStore,
    SEEN_EVENT_TTL,
};
use crate::platform::slack::SlackClient;
use crate::relay::{Relay, RelaySettings};
use crate::scheduler::Housekeeping;
use crate::server::AppState;
use crate::signature::SignatureVerifier;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    // RUST_LOG wins over LOG_LEVEL
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Configuration loaded successfully");
    info!("  Backend: {}", config.backend.base_url);
    info!("  Response mode: {}", config.backend.response_mode);
    info!("  Request timeout: {:?}", config.backend.request_timeout);
    info!(
        "  Files: up to {} bytes, {} types",
        config.files.max_file_size,
        config.files.supported_types.len()
    );

    let conversations: Arc<dyn ConversationStore> = match &config.conversations.database_path {
        Some(path) => Arc::new(
            SqliteConversationStore::open(path, config.conversations.ttl)
                .context("Failed to open conversation store")?,
        ),
        None => {
            info!("Conversation store: in memory");
            Arc::new(InMemoryConversationStore::new(config.conversations.ttl))
        }
    };

    let slack = SlackClient::new(&config.slack.bot_token)?;
    let bot_user_id = match slack.auth_test().await {
        Ok(id) => {
            info!("Authenticated as bot user {}", id);
            Some(id)
        }
        Err(e) => {
            warn!("Could not resolve bot user id, self-message filtering is limited: {:#}", e);
            None
        }
    };

    let backend = DifyClient::new(config.backend.clone())?;
    let relay = Relay::new(
        Arc::new(backend),
        Arc::new(slack),
        conversations.clone(),
        RelaySettings {
            response_mode: config.backend.response_mode,
            request_timeout: config.backend.request_timeout,
            suggested_questions: config.backend.suggested_questions,
            files: config.files.clone(),
            bot_user_id,
        },
    );

    let mut housekeeping =
        Housekeeping::start(conversations.clone(), scheduler::tasks::PURGE_SCHEDULE).await?;

    let state = AppState {
        verifier: Arc::new(SignatureVerifier::new(&config.slack.signing_secret)),
        relay: Arc::new(relay),
        conversations,
        seen_events: Arc::new(SeenEvents::new(SEEN_EVENT_TTL)),
    };
    let app = server::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    housekeeping.shutdown().await?;
    Ok(())
}
