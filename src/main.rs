use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use clinassist::agent::{SessionManager, SessionOptions};
use clinassist::api::{start_server, ApiContext};
use clinassist::config::{self, ServerConfig};
use clinassist::connection::ConnectionRegistry;
use clinassist::llm::GeminiClient;
use clinassist::storage::GcsStore;
use clinassist::voice::VoiceAdapter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    let config = ServerConfig::from_env();
    tracing::info!(
        version = config::APP_VERSION,
        bucket = %config.bucket,
        model = %config.llm_model,
        "{} starting",
        config::APP_NAME
    );

    if config.llm_api_key.is_empty() {
        tracing::warn!("GOOGLE_API_KEY is not set; model calls will fail until it is provided");
    }

    let store = Arc::new(GcsStore::new(
        &config.bucket,
        config.storage_token.clone(),
        config.upstream_timeout,
    ));
    let llm = Arc::new(GeminiClient::new(
        &config.llm_api_key,
        &config.llm_model,
        config.upstream_timeout,
    ));
    let voice = Arc::new(VoiceAdapter::from_config(&config));

    let sessions = Arc::new(SessionManager::new(
        llm,
        store.clone(),
        SessionOptions {
            max_tool_rounds: config.max_tool_rounds,
            history_limit: config.history_limit,
            tools_enabled: true,
        },
    ));

    let ctx = ApiContext::new(
        sessions,
        Arc::new(ConnectionRegistry::new()),
        store,
        voice,
    );

    let mut server = match start_server(ctx, config.bind_addr).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to start server: {e}");
            std::process::exit(1);
        }
    };

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!("Shutdown signal received");
    server.shutdown();
    server.join().await;
}
