//! ollama-gateway binary: wires configuration, credential store, tokenizer,
//! backend client and the HTTP router, then serves until Ctrl-C.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use ollama_gateway::auth::memory::InMemoryAuthStore;
use ollama_gateway::auth::sqlite::SqliteAuthStore;
use ollama_gateway::auth::AuthService;
use ollama_gateway::config::{Cli, Config};
use ollama_gateway::inference::backend::OllamaClient;
use ollama_gateway::inference::engine::GenerationEngine;
use ollama_gateway::inference::tokenizer::BpeTokenizer;
use ollama_gateway::metrics::Metrics;
use ollama_gateway::server::openai_api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "ollama_gateway=debug,tower_http=debug"
    } else {
        "ollama_gateway=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());

    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("ollama-gateway v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    config.validate()?;
    let config = Arc::new(config);

    info!(
        backend = config.backend.base_url,
        max_retries = config.backend.max_retries,
        default_model = config.defaults.model,
        "Configuration loaded"
    );

    // Credential store.
    let auth: Arc<dyn AuthService> = match &config.auth.database_url {
        Some(url) => {
            info!("Using SQLite credential store");
            Arc::new(SqliteAuthStore::connect(url).await?)
        }
        None => {
            warn!("No auth.database_url configured, credentials are kept in memory");
            Arc::new(InMemoryAuthStore::new())
        }
    };
    auth.seed(&config.auth.models, &config.auth.keys).await?;
    if config.auth.admin_token.is_none() {
        warn!("No auth.admin_token configured, POST /v1/api_keys is open to anyone");
    }

    // Tokenizer and backend.
    let tokenizer = BpeTokenizer::for_encoding(&config.tokenizer.encoding)?;
    info!(encoding = tokenizer.encoding(), "Tokenizer loaded");
    let backend = OllamaClient::new(&config.backend)?;

    let engine = GenerationEngine::new(Arc::new(backend), Arc::new(tokenizer), &config.backend);

    // Build application state.
    let state = Arc::new(AppState {
        engine,
        auth,
        config: config.clone(),
        metrics: Arc::new(Metrics::new()?),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
