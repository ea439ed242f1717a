use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use calsync::config::Config;
use calsync::crypto::CryptoEngine;
use calsync::providers::{self, ProviderRegistry};
use calsync::store::MirrorStore;
use calsync::sync::KeyedGate;
use calsync::{api, watch, AppState, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calsync=info".into()),
        )
        .init();

    // Load config
    let config = Config::from_env()?;
    info!("calsync v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}:{}", config.host, config.port);

    // Initialize components
    let crypto = CryptoEngine::new(&config.master_key, &config.hmac_secret)?;
    let store = MirrorStore::new(&config.database_url).await?;
    store.migrate().await?;
    info!("Database connected and migrated ✓");

    let mut registry = ProviderRegistry::new();
    providers::register_defaults(&mut registry, &config);
    info!("Registered {} sync providers", registry.count());

    // Build shared state
    let state: SharedState = Arc::new(AppState {
        config: config.clone(),
        store,
        crypto,
        registry,
        refresh_gate: KeyedGate::new(),
        sync_gate: KeyedGate::new(),
    });

    // Start the channel renewal sweep and the notification-ledger pruner
    let sweep_state = state.clone();
    tokio::spawn(async move {
        watch::renewal_sweep(sweep_state).await;
    });
    let prune_state = state.clone();
    tokio::spawn(async move {
        watch::ledger_prune(prune_state).await;
    });

    // Build router
    let app = api::router(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server ready ✓");
    axum::serve(listener, app).await?;

    Ok(())
}
