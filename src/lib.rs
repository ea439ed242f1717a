pub mod api;
pub mod broker;
pub mod config;
pub mod crypto;
pub mod error;
pub mod providers;
pub mod store;
pub mod sync;
pub mod watch;
pub mod webhooks;

pub use config::Config;
pub use error::SyncError;

use std::sync::Arc;

/// Shared application state passed to all API handlers and daemons.
pub struct AppState {
    pub config: Config,
    pub store: store::MirrorStore,
    pub crypto: crypto::CryptoEngine,
    pub registry: providers::ProviderRegistry,
    /// Serializes token refresh per (user, provider).
    pub refresh_gate: sync::KeyedGate,
    /// Serializes sync runs per (user, provider, resource).
    pub sync_gate: sync::KeyedGate,
}

pub type SharedState = Arc<AppState>;
