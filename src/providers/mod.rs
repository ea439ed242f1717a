mod google;
mod microsoft;
mod registry;
mod traits;

pub use google::GoogleProvider;
pub use microsoft::MicrosoftProvider;
pub use registry::ProviderRegistry;
pub use traits::{
    ChangePage, ChangeRequest, RemoteChange, RemoteItem, ResourceType, SyncProvider, SyncWindow,
    TokenSet, WatchChannel,
};

use crate::config::Config;

/// Register all providers that have credentials configured.
pub fn register_defaults(registry: &mut ProviderRegistry, config: &Config) {
    if let (Some(id), Some(secret)) = (&config.google_client_id, &config.google_client_secret) {
        registry.register(Box::new(GoogleProvider::new(
            id.clone(),
            secret.clone(),
            config.provider_timeout_secs,
        )));
    }

    if let (Some(id), Some(secret)) = (
        &config.microsoft_client_id,
        &config.microsoft_client_secret,
    ) {
        registry.register(Box::new(MicrosoftProvider::new(
            id.clone(),
            secret.clone(),
            config.provider_timeout_secs,
        )));
    }
}
