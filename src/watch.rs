//! Watch subscription manager — creates, renews, and tears down provider
//! push channels, and runs the time-triggered renewal sweep.

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker;
use crate::error::SyncError;
use crate::providers::ResourceType;
use crate::store::db::{SubscriptionUpsert, WatchSubscription};
use crate::sync;
use crate::AppState;

/// Create a push channel for (user, provider, resource), superseding any
/// existing one.
///
/// Ordering matters: the new channel is created and persisted before the old
/// one is stopped, so there is never a gap with no coverage. The first
/// enable also runs one seed sync over the bounded window to populate the
/// mirror and obtain the initial cursor.
pub async fn create_or_renew(
    state: &AppState,
    user_id: &str,
    provider_id: &str,
    resource: ResourceType,
) -> Result<WatchSubscription, SyncError> {
    let provider = state
        .registry
        .get(provider_id)
        .ok_or_else(|| SyncError::ProviderNotFound(provider_id.to_string()))?;

    let access_token = broker::get_valid_token(state, user_id, provider_id).await?;

    let previous = state
        .store
        .get_subscription(user_id, provider_id, resource)
        .await?;

    // The channel token encodes the owner; verifying it on an inbound
    // notification resolves the user without touching the account table.
    let channel_id = Uuid::new_v4().to_string();
    let token_payload = format!("{user_id}:{provider_id}:{resource}");
    let channel_token = state.crypto.sign_channel_token(&token_payload)?;
    let notify_url = state.config.webhook_url(provider_id);

    let channel = provider
        .create_watch(&access_token, resource, &channel_id, &channel_token, &notify_url)
        .await?;

    state
        .store
        .upsert_subscription(&SubscriptionUpsert {
            user_id: user_id.to_string(),
            provider: provider_id.to_string(),
            resource_type: resource,
            channel_id: channel.channel_id.clone(),
            resource_id: channel.resource_id.clone(),
            expires_at: channel.expires_at,
        })
        .await?;

    info!(
        user_id,
        provider = provider_id,
        resource = %resource,
        channel_id = %channel.channel_id,
        "watch channel active"
    );

    // Seed the mirror on first enable (no cursor yet).
    let had_cursor = previous.as_ref().and_then(|s| s.cursor.as_deref()).is_some();
    if !had_cursor {
        let outcome = sync::sync(state, user_id, provider_id, resource).await?;
        info!(
            user_id,
            provider = provider_id,
            resource = %resource,
            applied = outcome.applied,
            "initial seed sync complete"
        );
    }

    // Stop the superseded channel only now that the new one is confirmed.
    if let Some(old) = previous {
        if old.channel_id != channel.channel_id {
            if let Err(e) = provider
                .stop_watch(&access_token, &old.channel_id, &old.resource_id)
                .await
            {
                warn!(
                    user_id,
                    provider = provider_id,
                    old_channel = %old.channel_id,
                    "failed to stop superseded channel (provider will expire it): {e}"
                );
            }
        }
    }

    state
        .store
        .get_subscription(user_id, provider_id, resource)
        .await?
        .ok_or_else(|| SyncError::Internal("subscription vanished after upsert".into()))
}

/// Disable watching: best-effort provider stop, then local cleanup of the
/// subscription and its mirrored records. A provider failure never blocks
/// the cleanup.
pub async fn stop(
    state: &AppState,
    user_id: &str,
    provider_id: &str,
    resource: ResourceType,
) -> Result<(), SyncError> {
    if let Some(sub) = state
        .store
        .get_subscription(user_id, provider_id, resource)
        .await?
    {
        let stop_result = async {
            let access_token = broker::get_valid_token(state, user_id, provider_id).await?;
            let provider = state
                .registry
                .get(provider_id)
                .ok_or_else(|| SyncError::ProviderNotFound(provider_id.to_string()))?;
            provider
                .stop_watch(&access_token, &sub.channel_id, &sub.resource_id)
                .await
        }
        .await;

        if let Err(e) = stop_result {
            warn!(
                user_id,
                provider = provider_id,
                channel_id = %sub.channel_id,
                "provider channel stop failed, cleaning up locally anyway: {e}"
            );
        }
    }

    state
        .store
        .delete_subscription(user_id, provider_id, resource)
        .await?;
    let removed = state
        .store
        .delete_records_for(user_id, provider_id, resource)
        .await?;

    info!(
        user_id,
        provider = provider_id,
        resource = %resource,
        records_removed = removed,
        "watch disabled and mirror cleared"
    );
    Ok(())
}

/// Background renewal sweep. Independent of webhook traffic: renewals never
/// block notification processing and vice versa.
pub async fn renewal_sweep(state: crate::SharedState) {
    let interval = tokio::time::Duration::from_secs(state.config.sweep_interval_secs);
    info!(
        interval_secs = state.config.sweep_interval_secs,
        "watch renewal sweep started"
    );

    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = sweep_cycle(&state).await {
            error!("renewal sweep cycle error: {e}");
        }
    }
}

async fn sweep_cycle(state: &AppState) -> Result<(), SyncError> {
    let lead = chrono::Duration::hours(state.config.renewal_lead_hours);
    let expiring = state.store.list_expiring_subscriptions(lead).await?;

    if expiring.is_empty() {
        return Ok(());
    }

    info!(count = expiring.len(), "subscriptions due for renewal");

    for sub in expiring {
        match create_or_renew(state, &sub.user_id, &sub.provider, sub.resource_type).await {
            Ok(renewed) => {
                info!(
                    user_id = %sub.user_id,
                    provider = %sub.provider,
                    resource = %sub.resource_type,
                    expires_at = ?renewed.expires_at,
                    "watch renewed"
                );
            }
            Err(SyncError::AuthExpired(msg)) => {
                // Already flagged by the broker; nothing further to retry.
                warn!(
                    user_id = %sub.user_id,
                    provider = %sub.provider,
                    "renewal blocked pending reauthorization: {msg}"
                );
            }
            Err(e) => {
                error!(
                    user_id = %sub.user_id,
                    provider = %sub.provider,
                    resource = %sub.resource_type,
                    "watch renewal failed: {e}"
                );
                let failures = state
                    .store
                    .bump_renewal_failures(&sub.user_id, &sub.provider, sub.resource_type)
                    .await?;

                // A subscription that keeps failing to renew is most likely
                // an auth problem; flag it rather than sweeping forever.
                if failures >= state.config.renewal_failure_threshold {
                    warn!(
                        user_id = %sub.user_id,
                        provider = %sub.provider,
                        failures,
                        "renewal failure threshold reached, flagging credential for reauthorization"
                    );
                    state
                        .store
                        .mark_needs_reauth(&sub.user_id, &sub.provider)
                        .await?;
                }
            }
        }
    }

    Ok(())
}

/// Background ledger pruning: trims processed-notification entries past the
/// retention window so the dedup table stays bounded.
pub async fn ledger_prune(state: crate::SharedState) {
    // Pruning hourly is plenty; retention is measured in days.
    let interval = tokio::time::Duration::from_secs(3600);

    loop {
        tokio::time::sleep(interval).await;
        let retention = chrono::Duration::hours(state.config.ledger_retention_hours);
        match state.store.prune_notifications(retention).await {
            Ok(0) => {}
            Ok(n) => info!(pruned = n, "notification ledger pruned"),
            Err(e) => error!("ledger prune error: {e}"),
        }
    }
}
