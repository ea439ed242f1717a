//! Token broker — owns OAuth credential lifecycle per (user, provider).
//!
//! Callers never read credentials directly; they ask the broker for a
//! currently-valid access token. Refreshes are serialized per credential so
//! two concurrent callers produce exactly one refresh-token exchange — some
//! providers invalidate a refresh token after first use, so a duplicate
//! concurrent exchange is a correctness hazard, not just wasted work.

use std::future::Future;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::sync::KeyedGate;
use crate::AppState;

/// Get a valid access token for (user, provider), refreshing if needed.
///
/// A credential flagged `needs_reauth` always yields `AuthExpired`; that
/// state is terminal until the end user reconnects, and callers must not
/// retry it automatically.
pub async fn get_valid_token(
    state: &AppState,
    user_id: &str,
    provider_id: &str,
) -> Result<String, SyncError> {
    let gate_key = format!("{user_id}:{provider_id}");
    refresh_deduped(
        &state.refresh_gate,
        &gate_key,
        || fresh_token(state, user_id, provider_id),
        || exchange_and_store(state, user_id, provider_id),
    )
    .await
}

/// The check / acquire / re-check / refresh sequence.
///
/// `fresh` returns the cached token when it is still comfortably valid.
/// The second `fresh` call runs under the gate, so a caller that waited
/// behind an in-flight refresh finds the new token and skips the exchange.
async fn refresh_deduped<C, CFut, R, RFut>(
    gate: &KeyedGate,
    key: &str,
    fresh: C,
    refresh: R,
) -> Result<String, SyncError>
where
    C: Fn() -> CFut,
    CFut: Future<Output = Result<Option<String>, SyncError>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = Result<String, SyncError>>,
{
    // Fast path: token is still comfortably valid, no network call.
    if let Some(token) = fresh().await? {
        return Ok(token);
    }

    let _guard = gate.acquire(key).await;

    if let Some(token) = fresh().await? {
        return Ok(token);
    }

    refresh().await
}

/// Perform the refresh-token exchange and persist the result. Runs only
/// under the refresh gate.
async fn exchange_and_store(
    state: &AppState,
    user_id: &str,
    provider_id: &str,
) -> Result<String, SyncError> {
    let cred = state
        .store
        .get_credential(&state.crypto, user_id, provider_id)
        .await?
        .ok_or_else(|| SyncError::NotFound("credential".into()))?;

    let refresh_token = cred
        .refresh_token
        .as_deref()
        .ok_or_else(|| SyncError::AuthExpired("no refresh token stored".into()))?;

    let provider = state
        .registry
        .get(provider_id)
        .ok_or_else(|| SyncError::ProviderNotFound(provider_id.to_string()))?;

    match provider.refresh_token(refresh_token).await {
        Ok(tokens) => {
            let expires_at = tokens
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));

            state
                .store
                .update_refreshed_tokens(
                    &state.crypto,
                    user_id,
                    provider_id,
                    &tokens.access_token,
                    tokens.refresh_token.as_deref(),
                    expires_at,
                )
                .await?;

            info!(user_id, provider = provider_id, "access token refreshed");
            Ok(tokens.access_token)
        }
        Err(SyncError::AuthExpired(msg)) => {
            // Refresh token revoked or expired: flag for reauthorization and
            // surface "reconnect required". Never retried automatically.
            warn!(
                user_id,
                provider = provider_id,
                "refresh token rejected, credential needs reauthorization: {msg}"
            );
            state.store.mark_needs_reauth(user_id, provider_id).await?;
            Err(SyncError::AuthExpired(msg))
        }
        Err(e) => Err(e),
    }
}

/// Return the cached access token if it is valid past the safety margin.
async fn fresh_token(
    state: &AppState,
    user_id: &str,
    provider_id: &str,
) -> Result<Option<String>, SyncError> {
    let cred = match state
        .store
        .get_credential(&state.crypto, user_id, provider_id)
        .await?
    {
        Some(c) => c,
        None => return Ok(None),
    };

    if cred.needs_reauth {
        return Err(SyncError::AuthExpired(
            "credential awaiting user reconnection".into(),
        ));
    }

    let margin = chrono::Duration::seconds(state.config.refresh_margin_secs);
    match cred.expires_at {
        Some(expires_at) if expires_at - margin > Utc::now() => Ok(Some(cred.access_token)),
        _ => Ok(None),
    }
}

/// Revoke a credential: best-effort provider revoke, then unconditional
/// local deletion. Local state never stays pointed at a dead grant.
pub async fn revoke(state: &AppState, user_id: &str, provider_id: &str) -> Result<(), SyncError> {
    let cred = state
        .store
        .get_credential(&state.crypto, user_id, provider_id)
        .await?;

    if let (Some(cred), Some(provider)) = (cred, state.registry.get(provider_id)) {
        if let Err(e) = provider.revoke(&cred.access_token).await {
            warn!(
                user_id,
                provider = provider_id,
                "provider revoke failed, deleting local credential anyway: {e}"
            );
        }
    }

    state.store.delete_credential(user_id, provider_id).await?;
    info!(user_id, provider = provider_id, "credential deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Shared fake credential: `stored` is the persisted token, `exchanges`
    /// counts refresh-token exchanges against the provider.
    struct FakeCredential {
        stored: Mutex<Option<String>>,
        exchanges: AtomicU32,
    }

    async fn get_token(cred: Arc<FakeCredential>, gate: Arc<KeyedGate>) -> String {
        refresh_deduped(
            &gate,
            "usr_1:google",
            || {
                let cred = cred.clone();
                async move { Ok(cred.stored.lock().await.clone()) }
            },
            || {
                let cred = cred.clone();
                async move {
                    // Widen the in-flight window so concurrent callers queue.
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    cred.exchanges.fetch_add(1, Ordering::SeqCst);
                    let token = "refreshed-token".to_string();
                    *cred.stored.lock().await = Some(token.clone());
                    Ok(token)
                }
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_exchange() {
        let cred = Arc::new(FakeCredential {
            stored: Mutex::new(None),
            exchanges: AtomicU32::new(0),
        });
        let gate = Arc::new(KeyedGate::new());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let cred = cred.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(get_token(cred, gate)));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), "refreshed-token");
        }

        // The waiters re-check under the gate, find the persisted token,
        // and never issue their own exchange.
        assert_eq!(cred.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_token_skips_the_exchange() {
        let cred = Arc::new(FakeCredential {
            stored: Mutex::new(Some("cached-token".into())),
            exchanges: AtomicU32::new(0),
        });
        let gate = Arc::new(KeyedGate::new());

        let token = get_token(cred.clone(), gate).await;
        assert_eq!(token, "cached-token");
        assert_eq!(cred.exchanges.load(Ordering::SeqCst), 0);
    }
}
