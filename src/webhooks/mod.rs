//! Webhook ingress — authenticates inbound push notifications and routes
//! them to the owning user's sync run.
//!
//! Delivery is at-least-once and unordered, so everything here is built for
//! duplicates: a message-id ledger for envelopes that carry one, and
//! idempotent sync application for the rest. Once the channel token has
//! verified, the response is always a 2xx — surfacing internal errors to the
//! provider only invites a redelivery storm we don't control.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::error::SyncError;
use crate::providers::ResourceType;
use crate::{sync, SharedState};

/// Owner triple recovered from a verified channel token.
#[derive(Debug, PartialEq)]
pub struct ChannelClaims {
    pub user_id: String,
    pub provider: String,
    pub resource: ResourceType,
}

/// Parse the signed payload `user_id:provider:resource`.
///
/// Split from the right so user ids containing ':' survive.
pub fn parse_channel_claims(payload: &str) -> Option<ChannelClaims> {
    let mut parts = payload.rsplitn(3, ':');
    let resource = ResourceType::parse(parts.next()?)?;
    let provider = parts.next()?.to_string();
    let user_id = parts.next()?.to_string();
    if user_id.is_empty() || provider.is_empty() {
        return None;
    }
    Some(ChannelClaims {
        user_id,
        provider,
        resource,
    })
}

/// POST /v1/webhooks/google — header-encoded channel envelope.
///
/// `x-goog-channel-token` carries our HMAC-signed owner encoding, so user
/// resolution is a token verification, not an account scan.
pub async fn google_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Response, SyncError> {
    let token = headers
        .get("x-goog-channel-token")
        .and_then(|v| v.to_str().ok())
        .ok_or(SyncError::Unauthorized)?;

    let payload = state.crypto.verify_channel_token(token)?;
    let claims = parse_channel_claims(&payload).ok_or(SyncError::Unauthorized)?;

    let channel_id = headers
        .get("x-goog-channel-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let resource_state = headers
        .get("x-goog-resource-state")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let message_number = headers
        .get("x-goog-message-number")
        .and_then(|v| v.to_str().ok());

    // Notifications for a superseded channel are acknowledged and dropped.
    let current = match acked_or(
        state
            .store
            .get_subscription(&claims.user_id, &claims.provider, claims.resource)
            .await,
        "subscription lookup",
    ) {
        Some(sub) => sub,
        None => return Ok(acked()),
    };
    let channel_is_current = current
        .as_ref()
        .map(|s| s.channel_id == channel_id)
        .unwrap_or(false);
    if !channel_is_current {
        info!(
            user_id = %claims.user_id,
            channel_id,
            "notification for inactive channel, acknowledging without sync"
        );
        return Ok(acked());
    }

    // The initial "sync" ping confirms the channel; nothing changed yet.
    if resource_state == "sync" {
        return Ok(acked());
    }

    // Dedup ledger, keyed by (channel, message number) when present.
    if let Some(number) = message_number {
        let message_id = format!("{channel_id}:{number}");
        let newly_seen = match acked_or(
            state
                .store
                .record_notification(&claims.user_id, &claims.provider, &message_id)
                .await,
            "notification ledger write",
        ) {
            Some(inserted) => inserted,
            None => return Ok(acked()),
        };
        if !newly_seen {
            info!(
                user_id = %claims.user_id,
                message_id,
                "duplicate notification, acknowledging without reprocessing"
            );
            return Ok(acked());
        }
    }

    run_sync_acked(&state, &claims).await;
    Ok(acked())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrosoftValidationQuery {
    validation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphEnvelope {
    #[serde(default)]
    value: Vec<GraphNotification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphNotification {
    subscription_id: Option<String>,
    client_state: Option<String>,
}

/// POST /v1/webhooks/microsoft — JSON envelope, plus the subscription
/// validation handshake (echo the validationToken as plain text).
pub async fn microsoft_webhook(
    State(state): State<SharedState>,
    Query(q): Query<MicrosoftValidationQuery>,
    body: axum::body::Bytes,
) -> Result<Response, SyncError> {
    if let Some(token) = q.validation_token {
        return Ok((StatusCode::OK, token).into_response());
    }

    // Graph retries non-2xx deliveries and eventually disables the
    // subscription, so even an unparseable body is acknowledged.
    let envelope = match parse_graph_envelope(&body) {
        Some(env) => env,
        None => {
            warn!("unparseable notification body, acknowledging without processing");
            return Ok(StatusCode::ACCEPTED.into_response());
        }
    };

    for notification in &envelope.value {
        let Some(client_state) = &notification.client_state else {
            warn!("notification without clientState, dropping");
            continue;
        };

        let claims = match state
            .crypto
            .verify_channel_token(client_state)
            .ok()
            .and_then(|p| parse_channel_claims(&p))
        {
            Some(c) => c,
            None => {
                warn!("notification with unverifiable clientState, dropping");
                continue;
            }
        };

        // Cross-check against the stored subscription; stale ones are
        // acknowledged and ignored.
        let current = match acked_or(
            state
                .store
                .get_subscription(&claims.user_id, &claims.provider, claims.resource)
                .await,
            "subscription lookup",
        ) {
            Some(sub) => sub,
            None => continue,
        };
        let subscription_is_current = match (&current, &notification.subscription_id) {
            (Some(sub), Some(id)) => &sub.channel_id == id,
            _ => false,
        };
        if !subscription_is_current {
            info!(
                user_id = %claims.user_id,
                subscription_id = ?notification.subscription_id,
                "notification for inactive subscription, acknowledging without sync"
            );
            continue;
        }

        run_sync_acked(&state, &claims).await;
    }

    // Graph expects 202 for accepted change notifications.
    Ok(StatusCode::ACCEPTED.into_response())
}

fn parse_graph_envelope(body: &[u8]) -> Option<GraphEnvelope> {
    serde_json::from_slice(body).ok()
}

/// Unwrap a post-authentication store result. Failures are logged and the
/// caller acknowledges: a 5xx after auth has passed only triggers a
/// provider redelivery storm.
fn acked_or<T>(result: Result<T, SyncError>, context: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            error!("{context} failed during webhook processing (acknowledged anyway): {e}");
            None
        }
    }
}

/// Run the sync for a verified notification. Internal failures are logged,
/// never surfaced: provider retry semantics are not ours to steer.
async fn run_sync_acked(state: &SharedState, claims: &ChannelClaims) {
    match sync::sync(state, &claims.user_id, &claims.provider, claims.resource).await {
        Ok(outcome) => {
            info!(
                user_id = %claims.user_id,
                provider = %claims.provider,
                resource = %claims.resource,
                applied = outcome.applied,
                deleted = outcome.deleted,
                "webhook-triggered sync complete"
            );
        }
        Err(e) => {
            error!(
                user_id = %claims.user_id,
                provider = %claims.provider,
                resource = %claims.resource,
                "webhook-triggered sync failed (acknowledged anyway): {e}"
            );
        }
    }
}

fn acked() -> Response {
    Json(json!({ "received": true })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channel_claims() {
        let claims = parse_channel_claims("usr_42:google:calendar").unwrap();
        assert_eq!(claims.user_id, "usr_42");
        assert_eq!(claims.provider, "google");
        assert_eq!(claims.resource, ResourceType::Calendar);
    }

    #[test]
    fn test_parse_channel_claims_user_with_colons() {
        let claims = parse_channel_claims("org:usr_42:microsoft:mailbox").unwrap();
        assert_eq!(claims.user_id, "org:usr_42");
        assert_eq!(claims.provider, "microsoft");
        assert_eq!(claims.resource, ResourceType::Mailbox);
    }

    #[test]
    fn test_parse_channel_claims_rejects_malformed() {
        assert!(parse_channel_claims("").is_none());
        assert!(parse_channel_claims("usr_42:google").is_none());
        assert!(parse_channel_claims("usr_42:google:spreadsheet").is_none());
        assert!(parse_channel_claims(":google:calendar").is_none());
    }

    #[test]
    fn test_store_failures_after_auth_are_swallowed() {
        assert_eq!(acked_or(Ok(7), "lookup"), Some(7));
        let swallowed: Option<bool> =
            acked_or(Err(SyncError::Database("pool exhausted".into())), "lookup");
        assert_eq!(swallowed, None);
    }

    #[test]
    fn test_graph_envelope_parsing_is_lenient() {
        let valid = br#"{"value":[{"subscriptionId":"sub-1","clientState":"tok"}]}"#;
        let env = parse_graph_envelope(valid).unwrap();
        assert_eq!(env.value.len(), 1);
        assert_eq!(env.value[0].subscription_id.as_deref(), Some("sub-1"));

        // Unknown fields and an absent value array are fine.
        assert!(parse_graph_envelope(b"{}").is_some());
        // Garbage is a None, handled by the caller as ack-without-processing.
        assert!(parse_graph_envelope(b"not json").is_none());
        assert!(parse_graph_envelope(b"").is_none());
    }
}
