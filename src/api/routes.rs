//! API route handlers for the calsync service.
//!
//! All handlers receive `SharedState` via Axum state extraction. Everything
//! except the webhook ingress and the health check is an internal surface,
//! gated by the shared service secret.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::broker;
use crate::error::SyncError;
use crate::providers::ResourceType;
use crate::store::db::CredentialUpsert;
use crate::watch;
use crate::webhooks;
use crate::{sync, SharedState};

// =============================================================================
// V1 Router
// =============================================================================

pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        // ── Health ───────────────────────────────────────────────────────
        .route("/status", get(status))
        // ── Credentials ──────────────────────────────────────────────────
        .route("/credentials/{provider}", put(credential_upsert))
        .route("/credentials/{provider}", delete(credential_revoke))
        // ── Watch channels ───────────────────────────────────────────────
        .route("/watch/{provider}/{resource}", post(watch_create))
        .route("/watch/{provider}/{resource}", delete(watch_stop))
        // ── Sync ─────────────────────────────────────────────────────────
        .route("/sync/{provider}/{resource}", post(sync_now))
        // ── Mirror records ───────────────────────────────────────────────
        .route("/events", get(events_list))
        .route("/events/{id}/task-link", patch(event_task_link))
        // ── Webhooks (provider-authenticated, not secret-gated) ──────────
        .route("/webhooks/google", post(webhooks::google_webhook))
        .route("/webhooks/microsoft", post(webhooks::microsoft_webhook))
        .with_state(state)
}

/// Service-to-service auth for the internal management surface.
fn require_internal(headers: &HeaderMap, state: &SharedState) -> Result<(), SyncError> {
    let provided = headers
        .get("x-internal-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided != state.config.internal_secret {
        return Err(SyncError::Unauthorized);
    }
    Ok(())
}

fn parse_resource(raw: &str) -> Result<ResourceType, SyncError> {
    ResourceType::parse(raw)
        .ok_or_else(|| SyncError::BadRequest(format!("unknown resource type: {raw}")))
}

// =============================================================================
// Health
// =============================================================================

async fn status() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "calsync",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// =============================================================================
// Credentials
// =============================================================================

#[derive(Deserialize)]
struct CredentialBody {
    user_id: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    scopes: String,
}

/// PUT /v1/credentials/{provider} — Register or replace a user's grant.
///
/// The OAuth consent flow lives in the identity service; this endpoint
/// receives the resulting token set and stores it encrypted.
async fn credential_upsert(
    State(state): State<SharedState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CredentialBody>,
) -> Result<Json<serde_json::Value>, SyncError> {
    require_internal(&headers, &state)?;
    if state.registry.get(&provider).is_none() {
        return Err(SyncError::ProviderNotFound(provider));
    }

    state
        .store
        .upsert_credential(
            &state.crypto,
            &CredentialUpsert {
                user_id: body.user_id,
                provider,
                access_token: body.access_token,
                refresh_token: body.refresh_token,
                expires_at: body.expires_at,
                scopes: body.scopes,
            },
        )
        .await?;

    Ok(Json(json!({ "data": { "stored": true } })))
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: String,
}

/// DELETE /v1/credentials/{provider} — Revoke upstream and forget locally.
async fn credential_revoke(
    State(state): State<SharedState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, SyncError> {
    require_internal(&headers, &state)?;
    broker::revoke(&state, &q.user_id, &provider).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Watch channels
// =============================================================================

#[derive(Deserialize)]
struct WatchBody {
    user_id: String,
}

/// POST /v1/watch/{provider}/{resource} — Create or renew the watch channel.
///
/// Idempotent: an existing healthy channel is replaced by a fresh one and
/// the old one is stopped after the new one is confirmed.
async fn watch_create(
    State(state): State<SharedState>,
    Path((provider, resource)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<WatchBody>,
) -> Result<Json<serde_json::Value>, SyncError> {
    require_internal(&headers, &state)?;
    let resource = parse_resource(&resource)?;
    let sub = watch::create_or_renew(&state, &body.user_id, &provider, resource).await?;
    Ok(Json(json!({ "data": sub })))
}

/// DELETE /v1/watch/{provider}/{resource} — Stop watching and drop the mirror.
async fn watch_stop(
    State(state): State<SharedState>,
    Path((provider, resource)): Path<(String, String)>,
    headers: HeaderMap,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, SyncError> {
    require_internal(&headers, &state)?;
    let resource = parse_resource(&resource)?;
    watch::stop(&state, &q.user_id, &provider, resource).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Sync
// =============================================================================

/// POST /v1/sync/{provider}/{resource} — Run an incremental sync now.
///
/// Same engine the webhook path uses; runs inline and reports the outcome.
async fn sync_now(
    State(state): State<SharedState>,
    Path((provider, resource)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<WatchBody>,
) -> Result<Json<serde_json::Value>, SyncError> {
    require_internal(&headers, &state)?;
    let resource = parse_resource(&resource)?;
    let outcome = sync::sync(&state, &body.user_id, &provider, resource).await?;
    Ok(Json(json!({ "data": outcome })))
}

// =============================================================================
// Mirror records
// =============================================================================

#[derive(Deserialize)]
struct EventsQuery {
    user_id: String,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

/// GET /v1/events — List mirror records with starts_at in [from, to).
async fn events_list(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, SyncError> {
    require_internal(&headers, &state)?;
    if q.to <= q.from {
        return Err(SyncError::BadRequest("'to' must be after 'from'".into()));
    }
    let records = state.store.records_in_range(&q.user_id, q.from, q.to).await?;
    Ok(Json(json!({ "data": records })))
}

#[derive(Deserialize)]
struct TaskLinkBody {
    task_id: Option<String>,
}

/// PATCH /v1/events/{id}/task-link — Set or clear the local task link.
///
/// The one mirror-record field downstream consumers own; it survives
/// subsequent provider-driven upserts.
async fn event_task_link(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<TaskLinkBody>,
) -> Result<StatusCode, SyncError> {
    require_internal(&headers, &state)?;
    state
        .store
        .set_task_link(id, body.task_id.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
