use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::SyncError;

/// The two resource streams a user can mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Calendar,
    Mailbox,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Calendar => "calendar",
            ResourceType::Mailbox => "mailbox",
        }
    }

    pub fn parse(s: &str) -> Option<ResourceType> {
        match s {
            "calendar" => Some(ResourceType::Calendar),
            "mailbox" => Some(ResourceType::Mailbox),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tokens returned from a provider refresh exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
}

/// A push channel opened with the provider.
#[derive(Debug, Clone)]
pub struct WatchChannel {
    /// Provider-side channel/subscription identifier.
    pub channel_id: String,
    /// Provider-side identifier of the watched resource.
    pub resource_id: String,
    /// When the provider will stop delivering notifications.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Bounded time window for full (non-delta) fetches.
#[derive(Debug, Clone, Copy)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SyncWindow {
    /// Window from now to `days` days out.
    pub fn next_days(days: i64) -> Self {
        let now = Utc::now();
        SyncWindow {
            start: now,
            end: now + chrono::Duration::days(days),
        }
    }
}

/// Provider-owned fields of a single remote item.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteItem {
    pub title: String,
    pub description: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub all_day: bool,
    pub location: Option<String>,
}

/// One changed or deleted item in a delta stream.
#[derive(Debug, Clone)]
pub struct RemoteChange {
    pub external_id: String,
    /// True when the provider reports the item cancelled/removed.
    pub removed: bool,
    /// Absent for removals.
    pub item: Option<RemoteItem>,
}

/// One request against the provider's change feed.
#[derive(Debug, Clone, Default)]
pub struct ChangeRequest {
    /// Stored sync cursor. None requests a full bounded-window fetch.
    pub cursor: Option<String>,
    /// Continuation token from a previous page of this same sync run.
    pub page_token: Option<String>,
}

/// One page of changes plus continuation state.
///
/// Exactly one of `next_page` / `next_cursor` is expected: a page mid-stream
/// carries `next_page`, the final page carries the new cursor.
#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub changes: Vec<RemoteChange>,
    pub next_page: Option<String>,
    pub next_cursor: Option<String>,
}

/// Trait every sync provider must implement.
///
/// Covers the four provider boundaries: token exchange, watch channel
/// lifecycle, and the change feed. Each implementation translates its
/// provider's "cursor no longer valid" signal into `SyncError::CursorInvalid`
/// so the engine's full-resync fallback behaves identically everywhere.
#[async_trait]
pub trait SyncProvider: Send + Sync {
    /// Unique provider identifier (e.g., "google", "microsoft").
    fn id(&self) -> &str;

    /// Human-readable display name.
    fn display_name(&self) -> &str;

    /// Refresh an expired access token using a refresh token.
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, SyncError>;

    /// Revoke a token. Not all providers support this.
    async fn revoke(&self, _token: &str) -> Result<(), SyncError> {
        Ok(())
    }

    /// Open a push channel for `resource`, delivering to `notify_url`.
    ///
    /// `channel_id` is our locally generated channel identifier and
    /// `channel_token` the HMAC-signed owner encoding that comes back on
    /// every notification.
    async fn create_watch(
        &self,
        access_token: &str,
        resource: ResourceType,
        channel_id: &str,
        channel_token: &str,
        notify_url: &str,
    ) -> Result<WatchChannel, SyncError>;

    /// Stop a push channel. Callers treat failures as best-effort.
    async fn stop_watch(
        &self,
        access_token: &str,
        channel_id: &str,
        resource_id: &str,
    ) -> Result<(), SyncError>;

    /// Fetch one page of changes.
    ///
    /// With a cursor: delta since that cursor. Without: a full fetch bounded
    /// by `window`, whose final page establishes a brand-new cursor.
    async fn list_changes(
        &self,
        access_token: &str,
        resource: ResourceType,
        request: &ChangeRequest,
        window: &SyncWindow,
    ) -> Result<ChangePage, SyncError>;

    /// Provider-dictated maximum channel lifetime for `resource`.
    fn max_watch_ttl(&self, resource: ResourceType) -> Duration;
}
