use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::traits::{
    ChangePage, ChangeRequest, RemoteChange, RemoteItem, ResourceType, SyncProvider, SyncWindow,
    TokenSet, WatchChannel,
};
use crate::error::SyncError;

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Microsoft provider (Graph subscriptions + delta queries).
///
/// Quirks:
/// - Subscriptions are short-lived (around 3 days for both resources) and
///   must be renewed by creating a replacement.
/// - Delta cursors are full deltaLink URLs; continuation pages are full
///   nextLink URLs. Both are opaque to us.
/// - A discarded delta state surfaces as 410 GONE, mapped to `CursorInvalid`.
/// - Event times come back as naive local strings; we pin them to UTC via
///   the `Prefer: outlook.timezone` header.
pub struct MicrosoftProvider {
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct MicrosoftTokenResponse {
    access_token: String,
    token_type: String,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionResponse {
    id: String,
    resource: String,
    expiration_date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct DeltaResponse {
    #[serde(default)]
    value: Vec<GraphItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphItem {
    id: String,
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
    subject: Option<String>,
    body_preview: Option<String>,
    is_all_day: Option<bool>,
    location: Option<GraphLocation>,
    start: Option<GraphDateTime>,
    end: Option<GraphDateTime>,
    received_date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphLocation {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphDateTime {
    date_time: Option<String>,
}

impl MicrosoftProvider {
    pub fn new(client_id: String, client_secret: String, timeout_secs: u64) -> Self {
        Self {
            client_id,
            client_secret,
            http: reqwest::Client::new(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SyncError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = resp.text().await.unwrap_or_default();
        Err(SyncError::classify_http(status.as_u16(), retry_after, &body))
    }

    fn resource_path(resource: ResourceType) -> &'static str {
        match resource {
            ResourceType::Calendar => "me/events",
            ResourceType::Mailbox => "me/mailFolders('inbox')/messages",
        }
    }

    /// Initial delta URL for a full bounded-window fetch.
    fn initial_delta_url(resource: ResourceType, window: &SyncWindow) -> String {
        match resource {
            ResourceType::Calendar => format!(
                "{GRAPH_BASE}/me/calendarView/delta?startDateTime={}&endDateTime={}",
                window.start.to_rfc3339(),
                window.end.to_rfc3339()
            ),
            ResourceType::Mailbox => {
                format!("{GRAPH_BASE}/me/mailFolders/inbox/messages/delta")
            }
        }
    }
}

#[async_trait]
impl SyncProvider for MicrosoftProvider {
    fn id(&self) -> &str {
        "microsoft"
    }

    fn display_name(&self) -> &str {
        "Microsoft"
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, SyncError> {
        let resp = self
            .http
            .post("https://login.microsoftonline.com/common/oauth2/v2.0/token")
            .form(&[
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .timeout(self.timeout)
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        let token_resp: MicrosoftTokenResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::MalformedInput(format!("token refresh response: {e}")))?;

        Ok(TokenSet {
            access_token: token_resp.access_token,
            refresh_token: token_resp.refresh_token,
            token_type: token_resp.token_type,
            expires_in: token_resp.expires_in,
            scope: token_resp.scope,
        })
    }

    // Microsoft has no token revocation endpoint; the default no-op revoke
    // applies and local deletion is the whole operation.

    async fn create_watch(
        &self,
        access_token: &str,
        resource: ResourceType,
        _channel_id: &str,
        channel_token: &str,
        notify_url: &str,
    ) -> Result<WatchChannel, SyncError> {
        let expiration = Utc::now()
            + chrono::Duration::from_std(self.max_watch_ttl(resource))
                .map_err(|e| SyncError::Internal(format!("watch ttl out of range: {e}")))?;

        let resp = self
            .http
            .post(format!("{GRAPH_BASE}/subscriptions"))
            .bearer_auth(access_token)
            .json(&json!({
                "changeType": "created,updated,deleted",
                "notificationUrl": notify_url,
                "resource": Self::resource_path(resource),
                "expirationDateTime": expiration.to_rfc3339(),
                "clientState": channel_token,
            }))
            .timeout(self.timeout)
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        let sub: SubscriptionResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::MalformedInput(format!("subscription response: {e}")))?;

        Ok(WatchChannel {
            // Graph assigns the channel id; notifications echo it back as
            // subscriptionId.
            channel_id: sub.id,
            resource_id: sub.resource,
            expires_at: sub.expiration_date_time,
        })
    }

    async fn stop_watch(
        &self,
        access_token: &str,
        channel_id: &str,
        _resource_id: &str,
    ) -> Result<(), SyncError> {
        let resp = self
            .http
            .delete(format!("{GRAPH_BASE}/subscriptions/{channel_id}"))
            .bearer_auth(access_token)
            .timeout(self.timeout)
            .send()
            .await?;
        // Deleting an already-gone subscription is success for our purposes.
        if resp.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check(resp).await?;
        Ok(())
    }

    async fn list_changes(
        &self,
        access_token: &str,
        resource: ResourceType,
        request: &ChangeRequest,
        window: &SyncWindow,
    ) -> Result<ChangePage, SyncError> {
        // Continuation nextLink > stored deltaLink > fresh windowed delta.
        let url = request
            .page_token
            .clone()
            .or_else(|| request.cursor.clone())
            .unwrap_or_else(|| Self::initial_delta_url(resource, window));

        let resp = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header("Prefer", "outlook.timezone=\"UTC\"")
            .timeout(self.timeout)
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        let delta: DeltaResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::MalformedInput(format!("delta response: {e}")))?;

        let changes = delta
            .value
            .into_iter()
            .map(|raw| {
                let removed = raw.removed.is_some();
                let item = if removed {
                    None
                } else {
                    Some(map_graph_item(&raw, resource))
                };
                RemoteChange {
                    external_id: raw.id,
                    removed,
                    item,
                }
            })
            .collect();

        Ok(ChangePage {
            changes,
            next_page: delta.next_link,
            next_cursor: delta.delta_link,
        })
    }

    fn max_watch_ttl(&self, resource: ResourceType) -> Duration {
        match resource {
            // Graph caps calendar and mail subscriptions at 4230 minutes.
            ResourceType::Calendar => Duration::from_secs(4230 * 60),
            ResourceType::Mailbox => Duration::from_secs(4230 * 60),
        }
    }
}

fn map_graph_item(raw: &GraphItem, resource: ResourceType) -> RemoteItem {
    match resource {
        ResourceType::Calendar => RemoteItem {
            title: raw.subject.clone().unwrap_or_default(),
            description: raw.body_preview.clone(),
            start: raw.start.as_ref().and_then(parse_graph_time),
            end: raw.end.as_ref().and_then(parse_graph_time),
            all_day: raw.is_all_day.unwrap_or(false),
            location: raw
                .location
                .as_ref()
                .and_then(|l| l.display_name.clone())
                .filter(|s| !s.is_empty()),
        },
        ResourceType::Mailbox => RemoteItem {
            title: raw.subject.clone().unwrap_or_default(),
            description: raw.body_preview.clone(),
            start: raw.received_date_time,
            end: raw.received_date_time,
            all_day: false,
            location: None,
        },
    }
}

/// Graph event times are naive strings ("2025-06-02T10:00:00.0000000")
/// already pinned to UTC by the Prefer header.
fn parse_graph_time(t: &GraphDateTime) -> Option<DateTime<Utc>> {
    let raw = t.date_time.as_deref()?;
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_graph_time() {
        let t = GraphDateTime {
            date_time: Some("2025-06-02T10:30:00.0000000".into()),
        };
        let dt = parse_graph_time(&t).unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-06-02T10:30:00+00:00");

        let bad = GraphDateTime {
            date_time: Some("yesterday".into()),
        };
        assert!(parse_graph_time(&bad).is_none());
    }

    #[test]
    fn test_initial_delta_url_shapes() {
        let window = SyncWindow::next_days(30);
        let cal = MicrosoftProvider::initial_delta_url(ResourceType::Calendar, &window);
        assert!(cal.contains("/me/calendarView/delta?startDateTime="));
        let mail = MicrosoftProvider::initial_delta_url(ResourceType::Mailbox, &window);
        assert!(mail.ends_with("/me/mailFolders/inbox/messages/delta"));
    }

    #[test]
    fn test_removed_marker_detection() {
        let raw: GraphItem = serde_json::from_value(serde_json::json!({
            "id": "AAMk123",
            "@removed": { "reason": "deleted" }
        }))
        .unwrap();
        assert!(raw.removed.is_some());
    }
}
