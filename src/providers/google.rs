use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use super::traits::{
    ChangePage, ChangeRequest, RemoteChange, RemoteItem, ResourceType, SyncProvider, SyncWindow,
    TokenSet, WatchChannel,
};
use crate::error::SyncError;

/// Google provider: Calendar push channels + syncToken deltas, Gmail
/// watch + history deltas.
///
/// Quirks:
/// - Calendar channels live at most 7 days; Gmail watches are renewed on the
///   same schedule even though their nominal lifetime is longer.
/// - An expired syncToken comes back as 410 GONE; a stale Gmail historyId
///   comes back as 404. Both map to `CursorInvalid`.
/// - Refresh responses don't always include a new refresh token.
pub struct GoogleProvider {
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    token_type: String,
    expires_in: Option<u64>,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarWatchResponse {
    resource_id: String,
    /// Epoch millis as a decimal string.
    expiration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailWatchResponse {
    expiration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarEventsResponse {
    #[serde(default)]
    items: Vec<CalendarEvent>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarEvent {
    id: String,
    status: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    start: Option<CalendarEventTime>,
    end: Option<CalendarEventTime>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarEventTime {
    date_time: Option<DateTime<Utc>>,
    /// All-day events carry a plain date instead.
    date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistoryResponse {
    #[serde(default)]
    history: Vec<GmailHistoryEntry>,
    next_page_token: Option<String>,
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistoryEntry {
    #[serde(default)]
    messages_added: Vec<GmailMessageWrapper>,
    #[serde(default)]
    messages_deleted: Vec<GmailMessageWrapper>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageWrapper {
    message: GmailMessageRef,
}

#[derive(Debug, Deserialize)]
struct GmailMessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessageList {
    #[serde(default)]
    messages: Vec<GmailMessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    snippet: Option<String>,
    /// Epoch millis as a decimal string.
    internal_date: Option<String>,
    payload: Option<GmailPayload>,
}

#[derive(Debug, Deserialize)]
struct GmailPayload {
    #[serde(default)]
    headers: Vec<GmailHeader>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailProfile {
    history_id: String,
}

impl GoogleProvider {
    pub fn new(client_id: String, client_secret: String, timeout_secs: u64) -> Self {
        Self {
            client_id,
            client_secret,
            http: reqwest::Client::new(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Classify a non-success response via the shared taxonomy.
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

    async fn calendar_changes(
        &self,
        access_token: &str,
        request: &ChangeRequest,
        window: &SyncWindow,
    ) -> Result<ChangePage, SyncError> {
        let mut query: Vec<(&str, String)> = vec![("singleEvents", "true".into())];
        if let Some(token) = &request.page_token {
            query.push(("pageToken", token.clone()));
        }
        match &request.cursor {
            Some(cursor) => query.push(("syncToken", cursor.clone())),
            None => {
                query.push(("timeMin", window.start.to_rfc3339()));
                query.push(("timeMax", window.end.to_rfc3339()));
            }
        }

        let resp = self
            .http
            .get("https://www.googleapis.com/calendar/v3/calendars/primary/events")
            .bearer_auth(access_token)
            .query(&query)
            .timeout(self.timeout)
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        let events: CalendarEventsResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::MalformedInput(format!("calendar events response: {e}")))?;

        let changes = events
            .items
            .into_iter()
            .map(|ev| {
                let removed = ev.status.as_deref() == Some("cancelled");
                let item = if removed { None } else { Some(map_event(&ev)) };
                RemoteChange {
                    external_id: ev.id,
                    removed,
                    item,
                }
            })
            .collect();

        Ok(ChangePage {
            changes,
            next_page: events.next_page_token,
            next_cursor: events.next_sync_token,
        })
    }

    async fn mailbox_changes(
        &self,
        access_token: &str,
        request: &ChangeRequest,
        window: &SyncWindow,
    ) -> Result<ChangePage, SyncError> {
        match &request.cursor {
            Some(cursor) => self.mailbox_delta(access_token, cursor, request).await,
            None => self.mailbox_window(access_token, request, window).await,
        }
    }

    /// Delta since a stored historyId. Gmail reports a stale historyId as
    /// 404, which we translate to CursorInvalid.
    async fn mailbox_delta(
        &self,
        access_token: &str,
        cursor: &str,
        request: &ChangeRequest,
    ) -> Result<ChangePage, SyncError> {
        let mut query: Vec<(&str, String)> = vec![("startHistoryId", cursor.to_string())];
        if let Some(token) = &request.page_token {
            query.push(("pageToken", token.clone()));
        }

        let resp = self
            .http
            .get("https://gmail.googleapis.com/gmail/v1/users/me/history")
            .bearer_auth(access_token)
            .query(&query)
            .timeout(self.timeout)
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            return Err(SyncError::CursorInvalid);
        }
        let resp = Self::check(resp).await?;

        let history: GmailHistoryResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::MalformedInput(format!("gmail history response: {e}")))?;

        let mut changes = Vec::new();
        for entry in &history.history {
            for added in &entry.messages_added {
                let fetched = self.fetch_message(access_token, &added.message.id).await;
                if let Some(change) = change_for_message(&added.message.id, fetched)? {
                    changes.push(change);
                }
            }
            for deleted in &entry.messages_deleted {
                changes.push(RemoteChange {
                    external_id: deleted.message.id.clone(),
                    removed: true,
                    item: None,
                });
            }
        }

        // historyId on the final page is the new cursor.
        let next_cursor = if history.next_page_token.is_none() {
            history.history_id
        } else {
            None
        };

        Ok(ChangePage {
            changes,
            next_page: history.next_page_token,
            next_cursor,
        })
    }

    /// Bounded full fetch: list message ids in the window, then pull
    /// metadata per message. The fresh cursor is the profile's historyId,
    /// captured on the final page.
    async fn mailbox_window(
        &self,
        access_token: &str,
        request: &ChangeRequest,
        window: &SyncWindow,
    ) -> Result<ChangePage, SyncError> {
        let q = format!(
            "after:{} before:{}",
            window.start.timestamp(),
            window.end.timestamp()
        );
        let mut query: Vec<(&str, String)> = vec![("q", q), ("maxResults", "100".into())];
        if let Some(token) = &request.page_token {
            query.push(("pageToken", token.clone()));
        }

        let resp = self
            .http
            .get("https://gmail.googleapis.com/gmail/v1/users/me/messages")
            .bearer_auth(access_token)
            .query(&query)
            .timeout(self.timeout)
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        let list: GmailMessageList = resp
            .json()
            .await
            .map_err(|e| SyncError::MalformedInput(format!("gmail list response: {e}")))?;

        let mut changes = Vec::new();
        for msg in &list.messages {
            let fetched = self.fetch_message(access_token, &msg.id).await;
            if let Some(change) = change_for_message(&msg.id, fetched)? {
                changes.push(change);
            }
        }

        let next_cursor = if list.next_page_token.is_none() {
            Some(self.current_history_id(access_token).await?)
        } else {
            None
        };

        Ok(ChangePage {
            changes,
            next_page: list.next_page_token,
            next_cursor,
        })
    }

    /// Fetch one message's metadata. `Ok(None)` means the message no longer
    /// exists (deleted between the listing call and this fetch).
    async fn fetch_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<Option<RemoteItem>, SyncError> {
        let resp = self
            .http
            .get(format!(
                "https://gmail.googleapis.com/gmail/v1/users/me/messages/{message_id}"
            ))
            .bearer_auth(access_token)
            .query(&[
                ("format", "metadata"),
                ("metadataHeaders", "Subject"),
                ("metadataHeaders", "From"),
            ])
            .timeout(self.timeout)
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let resp = Self::check(resp).await?;

        let msg: GmailMessage = resp
            .json()
            .await
            .map_err(|e| SyncError::MalformedInput(format!("gmail message response: {e}")))?;

        Ok(Some(map_message(&msg)))
    }

    async fn current_history_id(&self, access_token: &str) -> Result<String, SyncError> {
        let resp = self
            .http
            .get("https://gmail.googleapis.com/gmail/v1/users/me/profile")
            .bearer_auth(access_token)
            .timeout(self.timeout)
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        let profile: GmailProfile = resp
            .json()
            .await
            .map_err(|e| SyncError::MalformedInput(format!("gmail profile response: {e}")))?;
        Ok(profile.history_id)
    }
}

#[async_trait]
impl SyncProvider for GoogleProvider {
    fn id(&self) -> &str {
        "google"
    }

    fn display_name(&self) -> &str {
        "Google"
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, SyncError> {
        let resp = self
            .http
            .post("https://oauth2.googleapis.com/token")
            .form(&[
                ("refresh_token", refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("grant_type", "refresh_token"),
            ])
            .timeout(self.timeout)
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        let token_resp: GoogleTokenResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::MalformedInput(format!("token refresh response: {e}")))?;

        Ok(TokenSet {
            access_token: token_resp.access_token,
            // Google doesn't always return a new refresh token on refresh
            refresh_token: token_resp.refresh_token,
            token_type: token_resp.token_type,
            expires_in: token_resp.expires_in,
            scope: token_resp.scope,
        })
    }

    async fn revoke(&self, token: &str) -> Result<(), SyncError> {
        let resp = self
            .http
            .post("https://oauth2.googleapis.com/revoke")
            .form(&[("token", token)])
            .timeout(self.timeout)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn create_watch(
        &self,
        access_token: &str,
        resource: ResourceType,
        channel_id: &str,
        channel_token: &str,
        notify_url: &str,
    ) -> Result<WatchChannel, SyncError> {
        match resource {
            ResourceType::Calendar => {
                let resp = self
                    .http
                    .post("https://www.googleapis.com/calendar/v3/calendars/primary/events/watch")
                    .bearer_auth(access_token)
                    .json(&calendar_watch_body(channel_id, channel_token, notify_url))
                    .timeout(self.timeout)
                    .send()
                    .await?;
                let resp = Self::check(resp).await?;

                let watch: CalendarWatchResponse = resp.json().await.map_err(|e| {
                    SyncError::MalformedInput(format!("calendar watch response: {e}"))
                })?;

                Ok(WatchChannel {
                    channel_id: channel_id.to_string(),
                    resource_id: watch.resource_id,
                    expires_at: parse_epoch_millis(watch.expiration.as_deref()),
                })
            }
            ResourceType::Mailbox => {
                let resp = self
                    .http
                    .post("https://gmail.googleapis.com/gmail/v1/users/me/watch")
                    .bearer_auth(access_token)
                    .json(&mailbox_watch_body(channel_token, notify_url))
                    .timeout(self.timeout)
                    .send()
                    .await?;
                let resp = Self::check(resp).await?;

                let watch: GmailWatchResponse = resp
                    .json()
                    .await
                    .map_err(|e| SyncError::MalformedInput(format!("gmail watch response: {e}")))?;

                Ok(WatchChannel {
                    channel_id: channel_id.to_string(),
                    resource_id: "me".into(),
                    expires_at: parse_epoch_millis(watch.expiration.as_deref()),
                })
            }
        }
    }

    async fn stop_watch(
        &self,
        access_token: &str,
        channel_id: &str,
        resource_id: &str,
    ) -> Result<(), SyncError> {
        // Gmail watches are stopped per-user, calendar channels per-channel.
        let resp = if resource_id == "me" {
            self.http
                .post("https://gmail.googleapis.com/gmail/v1/users/me/stop")
                .bearer_auth(access_token)
                .timeout(self.timeout)
                .send()
                .await?
        } else {
            self.http
                .post("https://www.googleapis.com/calendar/v3/channels/stop")
                .bearer_auth(access_token)
                .json(&json!({ "id": channel_id, "resourceId": resource_id }))
                .timeout(self.timeout)
                .send()
                .await?
        };
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
        match resource {
            ResourceType::Calendar => self.calendar_changes(access_token, request, window).await,
            ResourceType::Mailbox => self.mailbox_changes(access_token, request, window).await,
        }
    }

    fn max_watch_ttl(&self, resource: ResourceType) -> Duration {
        match resource {
            // Calendar channels cap out at 7 days.
            ResourceType::Calendar => Duration::from_secs(7 * 24 * 3600),
            // Gmail watches expire after 7 days as well.
            ResourceType::Mailbox => Duration::from_secs(7 * 24 * 3600),
        }
    }
}

fn calendar_watch_body(
    channel_id: &str,
    channel_token: &str,
    notify_url: &str,
) -> serde_json::Value {
    json!({
        "id": channel_id,
        "type": "web_hook",
        "address": notify_url,
        "token": channel_token,
    })
}

/// Mailbox watches carry the same delivery address and signed token as
/// calendar channels, so notifications for both resources authenticate and
/// resolve their owner the same way at ingress.
fn mailbox_watch_body(channel_token: &str, notify_url: &str) -> serde_json::Value {
    json!({
        "labelIds": ["INBOX"],
        "address": notify_url,
        "token": channel_token,
    })
}

/// Fold a per-message fetch result into the change stream.
///
/// A message gone by fetch time (404) becomes a removal. An unreadable
/// message is logged and skipped; one bad item must not fail the whole run
/// or the cursor would never advance past it. Everything else propagates.
fn change_for_message(
    message_id: &str,
    fetched: Result<Option<RemoteItem>, SyncError>,
) -> Result<Option<RemoteChange>, SyncError> {
    match fetched {
        Ok(Some(item)) => Ok(Some(RemoteChange {
            external_id: message_id.to_string(),
            removed: false,
            item: Some(item),
        })),
        Ok(None) => Ok(Some(RemoteChange {
            external_id: message_id.to_string(),
            removed: true,
            item: None,
        })),
        Err(e @ SyncError::MalformedInput(_)) => {
            warn!(message_id, "skipping unreadable message: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn map_event(ev: &CalendarEvent) -> RemoteItem {
    let all_day = ev
        .start
        .as_ref()
        .map(|s| s.date.is_some())
        .unwrap_or(false);

    RemoteItem {
        title: ev.summary.clone().unwrap_or_default(),
        description: ev.description.clone(),
        start: ev.start.as_ref().and_then(resolve_event_time),
        end: ev.end.as_ref().and_then(resolve_event_time),
        all_day,
        location: ev.location.clone(),
    }
}

fn resolve_event_time(t: &CalendarEventTime) -> Option<DateTime<Utc>> {
    t.date_time.or_else(|| {
        t.date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

fn map_message(msg: &GmailMessage) -> RemoteItem {
    let header = |name: &str| -> Option<String> {
        msg.payload.as_ref().and_then(|p| {
            p.headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.clone())
        })
    };

    let received = parse_epoch_millis(msg.internal_date.as_deref());

    RemoteItem {
        title: header("Subject").unwrap_or_else(|| format!("Message {}", msg.id)),
        description: msg.snippet.clone(),
        start: received,
        end: received,
        all_day: false,
        location: None,
    }
}

fn parse_epoch_millis(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|v| v.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_all_day_event() {
        let ev = CalendarEvent {
            id: "ev1".into(),
            status: Some("confirmed".into()),
            summary: Some("Offsite".into()),
            description: None,
            location: Some("Lisbon".into()),
            start: Some(CalendarEventTime {
                date_time: None,
                date: NaiveDate::from_ymd_opt(2025, 6, 2),
            }),
            end: Some(CalendarEventTime {
                date_time: None,
                date: NaiveDate::from_ymd_opt(2025, 6, 3),
            }),
        };
        let item = map_event(&ev);
        assert!(item.all_day);
        assert_eq!(item.title, "Offsite");
        assert!(item.start.is_some());
        assert!(item.end.is_some());
    }

    #[test]
    fn test_map_event_without_times_yields_none() {
        let ev = CalendarEvent {
            id: "ev2".into(),
            status: None,
            summary: None,
            description: None,
            location: None,
            start: None,
            end: None,
        };
        let item = map_event(&ev);
        assert!(item.start.is_none());
        assert!(item.end.is_none());
        assert!(!item.all_day);
    }

    #[test]
    fn test_watch_bodies_carry_delivery_address_and_token() {
        // Both resource types must deliver through the same authenticated
        // webhook, so both watch requests register the address and token.
        let cal = calendar_watch_body("chan-1", "signed-token", "https://cs.example/v1/webhooks/google");
        assert_eq!(cal["address"], "https://cs.example/v1/webhooks/google");
        assert_eq!(cal["token"], "signed-token");
        assert_eq!(cal["id"], "chan-1");

        let mail = mailbox_watch_body("signed-token", "https://cs.example/v1/webhooks/google");
        assert_eq!(mail["address"], "https://cs.example/v1/webhooks/google");
        assert_eq!(mail["token"], "signed-token");
        assert_eq!(mail["labelIds"][0], "INBOX");
    }

    #[test]
    fn test_vanished_message_becomes_removal() {
        let change = change_for_message("msg-1", Ok(None)).unwrap().unwrap();
        assert!(change.removed);
        assert_eq!(change.external_id, "msg-1");
        assert!(change.item.is_none());
    }

    #[test]
    fn test_unreadable_message_skipped_not_fatal() {
        // One bad message must not fail the run: a sync-wide failure would
        // pin the cursor and refetch the same id forever.
        let result = change_for_message(
            "msg-2",
            Err(SyncError::MalformedInput("bad metadata".into())),
        );
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_transient_message_failure_propagates() {
        let result = change_for_message("msg-3", Err(SyncError::Transient("timeout".into())));
        assert!(matches!(result, Err(SyncError::Transient(_))));
    }

    #[test]
    fn test_fetched_message_becomes_upsert() {
        let now = Utc::now();
        let item = RemoteItem {
            title: "Invoice".into(),
            description: None,
            start: Some(now),
            end: Some(now),
            all_day: false,
            location: None,
        };
        let change = change_for_message("msg-4", Ok(Some(item))).unwrap().unwrap();
        assert!(!change.removed);
        assert_eq!(change.item.as_ref().map(|i| i.title.as_str()), Some("Invoice"));
    }

    #[test]
    fn test_parse_epoch_millis() {
        let dt = parse_epoch_millis(Some("1717320000000")).unwrap();
        assert_eq!(dt.timestamp(), 1_717_320_000);
        assert!(parse_epoch_millis(Some("not-a-number")).is_none());
        assert!(parse_epoch_millis(None).is_none());
    }
}
