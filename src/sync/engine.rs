//! The incremental sync engine.
//!
//! One engine, two triggers: webhook notifications and manual "refresh now"
//! both land in [`sync`]. The engine pulls the provider's change feed to
//! completion, applies every change to the mirror store, and only then
//! persists the new cursor — a cursor must never advance past items that
//! have not been applied, or those items are permanently skipped.

use serde::Serialize;
use tracing::{info, warn};

use crate::broker;
use crate::error::SyncError;
use crate::providers::{
    ChangeRequest, RemoteChange, RemoteItem, ResourceType, SyncProvider, SyncWindow,
};
use crate::AppState;

/// Result of one sync run.
#[derive(Debug, Default, Serialize)]
pub struct SyncOutcome {
    pub applied: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub full_resync: bool,
    pub cursor: Option<String>,
}

/// All changes pulled in one run, with the cursor that becomes current once
/// every change has been applied.
#[derive(Debug, Default)]
pub struct PulledChanges {
    pub changes: Vec<RemoteChange>,
    pub cursor: Option<String>,
    pub did_full_resync: bool,
}

/// What to do with one remote change.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOp {
    Upsert(RemoteItem),
    Delete,
    /// Item lacks a resolvable start/end; logged and dropped, never fatal.
    Skip,
}

/// Decide the mirror operation for a single remote change.
pub fn plan_change(change: &RemoteChange) -> RecordOp {
    if change.removed {
        return RecordOp::Delete;
    }
    match &change.item {
        Some(item) if item.start.is_some() => RecordOp::Upsert(item.clone()),
        _ => RecordOp::Skip,
    }
}

/// Run one sync for (user, provider, resource).
///
/// Serialized per key: concurrent notifications for the same user queue
/// behind the in-flight run; other users proceed in parallel. There is no
/// cancellation — a queued follow-up picks up whatever is newer.
pub async fn sync(
    state: &AppState,
    user_id: &str,
    provider_id: &str,
    resource: ResourceType,
) -> Result<SyncOutcome, SyncError> {
    let gate_key = format!("{user_id}:{provider_id}:{resource}");
    let _guard = state.sync_gate.acquire(&gate_key).await;

    let provider = state
        .registry
        .get(provider_id)
        .ok_or_else(|| SyncError::ProviderNotFound(provider_id.to_string()))?;

    let access_token = broker::get_valid_token(state, user_id, provider_id).await?;

    let subscription = state
        .store
        .get_subscription(user_id, provider_id, resource)
        .await?;
    let cursor = subscription.as_ref().and_then(|s| s.cursor.clone());

    let window = SyncWindow::next_days(state.config.resync_window_days);
    let pulled = pull_changes(
        provider,
        &access_token,
        resource,
        cursor.as_deref(),
        &window,
        state.config.max_retry_attempts,
    )
    .await?;

    let mut outcome = SyncOutcome {
        full_resync: pulled.did_full_resync,
        ..Default::default()
    };

    for change in &pulled.changes {
        match plan_change(change) {
            RecordOp::Upsert(item) => {
                state
                    .store
                    .upsert_record(user_id, provider_id, resource, &change.external_id, &item)
                    .await?;
                outcome.applied += 1;
            }
            RecordOp::Delete => {
                // No-op when the record was never mirrored.
                if state
                    .store
                    .delete_record(user_id, resource, &change.external_id)
                    .await?
                {
                    outcome.deleted += 1;
                }
            }
            RecordOp::Skip => {
                warn!(
                    user_id,
                    provider = provider_id,
                    external_id = %change.external_id,
                    "skipping remote item without resolvable start/end"
                );
                outcome.skipped += 1;
            }
        }
    }

    // The cursor advances only now, after every pulled change is applied.
    // A failure above leaves the old cursor in place; re-delivery recovers.
    if let Some(new_cursor) = &pulled.cursor {
        if subscription.is_some() {
            state
                .store
                .set_cursor(user_id, provider_id, resource, new_cursor)
                .await?;
        }
        outcome.cursor = Some(new_cursor.clone());
    }

    info!(
        user_id,
        provider = provider_id,
        resource = %resource,
        applied = outcome.applied,
        deleted = outcome.deleted,
        skipped = outcome.skipped,
        full_resync = outcome.full_resync,
        "sync complete"
    );

    Ok(outcome)
}

/// Pull the full change feed: delta since `cursor` when one is stored,
/// otherwise a bounded-window full fetch.
///
/// A rejected cursor is expected control flow, not an error: the engine
/// falls back once to the bounded full fetch, which establishes a brand-new
/// cursor. `CursorInvalid` from the fallback itself does propagate.
pub async fn pull_changes(
    provider: &dyn SyncProvider,
    access_token: &str,
    resource: ResourceType,
    cursor: Option<&str>,
    window: &SyncWindow,
    max_attempts: u32,
) -> Result<PulledChanges, SyncError> {
    match pull_pages(provider, access_token, resource, cursor, window, max_attempts).await {
        Err(SyncError::CursorInvalid) if cursor.is_some() => {
            info!(
                provider = provider.id(),
                resource = %resource,
                "cursor rejected by provider, falling back to full window resync"
            );
            let mut pulled =
                pull_pages(provider, access_token, resource, None, window, max_attempts).await?;
            pulled.did_full_resync = true;
            Ok(pulled)
        }
        other => other,
    }
}

/// Follow pagination to completion. The new cursor comes from the final
/// page only; a failure mid-stream yields no cursor at all.
async fn pull_pages(
    provider: &dyn SyncProvider,
    access_token: &str,
    resource: ResourceType,
    cursor: Option<&str>,
    window: &SyncWindow,
    max_attempts: u32,
) -> Result<PulledChanges, SyncError> {
    let mut changes = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        let request = ChangeRequest {
            cursor: cursor.map(str::to_string),
            page_token: page_token.clone(),
        };

        let page = {
            let mut attempt: u32 = 0;
            loop {
                match provider
                    .list_changes(access_token, resource, &request, window)
                    .await
                {
                    Ok(page) => break page,
                    Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                        let delay = e.retry_delay(attempt);
                        warn!(
                            provider = provider.id(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "transient provider failure, retrying: {e}"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        changes.extend(page.changes);

        match page.next_page {
            Some(next) => page_token = Some(next),
            None => {
                return Ok(PulledChanges {
                    changes,
                    cursor: page.next_cursor,
                    did_full_resync: false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChangePage, TokenSet, WatchChannel};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted provider: each `list_changes` call pops the next response.
    struct FakeProvider {
        responses: Mutex<Vec<Result<ChangePage, SyncError>>>,
        calls: Mutex<Vec<ChangeRequest>>,
    }

    impl FakeProvider {
        fn new(responses: Vec<Result<ChangePage, SyncError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<ChangeRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncProvider for FakeProvider {
        fn id(&self) -> &str {
            "fake"
        }

        fn display_name(&self) -> &str {
            "Fake"
        }

        async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenSet, SyncError> {
            unimplemented!("not used by these tests")
        }

        async fn create_watch(
            &self,
            _access_token: &str,
            _resource: ResourceType,
            _channel_id: &str,
            _channel_token: &str,
            _notify_url: &str,
        ) -> Result<WatchChannel, SyncError> {
            unimplemented!("not used by these tests")
        }

        async fn stop_watch(
            &self,
            _access_token: &str,
            _channel_id: &str,
            _resource_id: &str,
        ) -> Result<(), SyncError> {
            Ok(())
        }

        async fn list_changes(
            &self,
            _access_token: &str,
            _resource: ResourceType,
            request: &ChangeRequest,
            _window: &SyncWindow,
        ) -> Result<ChangePage, SyncError> {
            self.calls.lock().unwrap().push(request.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(SyncError::Internal("fake provider script exhausted".into()));
            }
            responses.remove(0)
        }

        fn max_watch_ttl(&self, _resource: ResourceType) -> Duration {
            Duration::from_secs(3600)
        }
    }

    fn item(title: &str) -> RemoteItem {
        let now = Utc::now();
        RemoteItem {
            title: title.into(),
            description: None,
            start: Some(now),
            end: Some(now),
            all_day: false,
            location: None,
        }
    }

    fn upsert(id: &str) -> RemoteChange {
        RemoteChange {
            external_id: id.into(),
            removed: false,
            item: Some(item(id)),
        }
    }

    fn removal(id: &str) -> RemoteChange {
        RemoteChange {
            external_id: id.into(),
            removed: true,
            item: None,
        }
    }

    fn window() -> SyncWindow {
        SyncWindow::next_days(30)
    }

    #[tokio::test]
    async fn test_pagination_followed_to_completion() {
        let provider = FakeProvider::new(vec![
            Ok(ChangePage {
                changes: vec![upsert("a"), upsert("b")],
                next_page: Some("page2".into()),
                next_cursor: None,
            }),
            Ok(ChangePage {
                changes: vec![upsert("c")],
                next_page: None,
                next_cursor: Some("cursor-2".into()),
            }),
        ]);

        let pulled = pull_changes(&provider, "tok", ResourceType::Calendar, Some("cursor-1"), &window(), 3)
            .await
            .unwrap();

        assert_eq!(pulled.changes.len(), 3);
        assert_eq!(pulled.cursor.as_deref(), Some("cursor-2"));
        assert!(!pulled.did_full_resync);

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].cursor.as_deref(), Some("cursor-1"));
        assert_eq!(calls[1].page_token.as_deref(), Some("page2"));
    }

    #[tokio::test]
    async fn test_cursor_invalid_falls_back_to_full_resync() {
        let provider = FakeProvider::new(vec![
            Err(SyncError::CursorInvalid),
            Ok(ChangePage {
                changes: vec![upsert("a"), upsert("b")],
                next_page: None,
                next_cursor: Some("fresh-cursor".into()),
            }),
        ]);

        let pulled = pull_changes(&provider, "tok", ResourceType::Calendar, Some("stale"), &window(), 3)
            .await
            .expect("cursor invalidation must not surface as an error");

        assert!(pulled.did_full_resync);
        assert_eq!(pulled.cursor.as_deref(), Some("fresh-cursor"));
        assert_eq!(pulled.changes.len(), 2);

        // The fallback call carries no cursor: a full windowed fetch.
        let calls = provider.calls();
        assert_eq!(calls[1].cursor, None);
    }

    #[tokio::test]
    async fn test_cursor_invalid_without_cursor_propagates() {
        // A full fetch reporting CursorInvalid is a provider bug; it must
        // not trigger an infinite fallback loop.
        let provider = FakeProvider::new(vec![Err(SyncError::CursorInvalid)]);

        let result =
            pull_changes(&provider, "tok", ResourceType::Calendar, None, &window(), 3).await;
        assert!(matches!(result, Err(SyncError::CursorInvalid)));
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_mid_pagination_failure_yields_no_cursor() {
        let provider = FakeProvider::new(vec![
            Ok(ChangePage {
                changes: vec![upsert("a")],
                next_page: Some("page2".into()),
                next_cursor: None,
            }),
            Err(SyncError::MalformedInput("bad page".into())),
        ]);

        let result = pull_changes(
            &provider,
            "tok",
            ResourceType::Calendar,
            Some("cursor-1"),
            &window(),
            3,
        )
        .await;

        // The run fails whole: no partial cursor escapes, so the next run
        // re-pulls everything (idempotent re-application, no loss).
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_transient_failure_retried_within_run() {
        let provider = FakeProvider::new(vec![
            Err(SyncError::Transient("blip".into())),
            Ok(ChangePage {
                changes: vec![upsert("a")],
                next_page: None,
                next_cursor: Some("c".into()),
            }),
        ]);

        let pulled = pull_changes(&provider, "tok", ResourceType::Calendar, Some("c0"), &window(), 3)
            .await
            .unwrap();
        assert_eq!(pulled.changes.len(), 1);
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_auth_expired_never_retried() {
        let provider = FakeProvider::new(vec![Err(SyncError::AuthExpired("revoked".into()))]);

        let result =
            pull_changes(&provider, "tok", ResourceType::Calendar, Some("c0"), &window(), 3).await;
        assert!(matches!(result, Err(SyncError::AuthExpired(_))));
        assert_eq!(provider.calls().len(), 1);
    }

    #[test]
    fn test_plan_cancellation_is_delete() {
        assert_eq!(plan_change(&removal("x")), RecordOp::Delete);
    }

    #[test]
    fn test_plan_missing_times_is_skip() {
        let change = RemoteChange {
            external_id: "x".into(),
            removed: false,
            item: Some(RemoteItem {
                title: "no times".into(),
                description: None,
                start: None,
                end: None,
                all_day: false,
                location: None,
            }),
        };
        assert_eq!(plan_change(&change), RecordOp::Skip);

        let empty = RemoteChange {
            external_id: "y".into(),
            removed: false,
            item: None,
        };
        assert_eq!(plan_change(&empty), RecordOp::Skip);
    }

    #[test]
    fn test_plan_is_idempotent() {
        // The same remote change always produces the same op, so applying
        // a redelivered page twice converges on identical mirror state.
        let change = upsert("ev-1");
        assert_eq!(plan_change(&change), plan_change(&change));
        match plan_change(&change) {
            RecordOp::Upsert(item) => assert_eq!(item.title, "ev-1"),
            other => panic!("expected upsert, got {other:?}"),
        }
    }
}
