use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::time::Duration;

/// Unified error type for the calsync service.
///
/// The provider-facing taxonomy (AuthExpired / CursorInvalid / Transient /
/// RateLimited / MalformedInput) is shared by the watch manager and the sync
/// engine so both call sites behave the same way on the same failure.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ── Provider taxonomy ───────────────────────────────────────────────
    /// Refresh token revoked or expired. Surfaced to the end user as
    /// "reconnect required"; callers must not retry automatically.
    #[error("Reauthorization required: {0}")]
    AuthExpired(String),

    /// The provider rejected the stored sync cursor. Expected control flow:
    /// the engine falls back to a bounded full-window resync.
    #[error("Sync cursor no longer valid")]
    CursorInvalid,

    /// Network failure / 5xx. Retried with backoff up to a bounded attempt
    /// count, then deferred to the next trigger.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// 429 with an optional provider-specified delay to honor.
    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    /// Bad webhook payload or a remote item missing required fields.
    /// The offending item is skipped, never a sync-wide failure.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    // ── HTTP surface ────────────────────────────────────────────────────
    #[error("Authentication required")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Provider {0} not registered")]
    ProviderNotFound(String),

    // ── Internal ────────────────────────────────────────────────────────
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Classify a provider HTTP response into the shared taxonomy.
    ///
    /// `retry_after` is the parsed Retry-After header value, if any. `body`
    /// is included in messages for diagnostics only.
    pub fn classify_http(status: u16, retry_after: Option<u64>, body: &str) -> SyncError {
        match status {
            401 => SyncError::AuthExpired(format!("provider returned 401: {body}")),
            // Some providers signal a revoked grant as 400 invalid_grant.
            400 if body.contains("invalid_grant") => {
                SyncError::AuthExpired(format!("refresh token rejected: {body}"))
            }
            410 => SyncError::CursorInvalid,
            429 => SyncError::RateLimited {
                retry_after: retry_after.map(Duration::from_secs),
            },
            408 | 500..=599 => SyncError::Transient(format!("provider returned {status}: {body}")),
            _ => SyncError::MalformedInput(format!("provider returned {status}: {body}")),
        }
    }

    /// Whether this failure should be retried within the current run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transient(_) | SyncError::RateLimited { .. }
        )
    }

    /// Delay before the next retry attempt (0-based), honoring the
    /// provider-specified delay for rate limits.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        match self {
            SyncError::RateLimited {
                retry_after: Some(d),
            } => *d,
            _ => backoff_delay(attempt),
        }
    }
}

/// Exponential backoff: 1s, 2s, 4s, ... capped at 60s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(6);
    Duration::from_secs(secs.min(60))
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!("Database error: {e}");
        SyncError::Database(e.to_string())
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(e: anyhow::Error) -> Self {
        SyncError::Internal(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transient(e.to_string())
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            SyncError::AuthExpired(_) => (StatusCode::UNAUTHORIZED, "reauthorization_required"),
            SyncError::CursorInvalid => (StatusCode::GONE, "cursor_invalid"),
            SyncError::Transient(_) => (StatusCode::BAD_GATEWAY, "provider_unavailable"),
            SyncError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            SyncError::MalformedInput(_) => (StatusCode::BAD_REQUEST, "malformed_input"),
            SyncError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            SyncError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            SyncError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            SyncError::ProviderNotFound(_) => (StatusCode::NOT_FOUND, "provider_not_found"),
            SyncError::Crypto(_) => (StatusCode::INTERNAL_SERVER_ERROR, "crypto_error"),
            SyncError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            SyncError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_expired() {
        assert!(matches!(
            SyncError::classify_http(401, None, "unauthorized"),
            SyncError::AuthExpired(_)
        ));
        assert!(matches!(
            SyncError::classify_http(400, None, r#"{"error":"invalid_grant"}"#),
            SyncError::AuthExpired(_)
        ));
    }

    #[test]
    fn test_classify_cursor_gone() {
        assert!(matches!(
            SyncError::classify_http(410, None, ""),
            SyncError::CursorInvalid
        ));
    }

    #[test]
    fn test_classify_rate_limited_honors_retry_after() {
        let err = SyncError::classify_http(429, Some(17), "");
        match err {
            SyncError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(17)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert_eq!(
            SyncError::classify_http(429, Some(17), "").retry_delay(0),
            Duration::from_secs(17)
        );
    }

    #[test]
    fn test_classify_transient_and_malformed() {
        assert!(matches!(
            SyncError::classify_http(503, None, "down"),
            SyncError::Transient(_)
        ));
        assert!(matches!(
            SyncError::classify_http(404, None, "no such resource"),
            SyncError::MalformedInput(_)
        ));
        assert!(SyncError::classify_http(500, None, "").is_retryable());
        assert!(!SyncError::classify_http(401, None, "").is_retryable());
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(20), Duration::from_secs(60));
    }
}
