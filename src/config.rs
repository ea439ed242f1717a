use anyhow::{Context, Result};

/// Application configuration, loaded from environment variables.
///
/// All sync tuning knobs (resync window, renewal lead time, refresh margin,
/// retry bounds) live here rather than as constants in the engine, so a
/// deployment can adapt them to provider-advertised limits.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Server ──────────────────────────────────────────────────────────
    pub host: String,
    pub port: u16,
    /// Public base URL the provider delivers push notifications to.
    pub base_url: String,

    // ── Database (PostgreSQL) ───────────────────────────────────────────
    pub database_url: String,

    // ── Crypto ──────────────────────────────────────────────────────────
    /// 32-byte base64-encoded master key for AES-256-GCM token encryption.
    pub master_key: String,
    /// 32-byte base64-encoded HMAC key for channel token signing.
    pub hmac_secret: String,

    // ── Service-to-service auth ─────────────────────────────────────────
    /// Shared secret for internal callers (task linking, manual sync, watch management).
    pub internal_secret: String,

    // ── Provider credentials ────────────────────────────────────────────
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub microsoft_client_id: Option<String>,
    pub microsoft_client_secret: Option<String>,

    // ── Sync tuning ─────────────────────────────────────────────────────
    /// Window for full (non-delta) resyncs, in days from now.
    pub resync_window_days: i64,
    /// Renew watch channels expiring within this many hours.
    pub renewal_lead_hours: i64,
    /// Refresh access tokens expiring within this many seconds.
    pub refresh_margin_secs: i64,
    /// Consecutive renewal failures before the credential is flagged for reauthorization.
    pub renewal_failure_threshold: i32,
    /// Bounded retry attempts for transient provider failures.
    pub max_retry_attempts: u32,
    /// Timeout for any single provider network call, in seconds.
    pub provider_timeout_secs: u64,
    /// Interval between watch renewal sweeps, in seconds.
    pub sweep_interval_secs: u64,
    /// Keep processed-notification ledger entries this many hours.
    pub ledger_retention_hours: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8430".into())
                .parse()
                .context("Invalid PORT")?,
            base_url: std::env::var("BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8430".into()),

            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL is required (PostgreSQL connection string)")?,
            master_key: std::env::var("MASTER_KEY")
                .context("MASTER_KEY is required (32 bytes, base64)")?,
            hmac_secret: std::env::var("HMAC_SECRET")
                .context("HMAC_SECRET is required (32 bytes, base64)")?,

            internal_secret: std::env::var("INTERNAL_SECRET")
                .context("INTERNAL_SECRET is required for service-to-service auth")?,

            google_client_id: std::env::var("GOOGLE_CLIENT_ID").ok(),
            google_client_secret: std::env::var("GOOGLE_CLIENT_SECRET").ok(),
            microsoft_client_id: std::env::var("MICROSOFT_CLIENT_ID").ok(),
            microsoft_client_secret: std::env::var("MICROSOFT_CLIENT_SECRET").ok(),

            resync_window_days: env_i64("RESYNC_WINDOW_DAYS", 30)?,
            renewal_lead_hours: env_i64("RENEWAL_LEAD_HOURS", 24)?,
            refresh_margin_secs: env_i64("REFRESH_MARGIN_SECS", 120)?,
            renewal_failure_threshold: env_i64("RENEWAL_FAILURE_THRESHOLD", 3)? as i32,
            max_retry_attempts: env_i64("MAX_RETRY_ATTEMPTS", 3)? as u32,
            provider_timeout_secs: env_i64("PROVIDER_TIMEOUT_SECS", 30)? as u64,
            sweep_interval_secs: env_i64("SWEEP_INTERVAL_SECS", 15 * 60)? as u64,
            ledger_retention_hours: env_i64("LEDGER_RETENTION_HOURS", 48)?,
        })
    }

    /// Public webhook URL the provider pushes notifications to.
    pub fn webhook_url(&self, provider: &str) -> String {
        format!("{}/v1/webhooks/{}", self.base_url, provider)
    }
}

fn env_i64(name: &str, default: i64) -> Result<i64> {
    match std::env::var(name) {
        Ok(v) => v.parse().with_context(|| format!("Invalid {name}")),
        Err(_) => Ok(default),
    }
}
