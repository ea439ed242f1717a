//! PostgreSQL-backed mirror store.
//!
//! Tables:
//! - `credentials`: encrypted OAuth tokens per (user_id, provider)
//! - `watch_subscriptions`: push channel + sync cursor per (user_id, provider, resource_type)
//! - `mirror_records`: the local mirror of remote events/messages
//! - `processed_notifications`: dedup ledger for at-least-once webhook delivery

use crate::crypto::CryptoEngine;
use crate::error::SyncError;
use crate::providers::{RemoteItem, ResourceType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Mirror store backed by PostgreSQL.
pub struct MirrorStore {
    pool: PgPool,
}

impl MirrorStore {
    pub async fn new(db_url: &str) -> Result<Self, SyncError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(20)
            .connect(db_url)
            .await
            .map_err(|e| SyncError::Database(format!("Failed to connect to PostgreSQL: {e}")))?;

        Ok(Self { pool })
    }

    /// Run schema migrations.
    pub async fn migrate(&self) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id         TEXT NOT NULL,
                provider        TEXT NOT NULL,
                access_token    TEXT NOT NULL,
                refresh_token   TEXT,
                expires_at      TIMESTAMPTZ,
                scopes          TEXT DEFAULT '',
                needs_reauth    BOOLEAN NOT NULL DEFAULT false,
                created_at      TIMESTAMPTZ DEFAULT NOW(),
                updated_at      TIMESTAMPTZ DEFAULT NOW(),
                UNIQUE(user_id, provider)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watch_subscriptions (
                id                    UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id               TEXT NOT NULL,
                provider              TEXT NOT NULL,
                resource_type         TEXT NOT NULL,
                channel_id            TEXT NOT NULL,
                resource_id           TEXT NOT NULL DEFAULT '',
                expires_at            TIMESTAMPTZ,
                sync_cursor           TEXT,
                consecutive_failures  INT NOT NULL DEFAULT 0,
                created_at            TIMESTAMPTZ DEFAULT NOW(),
                updated_at            TIMESTAMPTZ DEFAULT NOW(),
                UNIQUE(user_id, provider, resource_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mirror_records (
                id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id         TEXT NOT NULL,
                provider        TEXT NOT NULL,
                resource_type   TEXT NOT NULL,
                external_id     TEXT NOT NULL,
                title           TEXT NOT NULL DEFAULT '',
                description     TEXT,
                starts_at       TIMESTAMPTZ NOT NULL,
                ends_at         TIMESTAMPTZ NOT NULL,
                all_day         BOOLEAN NOT NULL DEFAULT false,
                location        TEXT,
                task_id         TEXT,
                created_at      TIMESTAMPTZ DEFAULT NOW(),
                updated_at      TIMESTAMPTZ DEFAULT NOW(),
                UNIQUE(user_id, resource_type, external_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_notifications (
                user_id      TEXT NOT NULL,
                provider     TEXT NOT NULL,
                message_id   TEXT NOT NULL,
                received_at  TIMESTAMPTZ DEFAULT NOW(),
                PRIMARY KEY(user_id, provider, message_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mirror_records_range ON mirror_records(user_id, starts_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_watch_subscriptions_expiry ON watch_subscriptions(expires_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_processed_notifications_age ON processed_notifications(received_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    /// Upsert a credential (stores encrypted tokens, clears any reauth flag).
    pub async fn upsert_credential(
        &self,
        crypto: &CryptoEngine,
        cred: &CredentialUpsert,
    ) -> Result<(), SyncError> {
        let enc_access = crypto.encrypt(&cred.access_token)?;
        let enc_refresh = match &cred.refresh_token {
            Some(rt) => Some(crypto.encrypt(rt)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO credentials (user_id, provider, access_token, refresh_token, expires_at, scopes, needs_reauth)
            VALUES ($1, $2, $3, $4, $5, $6, false)
            ON CONFLICT (user_id, provider)
            DO UPDATE SET
                access_token  = EXCLUDED.access_token,
                refresh_token = COALESCE(EXCLUDED.refresh_token, credentials.refresh_token),
                expires_at    = EXCLUDED.expires_at,
                scopes        = EXCLUDED.scopes,
                needs_reauth  = false,
                updated_at    = NOW()
            "#,
        )
        .bind(&cred.user_id)
        .bind(&cred.provider)
        .bind(&enc_access)
        .bind(&enc_refresh)
        .bind(cred.expires_at)
        .bind(&cred.scopes)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a decrypted credential.
    pub async fn get_credential(
        &self,
        crypto: &CryptoEngine,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<Credential>, SyncError> {
        let row = sqlx::query(
            r#"
            SELECT access_token, refresh_token, expires_at, scopes, needs_reauth
            FROM credentials
            WHERE user_id = $1 AND provider = $2
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let enc_access: String = row.get(0);
        let enc_refresh: Option<String> = row.try_get(1).ok().flatten();

        let access_token = crypto.decrypt(&enc_access)?;
        let refresh_token = match enc_refresh {
            Some(ref rt) if !rt.is_empty() => Some(crypto.decrypt(rt)?),
            _ => None,
        };

        Ok(Some(Credential {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            access_token,
            refresh_token,
            expires_at: row.try_get(2).ok().flatten(),
            scopes: row.get(3),
            needs_reauth: row.get(4),
        }))
    }

    /// Update a credential's tokens after a refresh.
    pub async fn update_refreshed_tokens(
        &self,
        crypto: &CryptoEngine,
        user_id: &str,
        provider: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), SyncError> {
        let enc_access = crypto.encrypt(access_token)?;
        let enc_refresh = match refresh_token {
            Some(rt) => Some(crypto.encrypt(rt)?),
            None => None,
        };

        sqlx::query(
            r#"
            UPDATE credentials
            SET access_token  = $1,
                refresh_token = COALESCE($2, refresh_token),
                expires_at    = $3,
                needs_reauth  = false,
                updated_at    = NOW()
            WHERE user_id = $4 AND provider = $5
            "#,
        )
        .bind(&enc_access)
        .bind(&enc_refresh)
        .bind(expires_at)
        .bind(user_id)
        .bind(provider)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Flag a credential as needing end-user reauthorization.
    pub async fn mark_needs_reauth(&self, user_id: &str, provider: &str) -> Result<(), SyncError> {
        sqlx::query(
            "UPDATE credentials SET needs_reauth = true, updated_at = NOW() WHERE user_id = $1 AND provider = $2",
        )
        .bind(user_id)
        .bind(provider)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a credential. No-op if absent.
    pub async fn delete_credential(&self, user_id: &str, provider: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM credentials WHERE user_id = $1 AND provider = $2")
            .bind(user_id)
            .bind(provider)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Watch subscriptions
    // =========================================================================

    /// Upsert a subscription; a new channel supersedes the old row.
    pub async fn upsert_subscription(&self, sub: &SubscriptionUpsert) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO watch_subscriptions
                (user_id, provider, resource_type, channel_id, resource_id, expires_at, consecutive_failures)
            VALUES ($1, $2, $3, $4, $5, $6, 0)
            ON CONFLICT (user_id, provider, resource_type)
            DO UPDATE SET
                channel_id           = EXCLUDED.channel_id,
                resource_id          = EXCLUDED.resource_id,
                expires_at           = EXCLUDED.expires_at,
                consecutive_failures = 0,
                updated_at           = NOW()
            "#,
        )
        .bind(&sub.user_id)
        .bind(&sub.provider)
        .bind(sub.resource_type.as_str())
        .bind(&sub.channel_id)
        .bind(&sub.resource_id)
        .bind(sub.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_subscription(
        &self,
        user_id: &str,
        provider: &str,
        resource_type: ResourceType,
    ) -> Result<Option<WatchSubscription>, SyncError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, provider, resource_type, channel_id, resource_id,
                   expires_at, sync_cursor, consecutive_failures
            FROM watch_subscriptions
            WHERE user_id = $1 AND provider = $2 AND resource_type = $3
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(resource_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(subscription_from_row).transpose()
    }

    pub async fn delete_subscription(
        &self,
        user_id: &str,
        provider: &str,
        resource_type: ResourceType,
    ) -> Result<(), SyncError> {
        sqlx::query(
            "DELETE FROM watch_subscriptions WHERE user_id = $1 AND provider = $2 AND resource_type = $3",
        )
        .bind(user_id)
        .bind(provider)
        .bind(resource_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a new sync cursor for a subscription.
    pub async fn set_cursor(
        &self,
        user_id: &str,
        provider: &str,
        resource_type: ResourceType,
        cursor: &str,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            UPDATE watch_subscriptions
            SET sync_cursor = $1, updated_at = NOW()
            WHERE user_id = $2 AND provider = $3 AND resource_type = $4
            "#,
        )
        .bind(cursor)
        .bind(user_id)
        .bind(provider)
        .bind(resource_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Subscriptions expiring within the lead window (for the renewal sweep).
    pub async fn list_expiring_subscriptions(
        &self,
        within: chrono::Duration,
    ) -> Result<Vec<WatchSubscription>, SyncError> {
        let deadline = Utc::now() + within;
        let rows = sqlx::query(
            r#"
            SELECT user_id, provider, resource_type, channel_id, resource_id,
                   expires_at, sync_cursor, consecutive_failures
            FROM watch_subscriptions
            WHERE expires_at IS NOT NULL AND expires_at < $1
            "#,
        )
        .bind(deadline)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(subscription_from_row).collect()
    }

    /// Increment the renewal failure count, returning the new count.
    pub async fn bump_renewal_failures(
        &self,
        user_id: &str,
        provider: &str,
        resource_type: ResourceType,
    ) -> Result<i32, SyncError> {
        let row = sqlx::query(
            r#"
            UPDATE watch_subscriptions
            SET consecutive_failures = consecutive_failures + 1, updated_at = NOW()
            WHERE user_id = $1 AND provider = $2 AND resource_type = $3
            RETURNING consecutive_failures
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(resource_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get(0)).unwrap_or(0))
    }

    // =========================================================================
    // Mirror records
    // =========================================================================

    /// Upsert a mirror record by (user, resource type, external id).
    ///
    /// Overwrites provider-owned fields only; `task_id` is deliberately
    /// absent from the update list so a local task link survives resyncs.
    pub async fn upsert_record(
        &self,
        user_id: &str,
        provider: &str,
        resource_type: ResourceType,
        external_id: &str,
        item: &RemoteItem,
    ) -> Result<(), SyncError> {
        let (starts_at, ends_at) = match (item.start, item.end) {
            (Some(s), Some(e)) => (s, e),
            (Some(s), None) => (s, s),
            _ => {
                return Err(SyncError::MalformedInput(format!(
                    "remote item {external_id} has no resolvable start"
                )))
            }
        };

        sqlx::query(
            r#"
            INSERT INTO mirror_records
                (user_id, provider, resource_type, external_id, title, description,
                 starts_at, ends_at, all_day, location)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id, resource_type, external_id)
            DO UPDATE SET
                provider    = EXCLUDED.provider,
                title       = EXCLUDED.title,
                description = EXCLUDED.description,
                starts_at   = EXCLUDED.starts_at,
                ends_at     = EXCLUDED.ends_at,
                all_day     = EXCLUDED.all_day,
                location    = EXCLUDED.location,
                updated_at  = NOW()
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(resource_type.as_str())
        .bind(external_id)
        .bind(&item.title)
        .bind(&item.description)
        .bind(starts_at)
        .bind(ends_at)
        .bind(item.all_day)
        .bind(&item.location)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete one mirror record. Returns whether a row existed; deleting a
    /// missing record is a no-op, not an error.
    pub async fn delete_record(
        &self,
        user_id: &str,
        resource_type: ResourceType,
        external_id: &str,
    ) -> Result<bool, SyncError> {
        let affected = sqlx::query(
            "DELETE FROM mirror_records WHERE user_id = $1 AND resource_type = $2 AND external_id = $3",
        )
        .bind(user_id)
        .bind(resource_type.as_str())
        .bind(external_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Delete all mirror records for one (user, provider, resource type).
    pub async fn delete_records_for(
        &self,
        user_id: &str,
        provider: &str,
        resource_type: ResourceType,
    ) -> Result<u64, SyncError> {
        let affected = sqlx::query(
            "DELETE FROM mirror_records WHERE user_id = $1 AND provider = $2 AND resource_type = $3",
        )
        .bind(user_id)
        .bind(provider)
        .bind(resource_type.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected)
    }

    /// Downstream read contract: events for a user in a date range.
    pub async fn records_in_range(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MirrorRecord>, SyncError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, provider, resource_type, external_id, title, description,
                   starts_at, ends_at, all_day, location, task_id, updated_at
            FROM mirror_records
            WHERE user_id = $1 AND starts_at >= $2 AND starts_at < $3
            ORDER BY starts_at
            "#,
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    /// Downstream write contract: set or clear the local task link.
    /// This is the only mirror-record field downstream consumers may write.
    pub async fn set_task_link(
        &self,
        record_id: Uuid,
        task_id: Option<&str>,
    ) -> Result<(), SyncError> {
        let affected = sqlx::query(
            "UPDATE mirror_records SET task_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(task_id)
        .bind(record_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(SyncError::NotFound("mirror record".into()));
        }
        Ok(())
    }

    // =========================================================================
    // Processed-notification ledger
    // =========================================================================

    /// Record a notification for processing. Returns false when the message
    /// id was already seen (duplicate delivery — ack without reprocessing).
    pub async fn record_notification(
        &self,
        user_id: &str,
        provider: &str,
        message_id: &str,
    ) -> Result<bool, SyncError> {
        let affected = sqlx::query(
            r#"
            INSERT INTO processed_notifications (user_id, provider, message_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, provider, message_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(message_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Trim ledger entries older than the retention window.
    pub async fn prune_notifications(&self, older_than: chrono::Duration) -> Result<u64, SyncError> {
        let threshold = Utc::now() - older_than;
        let affected = sqlx::query("DELETE FROM processed_notifications WHERE received_at < $1")
            .bind(threshold)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(affected)
    }
}

fn subscription_from_row(row: sqlx::postgres::PgRow) -> Result<WatchSubscription, SyncError> {
    let resource_raw: String = row.get(2);
    let resource_type = ResourceType::parse(&resource_raw).ok_or_else(|| {
        SyncError::Database(format!("unknown resource_type in store: {resource_raw}"))
    })?;

    Ok(WatchSubscription {
        user_id: row.get(0),
        provider: row.get(1),
        resource_type,
        channel_id: row.get(3),
        resource_id: row.get(4),
        expires_at: row.try_get(5).ok().flatten(),
        cursor: row.try_get(6).ok().flatten(),
        consecutive_failures: row.get(7),
    })
}

fn record_from_row(row: sqlx::postgres::PgRow) -> Result<MirrorRecord, SyncError> {
    let resource_raw: String = row.get(3);
    let resource_type = ResourceType::parse(&resource_raw).ok_or_else(|| {
        SyncError::Database(format!("unknown resource_type in store: {resource_raw}"))
    })?;

    Ok(MirrorRecord {
        id: row.get(0),
        user_id: row.get(1),
        provider: row.get(2),
        resource_type,
        external_id: row.get(4),
        title: row.get(5),
        description: row.try_get(6).ok().flatten(),
        starts_at: row.get(7),
        ends_at: row.get(8),
        all_day: row.get(9),
        location: row.try_get(10).ok().flatten(),
        task_id: row.try_get(11).ok().flatten(),
        updated_at: row.get(12),
    })
}

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CredentialUpsert {
    pub user_id: String,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: String,
}

/// Decrypted credential, only ever handed out by the token broker.
#[derive(Debug)]
pub struct Credential {
    pub user_id: String,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: String,
    pub needs_reauth: bool,
}

#[derive(Debug)]
pub struct SubscriptionUpsert {
    pub user_id: String,
    pub provider: String,
    pub resource_type: ResourceType,
    pub channel_id: String,
    pub resource_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchSubscription {
    pub user_id: String,
    pub provider: String,
    pub resource_type: ResourceType,
    pub channel_id: String,
    pub resource_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub cursor: Option<String>,
    pub consecutive_failures: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorRecord {
    pub id: Uuid,
    pub user_id: String,
    pub provider: String,
    pub resource_type: ResourceType,
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub all_day: bool,
    pub location: Option<String>,
    pub task_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}
