//! Storage layer for subscriptions and ingested items
//!
//! Both stores sit behind narrow async traits so the engine never touches
//! shared state except through their contracts. The SQLite implementations
//! live in [`sqlite`].

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::Result;
use crate::schemas::{
    FetchOutcome, NewItem, NewSubscription, StoredItem, Subscription, SubscriptionId,
};

pub use sqlite::{SqliteItemStore, SqliteSubscriptionStore};

/// Durable registry of sources and their schedule/failure state
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Registers a source under its canonical URL. Fails with
    /// `DuplicateSource` if an equivalent URL or the same channel is
    /// already registered, `InvalidUrl` if the URL does not parse.
    async fn register(&self, subscription: &NewSubscription) -> Result<SubscriptionId>;

    async fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>>;

    async fn list(&self) -> Result<Vec<Subscription>>;

    /// Enabled subscriptions with `next_due` unset or `<= now`, never-attempted first.
    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>>;

    /// Records a completed attempt in one conditional update and returns the
    /// updated row.
    async fn mark_attempt(
        &self,
        id: SubscriptionId,
        outcome: &FetchOutcome,
        attempted_at: DateTime<Utc>,
        next_due: Option<DateTime<Utc>>,
    ) -> Result<Subscription>;

    async fn disable(&self, id: SubscriptionId, reason: &str) -> Result<()>;

    /// Re-enables a subscription and resets its failure count.
    async fn enable(&self, id: SubscriptionId) -> Result<()>;

    async fn update_schedule(
        &self,
        id: SubscriptionId,
        schedule: &str,
        next_due: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// (total, enabled)
    async fn counts(&self) -> Result<(u64, u64)>;

    /// Subscriptions at or above `threshold` consecutive failures, plus any
    /// disabled with a recorded error.
    async fn failing(&self, threshold: u32) -> Result<Vec<Subscription>>;
}

/// Durable, deduplicated store of fetched items
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Which of `keys` are already stored for this subscription.
    async fn existing_keys(
        &self,
        subscription_id: SubscriptionId,
        keys: &[String],
    ) -> Result<HashSet<String>>;

    /// Inserts an item unless its identity already exists. Returns whether a
    /// row was written.
    async fn insert(&self, item: &NewItem) -> Result<bool>;

    async fn recent(&self, subscription_id: SubscriptionId, limit: u32) -> Result<Vec<StoredItem>>;

    async fn count_for_subscription(&self, subscription_id: SubscriptionId) -> Result<u64>;

    async fn count_discovered_since(&self, since: DateTime<Utc>) -> Result<u64>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    name                 TEXT    NOT NULL,
    url                  TEXT    NOT NULL UNIQUE,
    source_key           TEXT    NOT NULL UNIQUE,
    kind                 TEXT    NOT NULL,
    schedule             TEXT    NOT NULL,
    last_checked         INTEGER,
    next_due             INTEGER,
    enabled              INTEGER NOT NULL DEFAULT 1,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_error           TEXT,
    created_at           INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_due ON subscriptions (enabled, next_due);

CREATE TABLE IF NOT EXISTS items (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    subscription_id INTEGER NOT NULL REFERENCES subscriptions (id) ON DELETE CASCADE,
    external_id     TEXT    NOT NULL,
    title           TEXT    NOT NULL,
    description     TEXT,
    url             TEXT,
    published_at    INTEGER,
    discovered_at   INTEGER NOT NULL,
    content_hash    TEXT    NOT NULL,
    UNIQUE (subscription_id, external_id)
);

CREATE INDEX IF NOT EXISTS idx_items_published ON items (subscription_id, published_at);
CREATE INDEX IF NOT EXISTS idx_items_discovered ON items (discovered_at);
"#;

/// Owns the connection pool and hands out store handles
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Opens (creating if missing) the database at `database_url` and
    /// bootstraps the schema.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        info!(url = %database_url, "Opening database...");

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.migrate().await?;

        info!("Storage initialized");
        Ok(storage)
    }

    /// Private in-memory database. A single connection is kept alive for the
    /// lifetime of the pool, since closing it drops the data.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn subscriptions(&self) -> SqliteSubscriptionStore {
        SqliteSubscriptionStore::new(self.pool.clone())
    }

    pub fn items(&self) -> SqliteItemStore {
        SqliteItemStore::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip_truncates_to_millis() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
            + chrono::Duration::microseconds(1_500);
        let back = from_millis(to_millis(t));
        assert_eq!(back.timestamp_millis(), t.timestamp_millis());
        assert!(back <= t);
    }

    #[tokio::test]
    async fn test_file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("nested/ingest.db").display());

        {
            let storage = Storage::new(&url, 2).await.unwrap();
            storage
                .subscriptions()
                .register(&NewSubscription::new("a", "https://a.example/rss", "feed", "@hourly"))
                .await
                .unwrap();
            storage.close().await;
        }

        let storage = Storage::new(&url, 2).await.unwrap();
        let subs = storage.subscriptions().list().await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].url, "https://a.example/rss");
    }
}
