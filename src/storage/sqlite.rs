//! SQLite-backed subscription and item stores

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashSet;
use tracing::debug;

use super::{from_millis, to_millis, ItemStore, SubscriptionStore};
use crate::dedup::{canonicalize_url, source_key};
use crate::error::{IngestionError, Result};
use crate::schemas::{
    FetchOutcome, NewItem, NewSubscription, StoredItem, Subscription, SubscriptionId,
};

/// Upper bound on bound parameters per `IN (...)` lookup
const KEY_LOOKUP_CHUNK: usize = 500;

const SUBSCRIPTION_COLUMNS: &str = "id, name, url, kind, schedule, last_checked, next_due, \
     enabled, consecutive_failures, last_error, created_at";

const ITEM_COLUMNS: &str = "id, subscription_id, external_id, title, description, url, \
     published_at, discovered_at, content_hash";

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: i64,
    name: String,
    url: String,
    kind: String,
    schedule: String,
    last_checked: Option<i64>,
    next_due: Option<i64>,
    enabled: bool,
    consecutive_failures: i64,
    last_error: Option<String>,
    created_at: i64,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            id: row.id,
            name: row.name,
            url: row.url,
            kind: row.kind,
            schedule: row.schedule,
            last_checked: row.last_checked.map(from_millis),
            next_due: row.next_due.map(from_millis),
            enabled: row.enabled,
            consecutive_failures: row.consecutive_failures.max(0) as u32,
            last_error: row.last_error,
            created_at: from_millis(row.created_at),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    id: i64,
    subscription_id: i64,
    external_id: String,
    title: String,
    description: Option<String>,
    url: Option<String>,
    published_at: Option<i64>,
    discovered_at: i64,
    content_hash: String,
}

impl From<ItemRow> for StoredItem {
    fn from(row: ItemRow) -> Self {
        StoredItem {
            id: row.id,
            subscription_id: row.subscription_id,
            external_id: row.external_id,
            title: row.title,
            description: row.description,
            url: row.url,
            published_at: row.published_at.map(from_millis),
            discovered_at: from_millis(row.discovered_at),
            content_hash: row.content_hash,
        }
    }
}

fn not_found_if_untouched(rows_affected: u64, id: SubscriptionId) -> Result<()> {
    if rows_affected == 0 {
        Err(IngestionError::SubscriptionNotFound(id))
    } else {
        Ok(())
    }
}

// ============================================
// SUBSCRIPTIONS
// ============================================

#[derive(Clone)]
pub struct SqliteSubscriptionStore {
    pool: SqlitePool,
}

impl SqliteSubscriptionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for SqliteSubscriptionStore {
    async fn register(&self, subscription: &NewSubscription) -> Result<SubscriptionId> {
        let raw = subscription.url.trim();
        let invalid = |e: url::ParseError| IngestionError::InvalidUrl(format!("{raw}: {e}"));
        // Spellings of the same source share one row
        let url = canonicalize_url(raw).map_err(invalid)?;
        let key = source_key(raw).map_err(invalid)?;

        let result = sqlx::query(
            "INSERT INTO subscriptions (name, url, source_key, kind, schedule, enabled, consecutive_failures, created_at)
             VALUES (?, ?, ?, ?, ?, 1, 0, ?)",
        )
        .bind(subscription.name.trim())
        .bind(&url)
        .bind(&key)
        .bind(subscription.kind.trim())
        .bind(subscription.schedule.trim())
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                let id = done.last_insert_rowid();
                debug!(subscription_id = id, url = %url, "Registered subscription");
                Ok(id)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(IngestionError::DuplicateSource(url))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list(&self) -> Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        // `next_due IS NOT NULL` sorts never-attempted rows first
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE enabled = 1 AND (next_due IS NULL OR next_due <= ?)
             ORDER BY next_due IS NOT NULL, next_due ASC, id ASC"
        ))
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_attempt(
        &self,
        id: SubscriptionId,
        outcome: &FetchOutcome,
        attempted_at: DateTime<Utc>,
        next_due: Option<DateTime<Utc>>,
    ) -> Result<Subscription> {
        let row = match outcome.error_message() {
            None => {
                sqlx::query_as::<_, SubscriptionRow>(&format!(
                    "UPDATE subscriptions
                     SET last_checked = ?, next_due = ?, consecutive_failures = 0, last_error = NULL
                     WHERE id = ?
                     RETURNING {SUBSCRIPTION_COLUMNS}"
                ))
                .bind(to_millis(attempted_at))
                .bind(next_due.map(to_millis))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            Some(error) => {
                sqlx::query_as::<_, SubscriptionRow>(&format!(
                    "UPDATE subscriptions
                     SET last_checked = ?, next_due = ?,
                         consecutive_failures = consecutive_failures + 1, last_error = ?
                     WHERE id = ?
                     RETURNING {SUBSCRIPTION_COLUMNS}"
                ))
                .bind(to_millis(attempted_at))
                .bind(next_due.map(to_millis))
                .bind(error)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.map(Into::into)
            .ok_or(IngestionError::SubscriptionNotFound(id))
    }

    async fn disable(&self, id: SubscriptionId, reason: &str) -> Result<()> {
        let done = sqlx::query("UPDATE subscriptions SET enabled = 0, last_error = ? WHERE id = ?")
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;

        not_found_if_untouched(done.rows_affected(), id)
    }

    async fn enable(&self, id: SubscriptionId) -> Result<()> {
        let done = sqlx::query(
            "UPDATE subscriptions SET enabled = 1, consecutive_failures = 0 WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        not_found_if_untouched(done.rows_affected(), id)
    }

    async fn update_schedule(
        &self,
        id: SubscriptionId,
        schedule: &str,
        next_due: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let done = sqlx::query("UPDATE subscriptions SET schedule = ?, next_due = ? WHERE id = ?")
            .bind(schedule.trim())
            .bind(next_due.map(to_millis))
            .bind(id)
            .execute(&self.pool)
            .await?;

        not_found_if_untouched(done.rows_affected(), id)
    }

    async fn counts(&self) -> Result<(u64, u64)> {
        let (total, enabled): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(enabled), 0) FROM subscriptions",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((total.max(0) as u64, enabled.max(0) as u64))
    }

    async fn failing(&self, threshold: u32) -> Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE consecutive_failures >= ? OR (enabled = 0 AND last_error IS NOT NULL)
             ORDER BY consecutive_failures DESC, id ASC"
        ))
        .bind(threshold as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ============================================
// ITEMS
// ============================================

#[derive(Clone)]
pub struct SqliteItemStore {
    pool: SqlitePool,
}

impl SqliteItemStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ItemStore for SqliteItemStore {
    async fn existing_keys(
        &self,
        subscription_id: SubscriptionId,
        keys: &[String],
    ) -> Result<HashSet<String>> {
        let unique: Vec<&String> = keys.iter().collect::<HashSet<_>>().into_iter().collect();
        let mut existing = HashSet::new();

        for chunk in unique.chunks(KEY_LOOKUP_CHUNK) {
            let mut query: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT external_id FROM items WHERE subscription_id = ");
            query.push_bind(subscription_id);
            query.push(" AND external_id IN (");
            let mut separated = query.separated(", ");
            for key in chunk {
                separated.push_bind(key.as_str());
            }
            separated.push_unseparated(")");

            let found: Vec<String> = query
                .build_query_scalar::<String>()
                .fetch_all(&self.pool)
                .await?;
            existing.extend(found);
        }

        Ok(existing)
    }

    async fn insert(&self, item: &NewItem) -> Result<bool> {
        // discovered_at never goes backwards within a subscription
        let done = sqlx::query(
            "INSERT INTO items
                (subscription_id, external_id, title, description, url, published_at, discovered_at, content_hash)
             VALUES (?, ?, ?, ?, ?, ?,
                MAX(?, COALESCE((SELECT MAX(discovered_at) FROM items WHERE subscription_id = ?), 0)),
                ?)
             ON CONFLICT (subscription_id, external_id) DO NOTHING",
        )
        .bind(item.subscription_id)
        .bind(&item.external_id)
        .bind(&item.title)
        .bind(&item.description)
        .bind(&item.url)
        .bind(item.published_at.map(to_millis))
        .bind(to_millis(Utc::now()))
        .bind(item.subscription_id)
        .bind(&item.content_hash)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() == 1)
    }

    async fn recent(&self, subscription_id: SubscriptionId, limit: u32) -> Result<Vec<StoredItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE subscription_id = ?
             ORDER BY discovered_at DESC, id DESC LIMIT ?"
        ))
        .bind(subscription_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count_for_subscription(&self, subscription_id: SubscriptionId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE subscription_id = ?")
            .bind(subscription_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }

    async fn count_discovered_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE discovered_at >= ?")
            .bind(to_millis(since))
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::RawItem;
    use crate::storage::Storage;
    use chrono::Duration;

    async fn stores() -> (SqliteSubscriptionStore, SqliteItemStore) {
        let storage = Storage::in_memory().await.unwrap();
        (storage.subscriptions(), storage.items())
    }

    fn feed(url: &str) -> NewSubscription {
        NewSubscription::new("Feed", url, "feed", "@every 1h")
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_url() {
        let (subs, _) = stores().await;
        subs.register(&feed("https://a.example/rss")).await.unwrap();

        let err = subs.register(&feed("https://a.example/rss")).await.unwrap_err();
        assert!(matches!(err, IngestionError::DuplicateSource(ref u) if u == "https://a.example/rss"));
    }

    #[tokio::test]
    async fn test_register_dedups_equivalent_spellings() {
        let (subs, _) = stores().await;
        let id = subs
            .register(&feed("https://Feeds.Example.com/rss?b=2&a=1"))
            .await
            .unwrap();
        assert_eq!(subs.get(id).await.unwrap().unwrap().url, "https://feeds.example.com/rss?a=1&b=2");

        for spelling in [
            "https://feeds.example.com/rss?a=1&b=2#top",
            "HTTPS://FEEDS.EXAMPLE.COM/rss?b=2&a=1&utm_source=newsletter",
            "  https://feeds.example.com:443/rss?a=1&b=2 ",
        ] {
            let err = subs.register(&feed(spelling)).await.unwrap_err();
            assert!(matches!(err, IngestionError::DuplicateSource(_)), "{spelling}");
        }

        // path case is significant
        assert!(subs.register(&feed("https://feeds.example.com/RSS")).await.is_ok());
    }

    #[tokio::test]
    async fn test_register_rejects_same_channel_under_another_url() {
        let (subs, _) = stores().await;
        subs.register(&feed("https://www.youtube.com/@SomeCreator"))
            .await
            .unwrap();

        let err = subs
            .register(&feed("https://m.youtube.com/c/SomeCreator/videos"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::DuplicateSource(_)));
        assert_eq!(subs.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_unparseable_url() {
        let (subs, _) = stores().await;
        let err = subs.register(&feed("not a url")).await.unwrap_err();
        assert!(matches!(err, IngestionError::InvalidUrl(_)));
        assert!(subs.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_due_orders_never_attempted_first() {
        let (subs, _) = stores().await;
        let now = Utc::now();

        let a = subs.register(&feed("https://a.example/rss")).await.unwrap();
        let b = subs.register(&feed("https://b.example/rss")).await.unwrap();
        let c = subs.register(&feed("https://c.example/rss")).await.unwrap();
        let d = subs.register(&feed("https://d.example/rss")).await.unwrap();

        let ok = FetchOutcome::success(0, 0);
        subs.mark_attempt(a, &ok, now, Some(now - Duration::minutes(5))).await.unwrap();
        subs.mark_attempt(b, &ok, now, Some(now - Duration::minutes(30))).await.unwrap();
        subs.mark_attempt(d, &ok, now, Some(now + Duration::minutes(30))).await.unwrap();

        let due: Vec<SubscriptionId> = subs.get_due(now).await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(due, vec![c, b, a]);
    }

    #[tokio::test]
    async fn test_disabled_never_due() {
        let (subs, _) = stores().await;
        let id = subs.register(&feed("https://a.example/rss")).await.unwrap();
        subs.disable(id, "operator request").await.unwrap();

        assert!(subs.get_due(Utc::now()).await.unwrap().is_empty());

        let sub = subs.get(id).await.unwrap().unwrap();
        assert!(!sub.enabled);
        assert_eq!(sub.last_error.as_deref(), Some("operator request"));
    }

    #[tokio::test]
    async fn test_mark_attempt_counts_and_resets_failures() {
        let (subs, _) = stores().await;
        let id = subs.register(&feed("https://a.example/rss")).await.unwrap();
        let now = Utc::now();

        let failure = FetchOutcome::TransientFailure { reason: "HTTP 503".to_string() };
        subs.mark_attempt(id, &failure, now, None).await.unwrap();
        let updated = subs.mark_attempt(id, &failure, now, None).await.unwrap();
        assert_eq!(updated.consecutive_failures, 2);
        assert_eq!(updated.last_error.as_deref(), Some("HTTP 503"));

        let next = now + Duration::hours(1);
        let updated = subs
            .mark_attempt(id, &FetchOutcome::success(4, 2), now, Some(next))
            .await
            .unwrap();
        assert_eq!(updated.consecutive_failures, 0);
        assert!(updated.last_error.is_none());
        assert_eq!(updated.next_due.unwrap().timestamp_millis(), next.timestamp_millis());
        assert_eq!(updated.last_checked.unwrap().timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_not_lost() {
        let (subs, _) = stores().await;
        let id = subs.register(&feed("https://a.example/rss")).await.unwrap();
        let failure = FetchOutcome::TransientFailure { reason: "timeout".to_string() };

        let mut handles = Vec::new();
        for _ in 0..8 {
            let subs = subs.clone();
            let failure = failure.clone();
            handles.push(tokio::spawn(async move {
                subs.mark_attempt(id, &failure, Utc::now(), None).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(subs.get(id).await.unwrap().unwrap().consecutive_failures, 8);
    }

    #[tokio::test]
    async fn test_enable_resets_failures() {
        let (subs, _) = stores().await;
        let id = subs.register(&feed("https://a.example/rss")).await.unwrap();
        let failure = FetchOutcome::PermanentFailure { reason: "HTTP 404".to_string() };
        subs.mark_attempt(id, &failure, Utc::now(), None).await.unwrap();
        subs.disable(id, "auto-disabled").await.unwrap();

        subs.enable(id).await.unwrap();
        let sub = subs.get(id).await.unwrap().unwrap();
        assert!(sub.enabled);
        assert_eq!(sub.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_unknown_subscription() {
        let (subs, _) = stores().await;
        assert!(matches!(
            subs.enable(42).await,
            Err(IngestionError::SubscriptionNotFound(42))
        ));
        assert!(matches!(
            subs.mark_attempt(42, &FetchOutcome::success(0, 0), Utc::now(), None).await,
            Err(IngestionError::SubscriptionNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_item_insert_is_idempotent() {
        let (subs, items) = stores().await;
        let id = subs.register(&feed("https://a.example/rss")).await.unwrap();
        let item = NewItem::from_raw(id, &RawItem::new("Hello").with_external_id("guid-1"));

        assert!(items.insert(&item).await.unwrap());
        assert!(!items.insert(&item).await.unwrap());
        assert_eq!(items.count_for_subscription(id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_changed_content_keeps_identity_and_discovery_time() {
        let (subs, items) = stores().await;
        let id = subs.register(&feed("https://a.example/rss")).await.unwrap();

        let v1 = NewItem::from_raw(id, &RawItem::new("Hello").with_external_id("guid-1"));
        items.insert(&v1).await.unwrap();
        let first = items.recent(id, 10).await.unwrap().remove(0);

        let v2 = NewItem::from_raw(
            id,
            &RawItem::new("Hello, edited").with_external_id("guid-1"),
        );
        assert!(!items.insert(&v2).await.unwrap());

        let stored = items.recent(id, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, "Hello");
        assert_eq!(stored[0].discovered_at, first.discovered_at);
    }

    #[tokio::test]
    async fn test_existing_keys_batched_lookup() {
        let (subs, items) = stores().await;
        let a = subs.register(&feed("https://a.example/rss")).await.unwrap();
        let b = subs.register(&feed("https://b.example/rss")).await.unwrap();

        for n in 0..1200 {
            let raw = RawItem::new(format!("item {n}")).with_external_id(format!("k{n}"));
            items.insert(&NewItem::from_raw(a, &raw)).await.unwrap();
        }
        let other = RawItem::new("other").with_external_id("k5000");
        items.insert(&NewItem::from_raw(b, &other)).await.unwrap();

        let keys: Vec<String> = (1100..1300).map(|n| format!("k{n}")).chain(["k5000".to_string()]).collect();
        let existing = items.existing_keys(a, &keys).await.unwrap();

        assert_eq!(existing.len(), 100);
        assert!(existing.contains("k1199"));
        assert!(!existing.contains("k1200"));
        assert!(!existing.contains("k5000"));
    }

    #[tokio::test]
    async fn test_discovered_at_is_monotonic_per_subscription() {
        let (subs, items) = stores().await;
        let id = subs.register(&feed("https://a.example/rss")).await.unwrap();

        for n in 0..20 {
            let raw = RawItem::new(format!("item {n}")).with_external_id(format!("g{n}"));
            items.insert(&NewItem::from_raw(id, &raw)).await.unwrap();
        }

        let mut stored = items.recent(id, 100).await.unwrap();
        stored.sort_by_key(|i| i.id);
        assert!(stored.windows(2).all(|w| w[0].discovered_at <= w[1].discovered_at));
    }

    #[tokio::test]
    async fn test_counts_and_failing() {
        let (subs, items) = stores().await;
        let a = subs.register(&feed("https://a.example/rss")).await.unwrap();
        let b = subs.register(&feed("https://b.example/rss")).await.unwrap();
        subs.disable(b, "auto-disabled after 10 consecutive failures").await.unwrap();

        let failure = FetchOutcome::TransientFailure { reason: "HTTP 500".to_string() };
        for _ in 0..3 {
            subs.mark_attempt(a, &failure, Utc::now(), None).await.unwrap();
        }

        assert_eq!(subs.counts().await.unwrap(), (2, 1));

        let failing: Vec<SubscriptionId> = subs.failing(3).await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(failing, vec![a, b]);
        assert_eq!(subs.failing(5).await.unwrap().len(), 1);

        let raw = RawItem::new("x").with_external_id("x");
        items.insert(&NewItem::from_raw(a, &raw)).await.unwrap();
        let hour_ago = Utc::now() - Duration::hours(1);
        assert_eq!(items.count_discovered_since(hour_ago).await.unwrap(), 1);
        assert_eq!(
            items.count_discovered_since(Utc::now() + Duration::hours(1)).await.unwrap(),
            0
        );
    }
}
