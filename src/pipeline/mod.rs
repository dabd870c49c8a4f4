//! Subscription Attempt Pipeline
//!
//! Implements one attempt for one subscription:
//! fetch → deduplicate → store → record outcome
//!
//! Features:
//! - Items are stored independently; one failed insert never loses the others
//! - Every attempt ends with exactly one `mark_attempt` on the subscription
//! - Auto-disable decisions come from the failure policy
//! - Prometheus metrics per stage
//!
//! Concurrency limits live in [`worker::WorkerPool`].

pub mod worker;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::dedup::Deduplicator;
use crate::executor::FetchExecutor;
use crate::failure::FailureManager;
use crate::metrics::{self, StageTimer, STAGE_ATTEMPT, STAGE_DEDUP, STAGE_FETCH, STAGE_STORE};
use crate::schemas::{FetchOutcome, NewItem, RawItem, Subscription};
use crate::storage::{ItemStore, SubscriptionStore};

pub use worker::{SubmitReport, WorkerPool};

/// Runs a complete attempt for a subscription and reports how it went.
///
/// The worker pool only sees this trait, which keeps concurrency tests free
/// of network and storage.
#[async_trait]
pub trait AttemptHandler: Send + Sync {
    async fn process(&self, subscription: Subscription) -> FetchOutcome;
}

pub struct SubscriptionProcessor {
    executor: Arc<FetchExecutor>,
    dedup: Deduplicator,
    items: Arc<dyn ItemStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    failures: FailureManager,
}

impl SubscriptionProcessor {
    pub fn new(
        executor: Arc<FetchExecutor>,
        items: Arc<dyn ItemStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        failures: FailureManager,
    ) -> Self {
        Self {
            executor,
            dedup: Deduplicator::new(items.clone()),
            items,
            subscriptions,
            failures,
        }
    }

    /// Fetch, filter and store. Never touches the subscription row.
    async fn ingest(&self, subscription: &Subscription) -> FetchOutcome {
        let fetched = crate::time_stage!(STAGE_FETCH, self.executor.fetch(subscription).await);
        let candidates = match fetched {
            Ok(items) => items,
            Err(e) => return e.into(),
        };
        let found = candidates.len();

        let fresh = {
            let _timer = StageTimer::new(STAGE_DEDUP);
            match self.dedup.filter_new(subscription.id, candidates).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    metrics::record_storage_error("existing_keys");
                    return FetchOutcome::TransientFailure {
                        reason: format!("storage error: {e}"),
                    };
                }
            }
        };

        let _timer = StageTimer::new(STAGE_STORE);
        let (stored, failed) = self.store_items(subscription, &fresh).await;
        metrics::record_items(found, fresh.len(), stored);

        if failed > 0 && stored == 0 {
            return FetchOutcome::TransientFailure {
                reason: format!("storage error: {failed} items could not be stored"),
            };
        }
        if failed > 0 {
            warn!(
                subscription_id = subscription.id,
                stored = stored,
                failed = failed,
                "Some items failed to store, they will be retried on the next attempt"
            );
        }

        FetchOutcome::success(found, stored)
    }

    async fn store_items(&self, subscription: &Subscription, fresh: &[RawItem]) -> (usize, usize) {
        let mut stored = 0;
        let mut failed = 0;

        for raw in fresh {
            let item = NewItem::from_raw(subscription.id, raw);
            match self.items.insert(&item).await {
                Ok(true) => stored += 1,
                Ok(false) => {
                    debug!(external_id = %item.external_id, "Item appeared concurrently, skipped");
                }
                Err(e) => {
                    failed += 1;
                    metrics::record_storage_error("insert");
                    error!(
                        subscription_id = subscription.id,
                        external_id = %item.external_id,
                        error = %e,
                        "Failed to store item"
                    );
                }
            }
        }

        (stored, failed)
    }

    /// Persists the attempt, then applies the failure policy to the row the
    /// store returned.
    async fn record(&self, subscription: &Subscription, outcome: &FetchOutcome) {
        let now = Utc::now();
        let next_due = self.failures.next_due(subscription, now);

        let recorded = match self
            .subscriptions
            .mark_attempt(subscription.id, outcome, now, next_due)
            .await
        {
            Ok(recorded) => recorded,
            Err(e) => {
                metrics::record_storage_error("mark_attempt");
                error!(subscription_id = subscription.id, error = %e, "Failed to record attempt");
                return;
            }
        };

        let Some(disable) = self.failures.record_outcome(&recorded, outcome).disable else {
            return;
        };
        match self.subscriptions.disable(subscription.id, &disable.reason).await {
            Ok(()) => {
                metrics::record_auto_disable(disable.cause.label());
                warn!(subscription_id = subscription.id, reason = %disable.reason, "Subscription auto-disabled");
            }
            Err(e) => {
                metrics::record_storage_error("disable");
                error!(subscription_id = subscription.id, error = %e, "Failed to disable subscription");
            }
        }
    }
}

#[async_trait]
impl AttemptHandler for SubscriptionProcessor {
    #[instrument(skip(self, subscription), fields(subscription_id = subscription.id))]
    async fn process(&self, subscription: Subscription) -> FetchOutcome {
        let _timer = StageTimer::new(STAGE_ATTEMPT);

        let outcome = self.ingest(&subscription).await;
        self.record(&subscription, &outcome).await;
        metrics::record_attempt(outcome.label());

        match &outcome {
            FetchOutcome::Success { items_found, items_new } => info!(
                name = %subscription.name,
                found = items_found,
                new = items_new,
                "Attempt succeeded"
            ),
            other => warn!(
                name = %subscription.name,
                outcome = other.label(),
                error = other.error_message().unwrap_or_default(),
                "Attempt failed"
            ),
        }

        outcome
    }
}
