//! Scheduler
//!
//! Wakes on a fixed tick, asks the subscription store what is due and hands
//! it to the worker pool. It never fetches anything itself.
//!
//! Persisted `next_due` values are authoritative across restarts: anything
//! that became due while the process was down fires once on the first tick.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{IngestionError, Result};
use crate::failure::{DisableCause, INVALID_SCHEDULE};
use crate::metrics;
use crate::pipeline::WorkerPool;
use crate::schedule;
use crate::schemas::{Subscription, SubscriptionId};
use crate::storage::SubscriptionStore;

/// Summary of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub dispatched: usize,
    pub skipped_in_flight: usize,
    pub invalid_schedule: usize,
}

pub struct Scheduler {
    subscriptions: Arc<dyn SubscriptionStore>,
    pool: Arc<WorkerPool>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        pool: Arc<WorkerPool>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            subscriptions,
            pool,
            tick_interval,
        }
    }

    /// Dispatches everything due at `now`. Subscriptions whose schedule does
    /// not parse, or never fires, are disabled instead of dispatched.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        metrics::record_tick();
        let due = self.subscriptions.get_due(now).await?;
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };

        if due.is_empty() {
            debug!("Nothing due");
            return Ok(report);
        }

        let mut runnable = Vec::with_capacity(due.len());
        for subscription in due {
            if self.pool.is_in_flight(subscription.id) {
                report.skipped_in_flight += 1;
                continue;
            }
            if schedule::next_due(&subscription.schedule, now).is_err() {
                self.disable_invalid(&subscription).await;
                report.invalid_schedule += 1;
                continue;
            }
            runnable.push(subscription);
        }

        let submitted = self.pool.submit(runnable);
        report.dispatched = submitted.accepted;
        report.skipped_in_flight += submitted.skipped_in_flight;

        metrics::record_dispatch("dispatched", report.dispatched);
        metrics::record_dispatch("skipped_in_flight", report.skipped_in_flight);
        metrics::record_dispatch("invalid_schedule", report.invalid_schedule);

        info!(
            due = report.due,
            dispatched = report.dispatched,
            skipped = report.skipped_in_flight,
            invalid = report.invalid_schedule,
            "Tick complete"
        );
        Ok(report)
    }

    async fn disable_invalid(&self, subscription: &Subscription) {
        warn!(
            subscription_id = subscription.id,
            schedule = %subscription.schedule,
            "Invalid schedule, disabling subscription"
        );
        match self.subscriptions.disable(subscription.id, INVALID_SCHEDULE).await {
            Ok(()) => metrics::record_auto_disable(DisableCause::InvalidSchedule.label()),
            Err(e) => {
                metrics::record_storage_error("disable");
                error!(subscription_id = subscription.id, error = %e, "Failed to disable subscription");
            }
        }
    }

    /// Ticks until a shutdown signal arrives. A failed tick is logged and
    /// retried on the next one.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.tick_interval.as_secs_f64(),
            "Scheduler started"
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }
}

/// Changes a subscription's schedule and recomputes `next_due` from its last
/// check (or `now` if it was never checked).
pub async fn reschedule(
    subscriptions: &dyn SubscriptionStore,
    id: SubscriptionId,
    expression: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let subscription = subscriptions
        .get(id)
        .await?
        .ok_or(IngestionError::SubscriptionNotFound(id))?;

    let reference = subscription.last_checked.unwrap_or(now);
    let next = schedule::next_due(expression, reference)?;
    subscriptions.update_schedule(id, expression, Some(next)).await?;

    info!(subscription_id = id, schedule = %expression, next_due = %next, "Subscription rescheduled");
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AttemptHandler;
    use crate::schemas::{FetchOutcome, NewSubscription};
    use crate::storage::{SqliteSubscriptionStore, Storage};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use parking_lot::Mutex;

    /// Records what it was asked to process and marks the attempt
    struct Recorder {
        store: Arc<SqliteSubscriptionStore>,
        seen: Mutex<Vec<SubscriptionId>>,
        delay: Duration,
    }

    #[async_trait]
    impl AttemptHandler for Recorder {
        async fn process(&self, subscription: Subscription) -> FetchOutcome {
            self.seen.lock().push(subscription.id);
            tokio::time::sleep(self.delay).await;
            let outcome = FetchOutcome::success(0, 0);
            let next = Utc::now() + ChronoDuration::hours(1);
            self.store
                .mark_attempt(subscription.id, &outcome, Utc::now(), Some(next))
                .await
                .unwrap();
            outcome
        }
    }

    async fn setup(delay: Duration) -> (Scheduler, Arc<Recorder>, Arc<SqliteSubscriptionStore>) {
        let storage = Storage::in_memory().await.unwrap();
        let store = Arc::new(storage.subscriptions());
        let recorder = Arc::new(Recorder {
            store: store.clone(),
            seen: Mutex::new(Vec::new()),
            delay,
        });
        let pool = Arc::new(WorkerPool::new(recorder.clone(), 4));
        let scheduler = Scheduler::new(store.clone(), pool, Duration::from_secs(60));
        (scheduler, recorder, store)
    }

    #[tokio::test]
    async fn test_tick_dispatches_due_and_skips_in_flight() {
        let (scheduler, recorder, store) = setup(Duration::from_millis(100)).await;
        for i in 0..3 {
            store
                .register(&NewSubscription::new(format!("s{i}"), format!("https://s{i}.example/feed"), "feed", "@hourly"))
                .await
                .unwrap();
        }

        let first = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(first.dispatched, 3);

        // still running; nothing is dispatched twice
        let second = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(second.dispatched, 0);
        assert_eq!(second.skipped_in_flight, 3);

        scheduler.pool.drain().await;
        assert_eq!(recorder.seen.lock().len(), 3);

        // next_due is now an hour out
        let third = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(third.due, 0);
    }

    #[tokio::test]
    async fn test_invalid_schedule_is_disabled_without_blocking_others() {
        let (scheduler, recorder, store) = setup(Duration::from_millis(1)).await;
        let bad = store
            .register(&NewSubscription::new("bad", "https://bad.example/feed", "feed", "whenever"))
            .await
            .unwrap();
        let good = store
            .register(&NewSubscription::new("good", "https://good.example/feed", "feed", "@hourly"))
            .await
            .unwrap();

        let report = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(report.invalid_schedule, 1);
        assert_eq!(report.dispatched, 1);
        scheduler.pool.drain().await;

        let disabled = store.get(bad).await.unwrap().unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.last_error.as_deref(), Some(INVALID_SCHEDULE));
        assert_eq!(*recorder.seen.lock(), vec![good]);
    }

    #[tokio::test]
    async fn test_never_firing_schedule_is_disabled_before_fetch() {
        let (scheduler, recorder, store) = setup(Duration::from_millis(1)).await;
        let id = store
            .register(&NewSubscription::new("feb31", "https://feb.example/feed", "feed", "0 0 31 2 *"))
            .await
            .unwrap();

        let report = scheduler.tick(Utc::now()).await.unwrap();
        scheduler.pool.drain().await;

        assert_eq!(report.due, 1);
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.invalid_schedule, 1);
        assert!(recorder.seen.lock().is_empty());

        let disabled = store.get(id).await.unwrap().unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.last_error.as_deref(), Some(INVALID_SCHEDULE));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (scheduler, _recorder, _store) = setup(Duration::from_millis(1)).await;
        let (tx, rx) = broadcast::channel(1);

        let scheduler = Arc::new(scheduler);
        let running = scheduler.clone();
        let handle = tokio::spawn(async move { running.run(rx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reschedule_uses_last_checked() {
        let storage = Storage::in_memory().await.unwrap();
        let store = storage.subscriptions();
        let id = store
            .register(&NewSubscription::new("s", "https://s.example/feed", "feed", "@daily"))
            .await
            .unwrap();

        let checked = Utc.with_ymd_and_hms(2024, 4, 1, 10, 0, 0).unwrap();
        store
            .mark_attempt(id, &FetchOutcome::success(0, 0), checked, None)
            .await
            .unwrap();

        let now = checked + ChronoDuration::minutes(5);
        let next = reschedule(&store, id, "@every 30m", now).await.unwrap();
        assert_eq!(next, checked + ChronoDuration::minutes(30));

        let updated = store.get(id).await.unwrap().unwrap();
        assert_eq!(updated.schedule, "@every 30m");
        assert_eq!(updated.next_due, Some(next));

        assert!(matches!(
            reschedule(&store, id, "bogus", now).await,
            Err(IngestionError::InvalidSchedule { .. })
        ));
        assert!(matches!(
            reschedule(&store, 999, "@hourly", now).await,
            Err(IngestionError::SubscriptionNotFound(999))
        ));
    }
}
