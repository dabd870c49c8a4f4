//! Worker Pool Implementation
//!
//! Runs subscription attempts with two guarantees:
//! - At most `max_concurrency` attempts execute at once, system-wide
//! - At most one attempt per subscription id is queued or running
//!
//! Supports draining (wait for everything submitted) and graceful shutdown
//! with a grace period followed by forced cancellation.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use super::AttemptHandler;
use crate::metrics;
use crate::schemas::{Subscription, SubscriptionId};

/// Result of handing a batch to the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitReport {
    pub accepted: usize,
    pub skipped_in_flight: usize,
    pub rejected_shutdown: usize,
}

/// Removes a subscription from the in-flight set when its task ends,
/// whether it completed, panicked or was cancelled.
struct InFlightGuard {
    id: SubscriptionId,
    in_flight: Arc<Mutex<HashSet<SubscriptionId>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.id);
    }
}

struct ActiveGuard;

impl ActiveGuard {
    fn new() -> Self {
        metrics::inc_active_fetches();
        Self
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        metrics::dec_active_fetches();
    }
}

// ============================================
// WORKER POOL
// ============================================

pub struct WorkerPool {
    handler: Arc<dyn AttemptHandler>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<SubscriptionId>>>,
    tasks: Mutex<JoinSet<()>>,
    accepting: AtomicBool,
}

impl WorkerPool {
    pub fn new(handler: Arc<dyn AttemptHandler>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        info!(workers = max_concurrency, "Starting worker pool");

        Self {
            handler,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: Mutex::new(JoinSet::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Whether an attempt for `id` is queued or running
    pub fn is_in_flight(&self, id: SubscriptionId) -> bool {
        self.in_flight.lock().contains(&id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Queues an attempt for every subscription not already in flight.
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, subscriptions: Vec<Subscription>) -> SubmitReport {
        let mut report = SubmitReport::default();
        let mut tasks = self.tasks.lock();
        self.reap(&mut tasks);

        for subscription in subscriptions {
            if !self.accepting.load(Ordering::SeqCst) {
                report.rejected_shutdown += 1;
                continue;
            }

            let id = subscription.id;
            if !self.in_flight.lock().insert(id) {
                debug!(subscription_id = id, "Already in flight, skipping");
                report.skipped_in_flight += 1;
                continue;
            }

            let guard = InFlightGuard {
                id,
                in_flight: self.in_flight.clone(),
            };
            let semaphore = self.semaphore.clone();
            let handler = self.handler.clone();

            tasks.spawn(
                async move {
                    let _guard = guard;
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Worker pool closed before attempt could start");
                            return;
                        }
                    };
                    let _active = ActiveGuard::new();
                    handler.process(subscription).await;
                }
                .instrument(tracing::debug_span!("worker", subscription_id = id)),
            );
            report.accepted += 1;
        }

        report
    }

    /// Collects finished tasks, surfacing panics.
    fn reap(&self, tasks: &mut JoinSet<()>) {
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Worker task panicked");
                }
            }
        }
    }

    fn take_tasks(&self) -> JoinSet<()> {
        std::mem::take(&mut *self.tasks.lock())
    }

    /// Waits until every submitted attempt has finished.
    pub async fn drain(&self) {
        loop {
            let mut tasks = self.take_tasks();
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!(error = %e, "Worker task panicked");
                    }
                }
            }
        }
    }

    /// Stops accepting work, lets in-flight attempts finish within `grace`,
    /// then cancels whatever is left. Returns the number of cancelled tasks.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.accepting.store(false, Ordering::SeqCst);
        let mut tasks = self.take_tasks();
        info!(
            pending = tasks.len(),
            grace_secs = grace.as_secs(),
            "Worker pool shutting down"
        );

        let finished = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        let cancelled = if finished.is_err() {
            let remaining = tasks.len();
            warn!(remaining = remaining, "Grace period elapsed, cancelling attempts");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            remaining
        } else {
            0
        };

        self.semaphore.close();
        info!(cancelled = cancelled, "Worker pool stopped");
        cancelled
    }
}
