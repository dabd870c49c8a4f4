//! Main harvester orchestration
//!
//! Wires the engine together from a [`Config`]:
//! - SQLite-backed subscription and item stores
//! - Per-domain rate limiter with periodic bucket collection
//! - Fetch executor, deduplicator and failure policy behind a worker pool
//! - Scheduler ticking until a shutdown signal
//! - Graceful shutdown with a grace period for in-flight attempts

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::error::Result;
use crate::executor::FetchExecutor;
use crate::failure::FailureManager;
use crate::metrics::{self, MetricsReporter};
use crate::pipeline::{SubscriptionProcessor, WorkerPool};
use crate::rate_limiter::DomainRateLimiter;
use crate::scheduler::{Scheduler, TickReport};
use crate::sources::{Fetcher, HttpFetcher, ParserRegistry};
use crate::storage::{ItemStore, Storage, SubscriptionStore};

pub struct Harvester {
    config: Config,
    storage: Storage,
    subscriptions: Arc<dyn SubscriptionStore>,
    items: Arc<dyn ItemStore>,
    rate_limiter: Arc<DomainRateLimiter>,
    pool: Arc<WorkerPool>,
    scheduler: Scheduler,
}

impl Harvester {
    /// Opens the configured database and builds the engine with the HTTP
    /// fetcher and the default parser registry.
    #[instrument(skip(config), fields(correlation_id = %correlation_id))]
    pub async fn new(config: Config, correlation_id: String) -> Result<Self> {
        info!("Initializing harvester...");

        let storage = Storage::new(&config.database_url, config.db_max_connections).await?;
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.fetcher())?);

        Ok(Self::with_components(
            config,
            storage,
            fetcher,
            ParserRegistry::default(),
        ))
    }

    /// Builds the engine around caller-provided storage and collaborators.
    pub fn with_components(
        config: Config,
        storage: Storage,
        fetcher: Arc<dyn Fetcher>,
        parsers: ParserRegistry,
    ) -> Self {
        let subscriptions: Arc<dyn SubscriptionStore> = Arc::new(storage.subscriptions());
        let items: Arc<dyn ItemStore> = Arc::new(storage.items());
        let rate_limiter = Arc::new(DomainRateLimiter::new(config.rate_limit()));

        let executor = Arc::new(FetchExecutor::new(
            fetcher,
            parsers,
            rate_limiter.clone(),
            config.retry_policy(),
            config.request_timeout(),
        ));
        let processor = Arc::new(SubscriptionProcessor::new(
            executor,
            items.clone(),
            subscriptions.clone(),
            FailureManager::new(config.failure_policy()),
        ));
        let pool = Arc::new(WorkerPool::new(processor, config.max_concurrent_fetches));
        let scheduler = Scheduler::new(subscriptions.clone(), pool.clone(), config.tick_interval());

        info!(
            max_concurrent = config.max_concurrent_fetches,
            tick_secs = config.tick_interval_secs,
            rate_limit = config.rate_limit_per_second,
            "Harvester initialized"
        );

        Self {
            config,
            storage,
            subscriptions,
            items,
            rate_limiter,
            pool,
            scheduler,
        }
    }

    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionStore> {
        &self.subscriptions
    }

    pub fn items(&self) -> &Arc<dyn ItemStore> {
        &self.items
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Runs the scheduler until `shutdown_rx` fires, then shuts down.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn run_continuous(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("Starting continuous harvesting...");

        let reporter = MetricsReporter::new(self.config.metrics_report_interval_secs);
        let reporter_handle = reporter.start();
        let gc_handle = self.spawn_rate_limiter_gc(shutdown_rx.resubscribe());

        self.scheduler.run(shutdown_rx).await;

        reporter.stop();
        reporter_handle.abort();
        let _ = gc_handle.await;

        self.shutdown().await;
        Ok(())
    }

    /// Runs a single tick and waits for every dispatched attempt.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<TickReport> {
        info!("Running single harvest cycle...");

        let report = self.scheduler.tick(Utc::now()).await?;
        self.pool.drain().await;

        info!(dispatched = report.dispatched, "Harvest cycle complete");
        Ok(report)
    }

    fn spawn_rate_limiter_gc(&self, mut shutdown_rx: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let limiter = self.rate_limiter.clone();
        let period = self.config.rate_limiter_gc_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        limiter.gc();
                        metrics::set_rate_limit_domains(limiter.tracked_domains());
                        debug!(domains = limiter.tracked_domains(), "Rate limiter collected");
                    }
                }
            }
        })
    }

    /// Graceful shutdown
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");

        let cancelled = self.pool.shutdown(self.config.shutdown_grace()).await;
        self.storage.close().await;

        info!(cancelled = cancelled, "Graceful shutdown complete");
    }
}
