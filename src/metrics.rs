//! Prometheus Metrics for the Ingestion Engine
//!
//! Everything registers in the default registry; exposing it over HTTP is
//! left to the embedding process. Metrics include:
//! - fetch attempts by outcome, and retries
//! - items found / new / stored per attempt
//! - storage errors and auto-disables
//! - scheduler ticks and dispatch decisions
//! - latency per stage (histogram)
//! - active fetches and tracked rate-limit domains

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, TextEncoder,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

// ============================================
// METRIC DEFINITIONS
// ============================================

/// Stages of one subscription attempt
pub const STAGE_FETCH: &str = "fetch";
pub const STAGE_DEDUP: &str = "dedup";
pub const STAGE_STORE: &str = "store";
pub const STAGE_ATTEMPT: &str = "attempt";

static FETCH_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_fetch_attempts_total",
        "Completed subscription attempts by outcome",
        &["outcome"]
    )
    .expect("Failed to create fetch_attempts metric")
});

static FETCH_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "ingestion_fetch_retries_total",
        "Network retries performed inside attempts"
    )
    .expect("Failed to create fetch_retries metric")
});

static ITEMS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_items_total",
        "Items seen by the pipeline, by disposition",
        &["disposition"]
    )
    .expect("Failed to create items metric")
});

static STORAGE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_storage_errors_total",
        "Storage operations that failed",
        &["operation"]
    )
    .expect("Failed to create storage_errors metric")
});

static AUTO_DISABLES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_auto_disables_total",
        "Subscriptions disabled by the engine",
        &["reason"]
    )
    .expect("Failed to create auto_disables metric")
});

static SCHEDULER_TICKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("ingestion_scheduler_ticks_total", "Scheduler ticks run")
        .expect("Failed to create scheduler_ticks metric")
});

static DISPATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_dispatches_total",
        "Due subscriptions handled by the scheduler",
        &["result"]
    )
    .expect("Failed to create dispatches metric")
});

// Latency histogram (in seconds)
static STAGE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];
    register_histogram_vec!(
        HistogramOpts::new(
            "ingestion_stage_latency_seconds",
            "Latency of each attempt stage in seconds"
        )
        .buckets(buckets),
        &["stage"]
    )
    .expect("Failed to create stage_latency metric")
});

static ACTIVE_FETCHES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("ingestion_active_fetches", "Attempts currently in flight")
        .expect("Failed to create active_fetches metric")
});

static RATE_LIMIT_DOMAINS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "ingestion_rate_limit_domains",
        "Domains currently holding a token bucket"
    )
    .expect("Failed to create rate_limit_domains metric")
});

// ============================================
// METRICS API
// ============================================

pub fn record_attempt(outcome: &str) {
    FETCH_ATTEMPTS.with_label_values(&[outcome]).inc();
}

pub fn record_retry() {
    FETCH_RETRIES.inc();
}

pub fn record_items(found: usize, new: usize, stored: usize) {
    ITEMS.with_label_values(&["found"]).inc_by(found as u64);
    ITEMS.with_label_values(&["new"]).inc_by(new as u64);
    ITEMS.with_label_values(&["stored"]).inc_by(stored as u64);
}

pub fn record_storage_error(operation: &str) {
    STORAGE_ERRORS.with_label_values(&[operation]).inc();
}

pub fn record_auto_disable(reason: &str) {
    AUTO_DISABLES.with_label_values(&[reason]).inc();
}

pub fn record_tick() {
    SCHEDULER_TICKS.inc();
}

pub fn record_dispatch(result: &str, count: usize) {
    DISPATCHES.with_label_values(&[result]).inc_by(count as u64);
}

pub fn record_stage_latency(stage: &str, latency_secs: f64) {
    STAGE_LATENCY.with_label_values(&[stage]).observe(latency_secs);
}

pub fn inc_active_fetches() {
    ACTIVE_FETCHES.inc();
}

pub fn dec_active_fetches() {
    ACTIVE_FETCHES.dec();
}

pub fn set_rate_limit_domains(count: usize) {
    RATE_LIMIT_DOMAINS.set(count as i64);
}

// ============================================
// METRICS COLLECTION
// ============================================

/// Collects all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

/// A timer for measuring stage latency
pub struct StageTimer {
    stage: &'static str,
    start: std::time::Instant,
}

impl StageTimer {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        record_stage_latency(self.stage, elapsed);
    }
}

/// Macro for timing a stage
#[macro_export]
macro_rules! time_stage {
    ($stage:expr, $block:expr) => {{
        let _timer = $crate::metrics::StageTimer::new($stage);
        $block
    }};
}

// ============================================
// METRICS REPORTER
// ============================================

/// Periodically logs a summary of the counters
pub struct MetricsReporter {
    interval: std::time::Duration,
    running: Arc<AtomicBool>,
}

impl MetricsReporter {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            interval: std::time::Duration::from_secs(interval_secs.max(1)),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Starts the metrics reporter in background
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let interval = self.interval;
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut prev_attempts = 0u64;

            while running.load(Ordering::Relaxed) {
                tokio::time::sleep(interval).await;
                if !running.load(Ordering::Relaxed) {
                    break;
                }

                let attempts: u64 = ["success", "transient", "permanent"]
                    .iter()
                    .map(|o| FETCH_ATTEMPTS.with_label_values(&[o]).get())
                    .sum();
                let rate = (attempts - prev_attempts) as f64 / interval.as_secs_f64();
                prev_attempts = attempts;

                info!(
                    target: "metrics",
                    attempts = attempts,
                    attempts_per_sec = rate,
                    successes = FETCH_ATTEMPTS.with_label_values(&["success"]).get(),
                    transient = FETCH_ATTEMPTS.with_label_values(&["transient"]).get(),
                    permanent = FETCH_ATTEMPTS.with_label_values(&["permanent"]).get(),
                    retries = FETCH_RETRIES.get(),
                    items_stored = ITEMS.with_label_values(&["stored"]).get(),
                    active = ACTIVE_FETCHES.get(),
                    domains = RATE_LIMIT_DOMAINS.get(),
                    "Ingestion metrics"
                );
            }
        })
    }

    /// Stops the reporter
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}
