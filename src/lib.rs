//! Content Ingestion Engine
//!
//! Continuously polls registered subscriptions (feeds, channels, periodic
//! sources) on their schedules, fetches new items, deduplicates them and
//! persists them.
//!
//! Features:
//! - Cron-like and interval schedules, evaluated in UTC
//! - Bounded worker pool, at most one attempt per subscription at a time
//! - Per-domain token-bucket rate limiting
//! - Exponential backoff with jitter inside an attempt
//! - Auto-disable after repeated failures
//! - SQLite persistence; restart picks up from stored schedules
//! - Prometheus metrics and structured tracing

pub mod config;
pub mod dedup;
pub mod error;
pub mod executor;
pub mod failure;
pub mod harvester;
pub mod metrics;
pub mod pipeline;
pub mod rate_limiter;
pub mod schedule;
pub mod scheduler;
pub mod schemas;
pub mod sources;
pub mod status;
pub mod storage;

pub use config::Config;
pub use error::{FetchError, IngestionError, ParseError, Result};
pub use harvester::Harvester;
