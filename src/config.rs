//! Configuration for the Ingestion Engine
//!
//! Layered: built-in defaults, then an optional TOML file, then environment
//! variables (`.env` is loaded first). Environment keys are the upper-case
//! field names, e.g. `MAX_CONCURRENT_FETCHES=8`.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{IngestionError, Result};
use crate::executor::RetryPolicy;
use crate::failure::FailurePolicy;
use crate::rate_limiter::RateLimitConfig;
use crate::sources::HttpFetcherConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Database
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    // Concurrency
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    // Rate limiting (per domain)
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: u32,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_burst: u32,
    #[serde(default = "default_rate_limiter_gc")]
    pub rate_limiter_gc_secs: u64,

    // HTTP
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    // Retry within one attempt
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_max_elapsed")]
    pub retry_max_elapsed_secs: u64,

    // Auto-disable
    #[serde(default = "default_failure_threshold")]
    pub failure_disable_threshold: u32,
    #[serde(default = "default_permanent_failure_threshold")]
    pub permanent_failure_disable_threshold: u32,

    // Lifecycle
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_metrics_report_interval")]
    pub metrics_report_interval_secs: u64,
}

fn default_database_url() -> String {
    "sqlite://./data/ingestion.db".to_string()
}

fn default_db_max_connections() -> u32 {
    5
}

fn default_max_concurrent_fetches() -> usize {
    5
}

fn default_tick_interval() -> u64 {
    60
}

fn default_rate_limit() -> u32 {
    10
}

fn default_rate_limiter_gc() -> u64 {
    600
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("content-ingestion/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_retry_initial_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    30_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_max_elapsed() -> u64 {
    120 // 2 minutes
}

fn default_failure_threshold() -> u32 {
    10
}

fn default_permanent_failure_threshold() -> u32 {
    3
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_metrics_report_interval() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            tick_interval_secs: default_tick_interval(),
            rate_limit_per_second: default_rate_limit(),
            rate_limit_burst: default_rate_limit(),
            rate_limiter_gc_secs: default_rate_limiter_gc(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            user_agent: default_user_agent(),
            max_body_bytes: default_max_body_bytes(),
            retry_initial_delay_ms: default_retry_initial_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_max_elapsed_secs: default_retry_max_elapsed(),
            failure_disable_threshold: default_failure_threshold(),
            permanent_failure_disable_threshold: default_permanent_failure_threshold(),
            shutdown_grace_secs: default_shutdown_grace(),
            metrics_report_interval_secs: default_metrics_report_interval(),
        }
    }
}

impl Config {
    pub fn load(file: Option<&Path>) -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_fetches == 0 {
            return Err(IngestionError::InvalidConfig(
                "max_concurrent_fetches must be at least 1".into(),
            ));
        }
        if self.tick_interval_secs == 0 {
            return Err(IngestionError::InvalidConfig(
                "tick_interval_secs must be at least 1".into(),
            ));
        }
        if self.rate_limit_per_second == 0 || self.rate_limit_burst == 0 {
            return Err(IngestionError::InvalidConfig(
                "rate limits must be positive".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(IngestionError::InvalidConfig(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        if self.max_body_bytes == 0 {
            return Err(IngestionError::InvalidConfig(
                "max_body_bytes must be positive".into(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(IngestionError::InvalidConfig(
                "retry_max_attempts must be at least 1".into(),
            ));
        }
        if self.retry_multiplier < 1.0 {
            return Err(IngestionError::InvalidConfig(
                "retry_multiplier must be >= 1.0".into(),
            ));
        }
        if self.failure_disable_threshold == 0 || self.permanent_failure_disable_threshold == 0 {
            return Err(IngestionError::InvalidConfig(
                "failure thresholds must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn rate_limiter_gc_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limiter_gc_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: self.retry_multiplier,
            max_attempts: self.retry_max_attempts,
            max_elapsed: Duration::from_secs(self.retry_max_elapsed_secs),
            ..RetryPolicy::default()
        }
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            per_second: self.rate_limit_per_second,
            burst: self.rate_limit_burst,
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy {
            disable_after_failures: self.failure_disable_threshold,
            disable_after_permanent: self.permanent_failure_disable_threshold,
        }
    }

    pub fn fetcher(&self) -> HttpFetcherConfig {
        HttpFetcherConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            user_agent: self.user_agent.clone(),
            max_body_bytes: self.max_body_bytes,
        }
    }
}
