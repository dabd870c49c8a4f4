//! Fetch Executor
//!
//! Performs one attempt against a subscription's source:
//! - A rate-limit token for the source domain before every network call
//! - A hard timeout per network call; the call is cancelled on expiry
//! - Bounded exponential backoff with jitter between transient failures
//! - Permanent failures (4xx, unparseable bodies) return immediately
//! - Parsing runs on the blocking pool so large bodies never stall a worker
//!
//! The executor never touches storage.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::error::FetchError;
use crate::metrics;
use crate::rate_limiter::DomainRateLimiter;
use crate::schemas::{RawItem, Subscription};
use crate::sources::{Fetcher, ParserRegistry};

/// Retry budget for a single attempt
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Total network calls, the first one included
    pub max_attempts: u32,
    /// Upper bound on time spent inside one attempt
    pub max_elapsed: Duration,
    pub randomization_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
            max_elapsed: Duration::from_secs(120),
            randomization_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Creates an exponential backoff with jitter
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }
}

pub struct FetchExecutor {
    fetcher: Arc<dyn Fetcher>,
    parsers: ParserRegistry,
    rate_limiter: Arc<DomainRateLimiter>,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl FetchExecutor {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        parsers: ParserRegistry,
        rate_limiter: Arc<DomainRateLimiter>,
        policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            parsers,
            rate_limiter,
            policy,
            request_timeout,
        }
    }

    /// Fetches and parses the subscription's source, retrying transient
    /// failures within the policy's budget.
    #[instrument(skip(self, subscription), fields(subscription_id = subscription.id, url = %subscription.url))]
    pub async fn fetch(&self, subscription: &Subscription) -> Result<Vec<RawItem>, FetchError> {
        let domain = subscription.domain();
        let parser = self.parsers.for_kind(&subscription.kind);
        let mut backoff = self.policy.backoff();
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.rate_limiter.acquire(&domain).await;

            let result = match tokio::time::timeout(
                self.request_timeout,
                self.fetcher.fetch(&subscription.url, self.request_timeout),
            )
            .await
            {
                Ok(fetched) => fetched,
                Err(_) => Err(FetchError::transient(format!(
                    "timeout after {}s",
                    self.request_timeout.as_secs_f64()
                ))),
            };

            let error = match result {
                Ok(body) => {
                    let parser = parser.clone();
                    let items = tokio::task::spawn_blocking(move || parser.parse(&body))
                        .await
                        .map_err(|e| FetchError::permanent(format!("parser aborted: {e}")))??;
                    debug!(attempt = attempt, items = items.len(), "Fetch succeeded");
                    return Ok(items);
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                debug!(attempt = attempt, error = %error, "Permanent fetch failure");
                return Err(error);
            }

            if attempt >= self.policy.max_attempts {
                warn!(attempt = attempt, error = %error, "Retry budget exhausted");
                return Err(error);
            }

            let delay = match backoff.next_backoff() {
                Some(delay) if started.elapsed() + delay <= self.policy.max_elapsed => delay,
                _ => {
                    warn!(attempt = attempt, error = %error, "Retry time budget exhausted");
                    return Err(error);
                }
            };

            warn!(
                attempt = attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient fetch failure, will retry"
            );
            metrics::record_retry();
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseError;
    use crate::rate_limiter::RateLimitConfig;
    use crate::sources::FeedParser;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a scripted sequence of responses
    struct Scripted {
        responses: Mutex<VecDeque<Result<Vec<u8>, FetchError>>>,
        calls: Mutex<u32>,
        delay: Option<Duration>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<Vec<u8>, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
                delay: None,
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl Fetcher for Scripted {
        async fn fetch(&self, _url: &str, _timeout: Duration) -> Result<Vec<u8>, FetchError> {
            *self.calls.lock() += 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::transient("exhausted")))
        }
    }

    /// One item per line of the body
    struct Lines;

    impl FeedParser for Lines {
        fn parse(&self, body: &[u8]) -> Result<Vec<RawItem>, ParseError> {
            let text = std::str::from_utf8(body).map_err(|e| ParseError(e.to_string()))?;
            if text == "garbage" {
                return Err(ParseError("not a feed".to_string()));
            }
            if text == "boom" {
                panic!("parser bug");
            }
            Ok(text.lines().map(RawItem::new).collect())
        }
    }

    fn subscription() -> Subscription {
        Subscription {
            id: 1,
            name: "test".to_string(),
            url: "https://feeds.example.com/rss".to_string(),
            kind: "feed".to_string(),
            schedule: "@hourly".to_string(),
            last_checked: None,
            next_due: None,
            enabled: true,
            consecutive_failures: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts,
            ..RetryPolicy::default()
        }
    }

    fn executor(fetcher: Arc<Scripted>, policy: RetryPolicy, timeout: Duration) -> FetchExecutor {
        FetchExecutor::new(
            fetcher,
            ParserRegistry::new(Arc::new(Lines)),
            Arc::new(DomainRateLimiter::new(RateLimitConfig {
                per_second: 1000,
                burst: 1000,
            })),
            policy,
            timeout,
        )
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let fetcher = Arc::new(Scripted::new(vec![
            Err(FetchError::transient("HTTP 503")),
            Err(FetchError::transient("HTTP 503")),
            Ok(b"a\nb".to_vec()),
        ]));
        let exec = executor(fetcher.clone(), fast_policy(5), Duration::from_secs(1));

        let items = exec.fetch(&subscription()).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let fetcher = Arc::new(Scripted::new(vec![Err(FetchError::permanent("HTTP 404"))]));
        let exec = executor(fetcher.clone(), fast_policy(5), Duration::from_secs(1));

        let err = exec.fetch(&subscription()).await.unwrap_err();
        assert_eq!(err, FetchError::permanent("HTTP 404"));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_parse_failure_is_permanent() {
        let fetcher = Arc::new(Scripted::new(vec![Ok(b"garbage".to_vec())]));
        let exec = executor(fetcher.clone(), fast_policy(5), Duration::from_secs(1));

        let err = exec.fetch(&subscription()).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let fetcher = Arc::new(Scripted::new(vec![]));
        let exec = executor(fetcher.clone(), fast_policy(3), Duration::from_secs(1));

        let err = exec.fetch(&subscription()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_slow_fetch_times_out() {
        let fetcher = Arc::new(Scripted {
            delay: Some(Duration::from_secs(5)),
            ..Scripted::new(vec![Ok(b"late".to_vec())])
        });
        let exec = executor(fetcher.clone(), RetryPolicy::no_retry(), Duration::from_millis(50));

        let started = Instant::now();
        let err = exec.fetch(&subscription()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.message().contains("timeout"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_panicking_parser_is_permanent() {
        let fetcher = Arc::new(Scripted::new(vec![Ok(b"boom".to_vec())]));
        let exec = executor(fetcher.clone(), fast_policy(5), Duration::from_secs(1));

        let err = exec.fetch(&subscription()).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().starts_with("parser aborted"));
        assert_eq!(fetcher.calls(), 1);
    }
}
