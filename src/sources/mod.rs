//! Source collaborators
//!
//! The engine talks to the outside world through two seams:
//! - [`Fetcher`]: retrieves the raw body behind a subscription URL
//! - [`FeedParser`]: turns a body into candidate items
//!
//! Parsers are chosen per subscription `kind` through a [`ParserRegistry`].

pub mod feed;
pub mod http;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FetchError, ParseError};
use crate::schemas::{RawItem, KIND_CHANNEL, KIND_FEED, KIND_PERIODIC};

pub use feed::FeedRsParser;
pub use http::{HttpFetcher, HttpFetcherConfig};

/// Retrieves the content behind a URL.
///
/// Implementations classify their failures; the executor only decides
/// whether and when to try again.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError>;
}

/// Converts a fetched body into candidate items, in source order.
pub trait FeedParser: Send + Sync {
    fn parse(&self, body: &[u8]) -> Result<Vec<RawItem>, ParseError>;
}

/// Maps source kinds to parsers
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn FeedParser>>,
    default: Arc<dyn FeedParser>,
}

impl ParserRegistry {
    /// Registry where every kind falls through to `default`.
    pub fn new(default: Arc<dyn FeedParser>) -> Self {
        Self {
            parsers: HashMap::new(),
            default,
        }
    }

    pub fn register(mut self, kind: impl Into<String>, parser: Arc<dyn FeedParser>) -> Self {
        self.parsers.insert(kind.into(), parser);
        self
    }

    pub fn for_kind(&self, kind: &str) -> Arc<dyn FeedParser> {
        self.parsers
            .get(kind)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for ParserRegistry {
    /// RSS/Atom/JSON Feed parsing for the well-known kinds.
    fn default() -> Self {
        let feed: Arc<dyn FeedParser> = Arc::new(FeedRsParser::new());
        ParserRegistry::new(feed.clone())
            .register(KIND_FEED, feed.clone())
            .register(KIND_CHANNEL, feed.clone())
            .register(KIND_PERIODIC, feed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    impl FeedParser for Fixed {
        fn parse(&self, _body: &[u8]) -> Result<Vec<RawItem>, ParseError> {
            Ok(vec![RawItem::new(self.0)])
        }
    }

    #[test]
    fn test_registry_dispatches_by_kind() {
        let registry = ParserRegistry::new(Arc::new(Fixed("default")))
            .register("custom", Arc::new(Fixed("custom")));

        let custom = registry.for_kind("custom").parse(b"").unwrap();
        let other = registry.for_kind("unknown").parse(b"").unwrap();
        assert_eq!(custom[0].title, "custom");
        assert_eq!(other[0].title, "default");
    }
}
