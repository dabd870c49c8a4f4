//! Feed parsing (RSS 0.9x/1.0/2.0, Atom, JSON Feed) via `feed-rs`

use chrono::Utc;
use feed_rs::parser;

use super::FeedParser;
use crate::error::ParseError;
use crate::schemas::RawItem;

#[derive(Debug, Clone, Default)]
pub struct FeedRsParser;

impl FeedRsParser {
    pub fn new() -> Self {
        Self
    }
}

impl FeedParser for FeedRsParser {
    fn parse(&self, body: &[u8]) -> Result<Vec<RawItem>, ParseError> {
        let feed = parser::parse(body).map_err(|e| ParseError(e.to_string()))?;

        let items = feed
            .entries
            .into_iter()
            .map(|entry| {
                let external_id = Some(entry.id.trim().to_string()).filter(|id| !id.is_empty());
                let title = entry
                    .title
                    .map(|t| t.content.trim().to_string())
                    .unwrap_or_default();
                let description = entry
                    .summary
                    .map(|s| s.content)
                    .or_else(|| entry.content.and_then(|c| c.body));
                let url = entry.links.first().map(|l| l.href.clone());
                let published_at = entry
                    .published
                    .or(entry.updated)
                    .map(|dt| dt.with_timezone(&Utc));

                RawItem {
                    external_id,
                    title,
                    description,
                    url,
                    published_at,
                }
            })
            .collect();

        Ok(items)
    }
}
