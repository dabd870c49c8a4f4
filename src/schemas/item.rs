//! Item Schema
//!
//! One discrete piece of content discovered from a subscription. Identity is
//! the pair (subscription id, external id); the content hash only detects
//! changes and never takes part in identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::subscription::SubscriptionId;
use crate::dedup;

/// Candidate item as produced by a `FeedParser`, before deduplication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawItem {
    /// Stable token provided by the source (guid, entry id, video id)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl RawItem {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }
}

/// Item ready to be inserted into the item store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub subscription_id: SubscriptionId,
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub content_hash: String,
}

impl NewItem {
    pub fn from_raw(subscription_id: SubscriptionId, raw: &RawItem) -> Self {
        Self {
            subscription_id,
            external_id: dedup::item_identity(raw),
            title: raw.title.clone(),
            description: raw.description.clone(),
            url: raw.url.clone(),
            published_at: raw.published_at,
            content_hash: dedup::content_hash(raw),
        }
    }
}

/// Persisted item row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredItem {
    pub id: i64,
    pub subscription_id: SubscriptionId,
    pub external_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    pub content_hash: String,
}
