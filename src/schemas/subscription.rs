//! Subscription Schema
//!
//! A registered source polled on a recurring schedule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Surrogate key of a subscription row
pub type SubscriptionId = i64;

/// Well-known source kinds. The kind is an opaque tag; these are only the
/// ones the default parser registry knows about.
pub const KIND_FEED: &str = "feed";
pub const KIND_CHANNEL: &str = "channel";
pub const KIND_PERIODIC: &str = "periodic";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: SubscriptionId,
    pub name: String,
    pub url: String,
    pub kind: String,
    pub schedule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_due: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Lowercased host of the source URL, used as the rate-limit key.
    pub fn domain(&self) -> String {
        domain_of(&self.url)
    }
}

/// Input for registering a new subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    pub name: String,
    pub url: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub schedule: String,
}

fn default_kind() -> String {
    KIND_FEED.to_string()
}

impl NewSubscription {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        kind: impl Into<String>,
        schedule: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            kind: kind.into(),
            schedule: schedule.into(),
        }
    }
}

/// Extracts the host part of a URL for per-domain accounting.
/// Unparseable URLs share a single "unknown" bucket.
pub fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_lowercase()))
        .unwrap_or_else(|| "unknown".to_string())
}
