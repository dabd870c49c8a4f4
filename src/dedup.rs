//! Deduplication Module
//!
//! Decides which candidate items of a fetch are genuinely new:
//! - Identity key: the source's external id, or a SHA-256 over
//!   (title, published timestamp, canonical URL) when the source has none
//! - One batched lookup of existing keys against the item store
//! - Intra-batch duplicates collapse to their first occurrence
//! - Source keys so that one source cannot be registered twice
//!
//! The filtering itself is pure; nothing is written here.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::error::Result;
use crate::schemas::{RawItem, SubscriptionId};
use crate::storage::ItemStore;

/// Prefix marking identity keys derived from content instead of the source
pub const HASH_IDENTITY_PREFIX: &str = "sha256:";

/// Computes SHA-256 hash of content
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)
}

/// Normalizes URL to canonical form
/// - Removes fragments (#...)
/// - Removes tracking parameters (utm_*, fbclid, etc.)
/// - Lowercase scheme and host
/// - Sorts query parameters
pub fn canonicalize_url(url_str: &str) -> std::result::Result<String, url::ParseError> {
    let mut url = Url::parse(url_str)?;

    url.set_fragment(None);

    let tracking_params: HashSet<&str> = [
        "utm_source", "utm_medium", "utm_campaign", "utm_term", "utm_content",
        "fbclid", "gclid", "msclkid", "mc_cid", "mc_eid", "_ga", "_gl", "yclid",
    ]
    .into_iter()
    .collect();

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !tracking_params.contains(key.as_ref()))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    url.set_query(None);
    if !params.is_empty() {
        params.sort();
        url.query_pairs_mut().extend_pairs(params.iter());
    }

    // Url::parse already lowercases scheme and host; path case is significant
    Ok(url.to_string())
}

/// Path prefixes under which a video platform addresses one channel
const CHANNEL_PATHS: [&str; 4] = ["@", "channel/", "c/", "user/"];

/// Registration key of a source.
///
/// Channel pages are keyed by platform and channel id, so every spelling
/// of a channel URL (handle, `/c/`, tabs such as `/videos`) collides. Any
/// other URL is keyed by its canonical form.
pub fn source_key(url_str: &str) -> std::result::Result<String, url::ParseError> {
    let canonical = canonicalize_url(url_str)?;
    let url = Url::parse(&canonical)?;

    let host = url
        .host_str()
        .unwrap_or_default()
        .trim_start_matches("www.")
        .trim_start_matches("m.");
    if host == "youtube.com" {
        let path = url.path().trim_start_matches('/');
        for prefix in CHANNEL_PATHS {
            if let Some(rest) = path.strip_prefix(prefix) {
                if let Some(id) = rest.split('/').next().filter(|id| !id.is_empty()) {
                    return Ok(format!("youtube:{id}"));
                }
            }
        }
    }

    Ok(canonical)
}

/// Identity key of a candidate item within its subscription.
pub fn item_identity(item: &RawItem) -> String {
    match item.external_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            let url = item
                .url
                .as_deref()
                .map(|u| canonicalize_url(u).unwrap_or_else(|_| u.trim().to_string()))
                .unwrap_or_default();
            let published = item
                .published_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            let material = format!("{}|{}|{}", item.title.trim(), published, url);
            format!("{}{}", HASH_IDENTITY_PREFIX, compute_hash(&material))
        }
    }
}

/// Hash over the mutable content of an item; used for update detection only.
pub fn content_hash(item: &RawItem) -> String {
    let material = format!(
        "{}|{}|{}",
        item.title.trim(),
        item.description.as_deref().unwrap_or("").trim(),
        item.url.as_deref().unwrap_or("").trim(),
    );
    compute_hash(&material)
}

/// Keeps candidates whose key is neither in `existing` nor seen earlier in
/// the batch. Source order is preserved.
pub fn partition_new(existing: &HashSet<String>, candidates: Vec<RawItem>) -> Vec<RawItem> {
    let mut seen: HashSet<String> = HashSet::with_capacity(candidates.len());
    candidates
        .into_iter()
        .filter(|item| {
            let key = item_identity(item);
            !existing.contains(&key) && seen.insert(key)
        })
        .collect()
}

/// Filters fetched batches against the item store
pub struct Deduplicator {
    items: Arc<dyn ItemStore>,
}

impl Deduplicator {
    pub fn new(items: Arc<dyn ItemStore>) -> Self {
        Self { items }
    }

    /// Returns the candidates that are not yet stored for this subscription.
    pub async fn filter_new(
        &self,
        subscription_id: SubscriptionId,
        candidates: Vec<RawItem>,
    ) -> Result<Vec<RawItem>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let keys: Vec<String> = candidates.iter().map(item_identity).collect();
        let existing = self.items.existing_keys(subscription_id, &keys).await?;
        let total = candidates.len();
        let fresh = partition_new(&existing, candidates);

        debug!(
            subscription_id,
            candidates = total,
            already_stored = existing.len(),
            new = fresh.len(),
            "Deduplicated batch"
        );

        Ok(fresh)
    }
}
