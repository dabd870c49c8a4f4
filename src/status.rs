//! Status Query
//!
//! Read-only snapshot: subscription counts, items discovered within a
//! trailing window, and subscriptions at or above a failure threshold.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::{IngestionError, Result};
use crate::schemas::Subscription;
use crate::storage::{ItemStore, SubscriptionStore};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub total_subscriptions: u64,
    pub enabled_subscriptions: u64,
    pub items_in_window: u64,
    pub window_start: DateTime<Utc>,
    pub failing: Vec<Subscription>,
}

/// Builds a status snapshot for the window `[now - window, now]`.
pub async fn status(
    subscriptions: &dyn SubscriptionStore,
    items: &dyn ItemStore,
    window: Duration,
    failure_threshold: u32,
    now: DateTime<Utc>,
) -> Result<StatusReport> {
    let window_start = now.checked_sub_signed(window).ok_or_else(|| {
        IngestionError::invalid_window(&window.to_string(), "starts before the earliest representable time")
    })?;
    let (total, enabled) = subscriptions.counts().await?;
    let items_in_window = items.count_discovered_since(window_start).await?;
    let failing = subscriptions.failing(failure_threshold).await?;

    Ok(StatusReport {
        total_subscriptions: total,
        enabled_subscriptions: enabled,
        items_in_window,
        window_start,
        failing,
    })
}

/// Parses a trailing window such as "24h", "30m", "2d" or "1w"
pub fn parse_since(input: &str) -> Result<Duration> {
    let since_str = input.trim().to_lowercase();

    if since_str.is_empty() {
        return Err(IngestionError::invalid_window(input, "empty duration"));
    }

    // Try humantime first for complex formats
    if let Ok(std_duration) = humantime::parse_duration(&since_str) {
        return Duration::from_std(std_duration)
            .map_err(|_| IngestionError::invalid_window(input, "duration out of range"));
    }

    // Simple formats like "1h", "30m", "2d"
    let Some((split, unit)) = since_str.char_indices().last() else {
        return Err(IngestionError::invalid_window(input, "empty duration"));
    };
    let value: i64 = since_str[..split]
        .parse()
        .map_err(|_| IngestionError::invalid_window(input, "expected <number><unit>"))?;

    let window = match unit {
        's' => Duration::try_seconds(value),
        'm' => Duration::try_minutes(value),
        'h' => Duration::try_hours(value),
        'd' => Duration::try_days(value),
        'w' => Duration::try_weeks(value),
        _ => return Err(IngestionError::invalid_window(input, format!("unknown unit '{unit}'"))),
    };
    window.ok_or_else(|| IngestionError::invalid_window(input, "duration out of range"))
}
