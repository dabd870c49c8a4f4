//! Failure Policy
//!
//! Applied after every completed attempt. Decides the subscription's next
//! schedule slot and whether it should be taken out of rotation:
//! - Success: failures reset, next slot from the schedule relative to now
//! - Transient failure: failure counted, next regular slot unchanged
//! - Permanent failure: counted the same, but disables at a lower threshold
//! - Schedule that no longer evaluates: disabled as "invalid schedule"

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::schedule::Schedule;
use crate::schemas::{FetchOutcome, Subscription};

/// `last_error` recorded for subscriptions whose schedule cannot be evaluated
pub const INVALID_SCHEDULE: &str = "invalid schedule";

/// Configuration for auto-disabling
#[derive(Debug, Clone)]
pub struct FailurePolicy {
    /// Consecutive failures (of any kind) before disabling
    pub disable_after_failures: u32,
    /// Consecutive failures before disabling when the latest one is permanent
    pub disable_after_permanent: u32,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            disable_after_failures: 10,
            disable_after_permanent: 3,
        }
    }
}

/// Why a subscription was taken out of rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableCause {
    InvalidSchedule,
    ConsecutiveFailures,
    PermanentFailures,
}

impl DisableCause {
    /// Label for the `auto_disables` metric
    pub fn label(&self) -> &'static str {
        match self {
            DisableCause::InvalidSchedule => "invalid_schedule",
            DisableCause::ConsecutiveFailures => "consecutive_failures",
            DisableCause::PermanentFailures => "permanent_failures",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disable {
    pub cause: DisableCause,
    pub reason: String,
}

/// What to do with a subscription after an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDecision {
    pub next_due: Option<DateTime<Utc>>,
    pub disable: Option<Disable>,
}

impl FailureDecision {
    fn keep(next_due: Option<DateTime<Utc>>) -> Self {
        Self {
            next_due,
            disable: None,
        }
    }

    fn disable(next_due: Option<DateTime<Utc>>, cause: DisableCause, reason: String) -> Self {
        Self {
            next_due,
            disable: Some(Disable { cause, reason }),
        }
    }

    pub fn should_disable(&self) -> bool {
        self.disable.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FailureManager {
    policy: FailurePolicy,
}

impl FailureManager {
    pub fn new(policy: FailurePolicy) -> Self {
        Self { policy }
    }

    /// Next regular slot after an attempt at `now`, relative to `now` and not
    /// to the slot that was due. `None` if the schedule cannot be evaluated.
    pub fn next_due(&self, subscription: &Subscription, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Schedule::parse(&subscription.schedule)
            .ok()
            .and_then(|schedule| schedule.next_after(now))
    }

    /// Decides on `recorded`, the row as persisted by `mark_attempt` for
    /// `outcome`. Its failure count already includes this attempt.
    pub fn record_outcome(&self, recorded: &Subscription, outcome: &FetchOutcome) -> FailureDecision {
        let Some(next_due) = recorded.next_due else {
            warn!(
                subscription_id = recorded.id,
                schedule = %recorded.schedule,
                "Schedule cannot be evaluated, disabling"
            );
            return FailureDecision::disable(None, DisableCause::InvalidSchedule, INVALID_SCHEDULE.to_string());
        };

        let reason = match outcome {
            FetchOutcome::Success { .. } => return FailureDecision::keep(Some(next_due)),
            FetchOutcome::TransientFailure { reason } | FetchOutcome::PermanentFailure { reason } => {
                reason
            }
        };

        let failures = recorded.consecutive_failures;
        let (threshold, cause, kind) = if outcome.is_permanent() {
            (self.policy.disable_after_permanent, DisableCause::PermanentFailures, "permanent")
        } else {
            (self.policy.disable_after_failures, DisableCause::ConsecutiveFailures, "consecutive")
        };

        if failures >= threshold {
            warn!(
                subscription_id = recorded.id,
                failures = failures,
                threshold = threshold,
                "Failure threshold reached, disabling"
            );
            return FailureDecision::disable(
                Some(next_due),
                cause,
                format!("disabled after {failures} {kind} failures: {reason}"),
            );
        }

        debug!(
            subscription_id = recorded.id,
            failures = failures,
            next_due = %next_due,
            "Failure recorded"
        );
        FailureDecision::keep(Some(next_due))
    }
}
