//! Fetch Attempt Outcome
//!
//! Transient classification of one scheduled fetch attempt. Not persisted as
//! its own entity; it drives the mutations applied to a subscription.

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum FetchOutcome {
    Success {
        items_found: usize,
        items_new: usize,
    },
    TransientFailure {
        reason: String,
    },
    PermanentFailure {
        reason: String,
    },
}

impl FetchOutcome {
    pub fn success(items_found: usize, items_new: usize) -> Self {
        FetchOutcome::Success {
            items_found,
            items_new,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchOutcome::PermanentFailure { .. })
    }

    /// Error text to persist as `last_error`, `None` on success
    pub fn error_message(&self) -> Option<&str> {
        match self {
            FetchOutcome::Success { .. } => None,
            FetchOutcome::TransientFailure { reason } | FetchOutcome::PermanentFailure { reason } => {
                Some(reason)
            }
        }
    }

    /// Short label for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success { .. } => "success",
            FetchOutcome::TransientFailure { .. } => "transient",
            FetchOutcome::PermanentFailure { .. } => "permanent",
        }
    }
}

impl From<FetchError> for FetchOutcome {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient(reason) => FetchOutcome::TransientFailure { reason },
            FetchError::Permanent(reason) => FetchOutcome::PermanentFailure { reason },
        }
    }
}
