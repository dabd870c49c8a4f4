//! Error types for the Ingestion Service

use thiserror::Error;

use crate::schemas::SubscriptionId;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    #[error("Permanent fetch error: {0}")]
    PermanentFetch(String),

    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule {
        expression: String,
        reason: String,
    },

    #[error("Source already registered: {0}")]
    DuplicateSource(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid time window '{input}': {reason}")]
    InvalidWindow { input: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl IngestionError {
    pub fn invalid_schedule(expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_window(input: &str, reason: impl Into<String>) -> Self {
        Self::InvalidWindow {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<FetchError> for IngestionError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient(msg) => IngestionError::TransientFetch(msg),
            FetchError::Permanent(msg) => IngestionError::PermanentFetch(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestionError>;

/// Classified failure of a single fetch-and-parse attempt.
///
/// Transient errors are retried inside an attempt; permanent ones surface
/// immediately to the failure policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            FetchError::Transient(msg) | FetchError::Permanent(msg) => msg,
        }
    }
}

/// Raised by a `FeedParser` when a body cannot be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("parse error: {0}")]
pub struct ParseError(pub String);

impl From<ParseError> for FetchError {
    fn from(err: ParseError) -> Self {
        FetchError::Permanent(err.to_string())
    }
}
