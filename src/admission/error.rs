use std::time::Duration;

use chrono::{DateTime, Utc};
use http::StatusCode;
use thiserror::Error;

use super::RateWindow;
use crate::{models::Permission, store::StoreError};

/// Why an admission was denied (or could not be decided).
///
/// Gates are evaluated in a fixed order and short-circuit, so a request gets
/// exactly one of these. `status_hint()` is advisory: the transport layer
/// owns the actual response.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("API key has an invalid format")]
    InvalidFormat,

    #[error("API key not found")]
    NotFound,

    #[error("API key is disabled")]
    Inactive,

    #[error("API key has been deleted")]
    Deleted,

    #[error("API key expired at {expired_at}")]
    Expired { expired_at: DateTime<Utc> },

    #[error("permission '{required}' is not granted to this API key")]
    PermissionDenied { required: Permission },

    #[error("client '{client}' is not allowed by this API key")]
    ClientNotAllowed { client: String },

    #[error("model '{model}' is blacklisted for this API key")]
    ModelBlacklisted { model: String },

    #[error("rate limit exceeded: {current}/{limit} requests per {window}")]
    RateLimited {
        window: RateWindow,
        limit: u32,
        current: i64,
        reset_at: DateTime<Utc>,
        retry_after: Duration,
    },

    #[error("daily cost limit reached: {current:.4}/{limit:.4} USD")]
    CostLimitDaily {
        limit: f64,
        current: f64,
        reset_at: DateTime<Utc>,
    },

    #[error("total cost limit reached: {current:.4}/{limit:.4} USD")]
    CostLimitTotal { limit: f64, current: f64 },

    #[error("weekly Opus cost limit reached: {current:.4}/{limit:.4} USD")]
    CostLimitWeeklyOpus {
        limit: f64,
        current: f64,
        reset_at: DateTime<Utc>,
    },

    #[error("window cost limit reached: {current:.4}/{limit:.4} USD")]
    CostLimitWindow {
        limit: f64,
        current: f64,
        retry_after: Duration,
    },

    #[error("concurrency limit reached: {current}/{limit} requests in flight")]
    ConcurrencyExceeded { limit: u32, current: u64 },

    #[error("concurrency queue is full: {size}/{max_size} waiting")]
    QueueFull { size: i64, max_size: i64 },

    #[error("timed out after {waited_ms} ms waiting for a concurrency slot")]
    QueueTimeout { waited_ms: u64 },

    #[error("request cancelled while waiting for admission")]
    ContextCancelled,

    #[error("API key lookup failed: {0}")]
    Lookup(#[from] StoreError),
}

impl AdmissionError {
    /// Stable machine-readable kind, mirrored in responses and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionError::InvalidFormat => "invalid_format",
            AdmissionError::NotFound => "not_found",
            AdmissionError::Inactive => "inactive",
            AdmissionError::Deleted => "deleted",
            AdmissionError::Expired { .. } => "expired",
            AdmissionError::PermissionDenied { .. } => "permission_denied",
            AdmissionError::ClientNotAllowed { .. } => "client_not_allowed",
            AdmissionError::ModelBlacklisted { .. } => "model_blacklisted",
            AdmissionError::RateLimited { .. } => "rate_limited",
            AdmissionError::CostLimitDaily { .. } => "cost_limit_daily",
            AdmissionError::CostLimitTotal { .. } => "cost_limit_total",
            AdmissionError::CostLimitWeeklyOpus { .. } => "cost_limit_weekly_opus",
            AdmissionError::CostLimitWindow { .. } => "cost_limit_window",
            AdmissionError::ConcurrencyExceeded { .. } => "concurrency_exceeded",
            AdmissionError::QueueFull { .. } => "queue_full",
            AdmissionError::QueueTimeout { .. } => "queue_timeout",
            AdmissionError::ContextCancelled => "context_cancelled",
            AdmissionError::Lookup(_) => "lookup_error",
        }
    }

    /// Advisory HTTP status for the transport layer.
    pub fn status_hint(&self) -> StatusCode {
        match self {
            AdmissionError::InvalidFormat | AdmissionError::NotFound => StatusCode::UNAUTHORIZED,
            AdmissionError::Inactive
            | AdmissionError::Deleted
            | AdmissionError::Expired { .. }
            | AdmissionError::PermissionDenied { .. }
            | AdmissionError::ClientNotAllowed { .. }
            | AdmissionError::ModelBlacklisted { .. } => StatusCode::FORBIDDEN,
            AdmissionError::RateLimited { .. }
            | AdmissionError::CostLimitDaily { .. }
            | AdmissionError::CostLimitTotal { .. }
            | AdmissionError::CostLimitWeeklyOpus { .. }
            | AdmissionError::CostLimitWindow { .. }
            | AdmissionError::ConcurrencyExceeded { .. }
            | AdmissionError::QueueFull { .. }
            | AdmissionError::QueueTimeout { .. } => StatusCode::TOO_MANY_REQUESTS,
            // Client closed request; nginx's 499 is the usual convention
            AdmissionError::ContextCancelled => {
                StatusCode::from_u16(499).expect("499 is a valid status code")
            }
            AdmissionError::Lookup(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying later can succeed without the client changing its
    /// credential or request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AdmissionError::RateLimited { .. }
                | AdmissionError::CostLimitDaily { .. }
                | AdmissionError::CostLimitTotal { .. }
                | AdmissionError::CostLimitWeeklyOpus { .. }
                | AdmissionError::CostLimitWindow { .. }
                | AdmissionError::ConcurrencyExceeded { .. }
                | AdmissionError::QueueFull { .. }
                | AdmissionError::QueueTimeout { .. }
                | AdmissionError::ContextCancelled
                | AdmissionError::Lookup(_)
        )
    }

    /// Suggested client back-off, where one applies.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdmissionError::RateLimited { retry_after, .. }
            | AdmissionError::CostLimitWindow { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
