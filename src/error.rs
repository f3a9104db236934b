//! Error taxonomy for the SDK.
//!
//! Errors are tagged kinds rather than an inheritance tree: every failure a
//! caller can observe maps to exactly one variant, and retry policies key off
//! the variant alone.
//!
//! # Retry behavior
//!
//! | Retried (by [`HttpClient`](crate::http::HttpClient)) | Never retried |
//! |------------------------------------------------------|---------------|
//! | `Api`                                                | `Validation`  |
//! | `Internal`                                           | `NotFound`    |
//! | `TooManyRequests` (timing-gated)                     | `Unauthorized`|
//! |                                                      | `Timeout`     |

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by the SDK.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request rejected by the server. Not retried.
    #[error("{message}")]
    Validation {
        /// Human-readable message.
        message: String,
        /// Structured per-field details as supplied by the server.
        details: serde_json::Value,
    },

    /// Requested resource is absent. Not retried.
    #[error("{message}")]
    NotFound {
        /// Human-readable message.
        message: String,
    },

    /// Operation requires a synchronization state not yet achieved.
    #[error("{message}")]
    NotSynchronized {
        /// Human-readable message.
        message: String,
    },

    /// The session is not connected or not authenticated on the server side.
    #[error("{message}")]
    NotConnected {
        /// Human-readable message.
        message: String,
    },

    /// Auth token is invalid. The transport is torn down when this arrives.
    #[error("{message}")]
    Unauthorized {
        /// Human-readable message.
        message: String,
    },

    /// Upstream or network failure of a generic kind. Retried by `HttpClient`.
    #[error("[{code}] {message}")]
    Api {
        /// Server-supplied error code or HTTP status.
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// Transient server-side failure. Retried by `HttpClient`.
    #[error("{message}")]
    Internal {
        /// Human-readable message.
        message: String,
    },

    /// Rate limit hit; carries the server-recommended retry moment.
    #[error("{message}")]
    TooManyRequests {
        /// Human-readable message.
        message: String,
        /// Wall-clock time after which the request may be repeated.
        recommended_retry_time: DateTime<Utc>,
    },

    /// A local wait exceeded its bound. Never retried automatically.
    #[error("{message}")]
    Timeout {
        /// Human-readable message.
        message: String,
    },

    /// Trade command rejected by the trade server.
    #[error("[{string_code}] {message}")]
    Trade {
        /// Numeric trade server result code.
        code: i64,
        /// Symbolic result code (e.g. `TRADE_RETCODE_INVALID_PRICE`).
        string_code: String,
        /// Human-readable message.
        message: String,
    },

    /// Socket-level failure that aborted a single request future.
    #[error("transport error: {message}")]
    Transport {
        /// Failure details.
        message: String,
    },
}

impl Error {
    /// Build the matching taxonomy variant from a server `processingError`
    /// payload.
    ///
    /// The server tags errors with an `id` discriminator; anything it does
    /// not name collapses into the generic [`Error::Api`] kind.
    #[must_use]
    pub fn from_processing_error(error: &serde_json::Value) -> Self {
        let id = error.get("error").and_then(|v| v.as_str()).unwrap_or("");
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown server error")
            .to_string();

        match id {
            "ValidationError" => Self::Validation {
                message,
                details: error
                    .get("details")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            },
            "NotFoundError" => Self::NotFound { message },
            "NotSynchronizedError" => Self::NotSynchronized { message },
            "NotAuthenticatedError" => Self::NotConnected { message },
            "UnauthorizedError" => Self::Unauthorized { message },
            "TooManyRequestsError" => Self::TooManyRequests {
                message,
                recommended_retry_time: error
                    .get("metadata")
                    .and_then(|m| m.get("recommendedRetryTime"))
                    .and_then(recommended_retry_time)
                    .unwrap_or_else(Utc::now),
            },
            "InternalError" => Self::Internal { message },
            _ => Self::Api {
                code: if id.is_empty() {
                    "UnknownError".to_string()
                } else {
                    id.to_string()
                },
                message,
            },
        }
    }

    /// Whether `HttpClient` may retry this error with back-off.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Api { .. } | Self::Internal { .. })
    }

    /// Shorthand for a timeout with the given message.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Shorthand for a not-connected failure with the given message.
    #[must_use]
    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::NotConnected {
            message: message.into(),
        }
    }
}

/// Parse a `recommendedRetryTime` value, which arrives either as an ISO-8601
/// string or as epoch milliseconds after transport re-hydration.
fn recommended_retry_time(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}
