use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for Harvest.
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid run configuration or missing capability wiring.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The output ledger and the input ledger disagree.
    #[error("Consistency error: {0}")]
    ConsistencyError(String),

    /// The remote answered with a non-success status.
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// HTTP request failed (fetching a page).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// An extraction attempt exceeded its hard timeout.
    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The work item itself is malformed (e.g. empty URL).
    #[error("Invalid item: {0}")]
    InvalidItem(String),

    /// The page was fetched but its content cannot be handled.
    #[error("Unsupported content: {0}")]
    UnsupportedContent(String),

    /// Page or API payload could not be parsed.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A single append to the result sink failed.
    #[error("Sink error: {message}")]
    SinkError { message: String, retryable: bool },

    /// Appending a result row kept failing after all retries.
    #[error("Sink write for item {index} failed after {attempts} attempts: {message}")]
    SinkWriteFailed {
        index: u64,
        attempts: u32,
        message: String,
    },

    /// Chunk ledger or work source storage failed.
    #[error("Ledger error: {0}")]
    LedgerError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::HttpStatus { status, .. } => is_transient_status(*status),
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            AppError::SinkError { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns true if this error should trip the circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Returns true for rate-limit signals (explicit or HTTP 429).
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            AppError::RateLimitExceeded | AppError::HttpStatus { status: 429, .. }
        )
    }

    /// Short machine-readable label, written next to failure rows.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ConfigError(_) => "config",
            AppError::ConsistencyError(_) => "consistency",
            AppError::HttpStatus { .. } => "http_status",
            AppError::HttpError(_) => "http",
            AppError::Timeout(_) => "timeout",
            AppError::RateLimitExceeded => "rate_limited",
            AppError::NetworkError(_) => "network",
            AppError::InvalidItem(_) => "invalid_item",
            AppError::UnsupportedContent(_) => "unsupported_content",
            AppError::ParseError(_) => "parse",
            AppError::SinkError { .. } | AppError::SinkWriteFailed { .. } => "sink",
            AppError::LedgerError(_) => "ledger",
            AppError::DatabaseError(_) => "database",
            AppError::IoError(_) => "io",
            AppError::SerializationError(_) => "serialization",
            AppError::Generic(_) => "generic",
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(AppError::RateLimitExceeded.is_retryable());
        assert!(
            AppError::HttpStatus {
                status: 503,
                url: "https://example.com".into(),
            }
            .is_retryable()
        );
        assert!(
            AppError::SinkError {
                message: "quota".into(),
                retryable: true,
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_permanent_errors() {
        assert!(!AppError::InvalidItem("empty url".into()).is_retryable());
        assert!(!AppError::UnsupportedContent("pdf".into()).is_retryable());
        assert!(
            !AppError::HttpStatus {
                status: 404,
                url: "https://example.com".into(),
            }
            .is_retryable()
        );
        assert!(
            !AppError::SinkError {
                message: "schema".into(),
                retryable: false,
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_circuit_tripping() {
        assert!(AppError::RateLimitExceeded.should_trip_circuit());
        assert!(AppError::Timeout(Duration::from_secs(1)).should_trip_circuit());
        assert!(!AppError::ParseError("bad json".into()).should_trip_circuit());
        assert!(
            !AppError::HttpStatus {
                status: 408,
                url: "https://example.com".into(),
            }
            .should_trip_circuit()
        );
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(AppError::RateLimitExceeded.is_rate_limit());
        assert!(
            AppError::HttpStatus {
                status: 429,
                url: "https://example.com".into(),
            }
            .is_rate_limit()
        );
        assert!(!AppError::NetworkError("x".into()).is_rate_limit());
    }

    #[test]
    fn test_timeout_message_in_millis() {
        let err = AppError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Timed out after 1500ms");
        assert_eq!(err.kind(), "timeout");
    }
}
