//! Error types for the claw-alert-router crate.

use thiserror::Error;

/// Errors that can occur while routing alerts.
///
/// Most of these never reach callers of the pipeline: the engines convert
/// them into fallbacks, skips, or `false` results and record them in stats.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The classification backend failed or returned garbage.
    #[error("classifier error: {reason}")]
    Classifier {
        /// The reason the classifier failed.
        reason: String,
    },

    /// The cache backend failed.
    #[error("cache error: {reason}")]
    Cache {
        /// The reason the cache operation failed.
        reason: String,
    },

    /// The storage backend failed.
    #[error("storage error: {reason}")]
    Storage {
        /// The reason the storage operation failed.
        reason: String,
    },

    /// The target source could not be queried.
    #[error("target discovery failed: {reason}")]
    Discovery {
        /// The reason discovery failed.
        reason: String,
    },

    /// Delivery to a target failed before a response was received.
    #[error("transport to '{target}' failed: {reason}")]
    Transport {
        /// The target that could not be reached.
        target: String,
        /// The reason delivery failed.
        reason: String,
    },

    /// A target answered with a non-success HTTP status.
    #[error("target '{target}' responded with HTTP {status}")]
    HttpStatus {
        /// The target that responded.
        target: String,
        /// The HTTP status code.
        status: u16,
    },

    /// An operation exceeded its deadline.
    #[error("{operation} timed out")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// A regular expression could not be compiled.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// The compiler's complaint.
        reason: String,
    },

    /// A publishing target definition is unusable.
    #[error("invalid target: {reason}")]
    InvalidTarget {
        /// The reason the target is invalid.
        reason: String,
    },

    /// A filter rule definition is unusable.
    #[error("invalid filter rule: {reason}")]
    InvalidRule {
        /// The reason the rule is invalid.
        reason: String,
    },

    /// No filter rule with the given name exists.
    #[error("rule not found: {name}")]
    RuleNotFound {
        /// The rule name that was not found.
        name: String,
    },

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RouterError {
    /// Returns true if a delivery failure is worth another attempt.
    ///
    /// Connection failures, timeouts, server errors and throttling are
    /// transient; other client errors will fail the same way again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for routing operations.
pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn error_display_transport() {
        let err = RouterError::Transport {
            target: "pagerduty".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "transport to 'pagerduty' failed: connection refused"
        );
    }

    #[test]
    fn error_display_http_status() {
        let err = RouterError::HttpStatus {
            target: "slack".to_string(),
            status: 503,
        };
        assert_eq!(err.to_string(), "target 'slack' responded with HTTP 503");
    }

    #[test]
    fn error_display_invalid_pattern() {
        let err = RouterError::InvalidPattern {
            pattern: "(".to_string(),
            reason: "unclosed group".to_string(),
        };
        assert_eq!(err.to_string(), "invalid pattern '(': unclosed group");
    }

    #[test]
    fn error_display_timeout() {
        let err = RouterError::Timeout {
            operation: "classifier call".to_string(),
        };
        assert_eq!(err.to_string(), "classifier call timed out");
    }

    #[test_case(500, true ; "server error")]
    #[test_case(503, true ; "unavailable")]
    #[test_case(429, true ; "throttled")]
    #[test_case(400, false ; "bad request")]
    #[test_case(404, false ; "not found")]
    fn http_status_retryable(status: u16, expected: bool) {
        let err = RouterError::HttpStatus {
            target: "t".to_string(),
            status,
        };
        assert_eq!(err.is_retryable(), expected);
    }

    #[test]
    fn transport_and_timeout_are_retryable() {
        let transport = RouterError::Transport {
            target: "t".to_string(),
            reason: "reset".to_string(),
        };
        let timeout = RouterError::Timeout {
            operation: "publish".to_string(),
        };
        assert!(transport.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!RouterError::Config("bad".to_string()).is_retryable());
    }

    #[test]
    fn error_from_serde_json() {
        let json_err = serde_json::from_str::<String>("invalid json");
        assert!(json_err.is_err());
        let err: RouterError = json_err.unwrap_err().into();
        assert!(matches!(err, RouterError::Serialization(_)));
    }
}
