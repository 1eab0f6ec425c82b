//! Router configuration.
//!
//! Configuration for the routing engines, including:
//! - Classification caching, timeouts and bulk parallelism
//! - Deduplication and rate-limit windows
//! - Publisher concurrency, retry and shutdown behaviour
//! - Circuit breaker thresholds
//! - Target discovery interval

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, RouterError};

/// Configuration for the classification service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassificationConfig {
    /// Whether alerts are classified at all.
    pub enabled: bool,
    /// How long a cached result stays valid, in seconds.
    pub cache_ttl_secs: u64,
    /// Deadline for a single classifier call, in seconds.
    pub classifier_timeout_secs: u64,
    /// Default concurrency for bulk classification.
    pub bulk_max_parallel: usize,
    /// Whether to look up past alerts with the same name for context.
    pub use_history: bool,
    /// Maximum number of past alerts examined.
    pub history_limit: usize,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl_secs: 3600,
            classifier_timeout_secs: 30,
            bulk_max_parallel: 5,
            use_history: true,
            history_limit: 100,
        }
    }
}

impl ClassificationConfig {
    /// Cache TTL as a duration.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Classifier timeout as a duration.
    #[must_use]
    pub const fn classifier_timeout(&self) -> Duration {
        Duration::from_secs(self.classifier_timeout_secs)
    }
}

/// Configuration for the filter engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilterEngineConfig {
    /// Window during which a repeat fingerprint is suppressed, in seconds.
    pub dedup_window_secs: u64,
    /// Maximum publishes per target within one rate-limit window.
    pub rate_limit_max: u32,
    /// Length of the rate-limit window, in minutes.
    pub rate_limit_window_minutes: u64,
}

impl Default for FilterEngineConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 300,
            rate_limit_max: 100,
            rate_limit_window_minutes: 5,
        }
    }
}

impl FilterEngineConfig {
    /// Dedup window as a duration.
    #[must_use]
    pub const fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

/// Configuration for the publisher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PublisherConfig {
    /// Process-wide cap on concurrent deliveries.
    pub max_concurrent: usize,
    /// Attempts per delivery, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on the retry delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Deadline for one delivery attempt, in seconds.
    pub request_timeout_secs: u64,
    /// How long shutdown waits for in-flight deliveries, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            request_timeout_secs: 10,
            shutdown_grace_secs: 5,
        }
    }
}

impl PublisherConfig {
    /// Request timeout as a duration.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Shutdown grace period as a duration.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Delay before retry number `retry` (1-based), doubling each time up to the cap.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(20);
        let ms = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

/// Configuration for per-target circuit breakers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open after the last failure, in seconds.
    pub timeout_secs: u64,
    /// Trial calls permitted while half-open; that many successes close the circuit.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_secs: 60,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Open timeout as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration for the target manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TargetManagerConfig {
    /// Seconds between discovery refreshes.
    pub refresh_interval_secs: u64,
}

impl Default for TargetManagerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
        }
    }
}

impl TargetManagerConfig {
    /// Refresh interval as a duration.
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Main router configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RouterConfig {
    /// Classification settings.
    pub classification: ClassificationConfig,
    /// Filter settings.
    pub filter: FilterEngineConfig,
    /// Publisher settings.
    pub publisher: PublisherConfig,
    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Target discovery settings.
    pub targets: TargetManagerConfig,
}

impl RouterConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Io` if the file cannot be read, and
    /// `RouterError::Config` if it cannot be parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).inspect_err(|e| {
            warn!(path = %path.display(), error = %e, "failed to read config file");
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| RouterError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any limit is zero or inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.classification.classifier_timeout_secs == 0 {
            return Err(RouterError::Config(
                "classification.classifier_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.classification.bulk_max_parallel == 0 {
            return Err(RouterError::Config(
                "classification.bulk_max_parallel must be greater than 0".to_string(),
            ));
        }
        if self.filter.rate_limit_max == 0 {
            return Err(RouterError::Config(
                "filter.rate_limit_max must be greater than 0".to_string(),
            ));
        }
        if self.filter.rate_limit_window_minutes == 0 {
            return Err(RouterError::Config(
                "filter.rate_limit_window_minutes must be greater than 0".to_string(),
            ));
        }
        if self.publisher.max_concurrent == 0 {
            return Err(RouterError::Config(
                "publisher.max_concurrent must be greater than 0".to_string(),
            ));
        }
        if self.publisher.max_attempts == 0 {
            return Err(RouterError::Config(
                "publisher.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.publisher.request_timeout_secs == 0 {
            return Err(RouterError::Config(
                "publisher.request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.publisher.initial_backoff_ms > self.publisher.max_backoff_ms {
            return Err(RouterError::Config(
                "publisher.initial_backoff_ms cannot exceed publisher.max_backoff_ms".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(RouterError::Config(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            return Err(RouterError::Config(
                "circuit_breaker.half_open_max_calls must be greater than 0".to_string(),
            ));
        }
        if self.targets.refresh_interval_secs == 0 {
            return Err(RouterError::Config(
                "targets.refresh_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
