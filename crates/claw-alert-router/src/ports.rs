//! Ports consumed by the routing engines.
//!
//! Every external collaborator sits behind one of these traits so the
//! engines can be wired with real backends in production and with the
//! in-memory adapters from [`crate::memory`] in tests. Async methods return
//! boxed futures so the traits stay object-safe and can be shared as
//! `Arc<dyn Port>`.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Alert, AlertStatus, ClassificationResult, PublishingTarget};

/// Metric names emitted through the [`Metrics`] port.
pub mod metric_names {
    /// Classification requests, labelled by `outcome` (`cache_hit`, `llm`, `fallback`, `coalesced`).
    pub const CLASSIFICATION_REQUESTS: &str = "alert_router_classification_requests_total";
    /// Classification latency in seconds.
    pub const CLASSIFICATION_DURATION: &str = "alert_router_classification_duration_seconds";
    /// Filter decisions, labelled by `target` and `decision`.
    pub const FILTER_DECISIONS: &str = "alert_router_filter_decisions_total";
    /// Publish attempts, labelled by `target`.
    pub const PUBLISH_ATTEMPTS: &str = "alert_router_publish_attempts_total";
    /// Successful publishes, labelled by `target`.
    pub const PUBLISH_SUCCESSES: &str = "alert_router_publish_successes_total";
    /// Failed publishes, labelled by `target`.
    pub const PUBLISH_FAILURES: &str = "alert_router_publish_failures_total";
    /// Publishes skipped by an open circuit, labelled by `target`.
    pub const CIRCUIT_BREAKER_BLOCKS: &str = "alert_router_circuit_breaker_blocks_total";
    /// Publish latency in seconds, labelled by `target`.
    pub const PUBLISH_DURATION: &str = "alert_router_publish_duration_seconds";
    /// Circuit state per target: 0 closed, 1 half-open, 2 open.
    pub const CIRCUIT_BREAKER_STATE: &str = "alert_router_circuit_breaker_state";
    /// Number of enabled targets.
    pub const ACTIVE_TARGETS: &str = "alert_router_active_targets";
    /// Target discovery refreshes, labelled by `outcome`.
    pub const TARGET_REFRESHES: &str = "alert_router_target_refreshes_total";
}

/// Criteria for fetching past alerts from storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertQuery {
    /// Alert name to match exactly.
    pub name: Option<String>,
    /// Fingerprint to match exactly.
    pub fingerprint: Option<String>,
    /// Status to match.
    pub status: Option<AlertStatus>,
    /// Only alerts that started at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of alerts to return.
    pub limit: Option<usize>,
}

impl AlertQuery {
    /// Query for alerts with the given name.
    #[must_use]
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Sets the result limit.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the alert satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, alert: &Alert) -> bool {
        self.name.as_ref().is_none_or(|n| *n == alert.name)
            && self
                .fingerprint
                .as_ref()
                .is_none_or(|f| *f == alert.fingerprint)
            && self.status.is_none_or(|s| s == alert.status)
            && self.since.is_none_or(|t| alert.starts_at >= t)
    }
}

/// Summary of past alerts sharing a name, handed to the classifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPattern {
    /// Number of past alerts examined.
    pub frequency: usize,
    /// How many of them started in the last 24 hours.
    pub recent_24h_count: usize,
    /// Share of them that were firing, in `[0, 1]`.
    pub firing_ratio: f64,
    /// `key=value` labels carried by at least half of them.
    pub common_labels: Vec<String>,
}

/// Context passed to the classifier alongside the alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationContext {
    /// When the classification was requested.
    pub timestamp: DateTime<Utc>,
    /// Pattern drawn from earlier alerts with the same name.
    pub historical: Option<HistoricalPattern>,
    /// Caller-supplied hints.
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl ClassificationContext {
    /// Creates an empty context stamped now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            historical: None,
            extra: HashMap::new(),
        }
    }

    /// Adds a caller hint.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

impl Default for ClassificationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// An outbound delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    /// Name of the target being delivered to.
    pub target: String,
    /// HTTP method.
    pub method: String,
    /// Destination URL.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Encoded payload.
    pub body: Vec<u8>,
    /// Deadline for the whole exchange.
    pub timeout: Duration,
}

/// The answer to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body, if read.
    pub body: Option<String>,
}

impl TransportResponse {
    /// Creates a response with no body.
    #[must_use]
    pub const fn new(status: u16) -> Self {
        Self { status, body: None }
    }

    /// Returns true for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Durable record of alerts and classifications.
pub trait Storage: Send + Sync + fmt::Debug {
    /// Fetches one alert by fingerprint.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Storage` if the backend fails.
    fn get_alert<'a>(&'a self, fingerprint: &'a str) -> BoxFuture<'a, Result<Option<Alert>>>;

    /// Fetches past alerts matching a query, newest first.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Storage` if the backend fails.
    fn get_alerts<'a>(&'a self, query: &'a AlertQuery) -> BoxFuture<'a, Result<Vec<Alert>>>;

    /// Persists a classification.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Storage` if the backend fails.
    fn save_classification<'a>(
        &'a self,
        fingerprint: &'a str,
        result: &'a ClassificationResult,
    ) -> BoxFuture<'a, Result<()>>;

    /// Fetches the stored classification for a fingerprint.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Storage` if the backend fails.
    fn get_classification<'a>(
        &'a self,
        fingerprint: &'a str,
    ) -> BoxFuture<'a, Result<Option<ClassificationResult>>>;
}

/// The LLM-backed classification backend.
pub trait Classifier: Send + Sync + fmt::Debug {
    /// Classifies an alert.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Classifier` on backend failure or malformed output.
    fn classify<'a>(
        &'a self,
        alert: &'a Alert,
        context: &'a ClassificationContext,
    ) -> BoxFuture<'a, Result<ClassificationResult>>;

    /// Suggests remediation steps for a classified alert.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Classifier` on backend failure.
    fn generate_recommendations<'a>(
        &'a self,
        alert: &'a Alert,
        result: &'a ClassificationResult,
    ) -> BoxFuture<'a, Result<Vec<String>>>;
}

/// Key-value cache with per-entry expiry.
pub trait Cache: Send + Sync + fmt::Debug {
    /// Reads a value.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Cache` if the backend fails.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    /// Writes a value that expires after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Cache` if the backend fails.
    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> BoxFuture<'a, Result<()>>;

    /// Removes a value.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Cache` if the backend fails.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Declarative store that supplies publishing target definitions.
pub trait TargetSource: Send + Sync + fmt::Debug {
    /// Returns the complete current set of target definitions.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Discovery` if the source is unreachable.
    fn discover(&self) -> BoxFuture<'_, Result<Vec<PublishingTarget>>>;
}

/// Performs outbound deliveries.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends a request and returns the response status.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Transport` or `RouterError::Timeout` if no
    /// response was received.
    fn send<'a>(&'a self, request: &'a TransportRequest)
    -> BoxFuture<'a, Result<TransportResponse>>;

    /// Releases pooled connections. Called once, after in-flight work has stopped.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Write-only metrics sink.
///
/// Calls are fire-and-forget and must not block.
pub trait Metrics: Send + Sync + fmt::Debug {
    /// Increments a counter by one.
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]);

    /// Records an observation in a histogram.
    fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Sets a gauge.
    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}
