//! Core types for the alert routing pipeline.
//!
//! This module provides the value objects that flow through the engines:
//! - [`Alert`]: An inbound alert observation
//! - [`Severity`]: The severity assigned by classification (or carried by a label)
//! - [`ClassificationResult`]: The outcome of classifying an alert
//! - [`EnrichedAlert`]: An alert paired with its optional classification
//! - [`PublishingTarget`]: A downstream incident-management destination

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RouterError};

/// Maximum number of recommendations kept on a classification result.
pub const MAX_RECOMMENDATIONS: usize = 5;

/// Reasoning text used when the classifier returns none.
pub const DEFAULT_REASONING: &str = "no reasoning provided";

/// Label carrying the namespace of an alert.
pub const NAMESPACE_LABEL: &str = "namespace";

/// Label carrying the upstream severity of an alert.
pub const SEVERITY_LABEL: &str = "severity";

/// Whether the condition behind an alert is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// The condition is active.
    #[default]
    Firing,
    /// The condition has cleared.
    Resolved,
}

impl AlertStatus {
    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Requires immediate attention.
    Critical,
    /// Should be investigated.
    Warning,
    /// Informational only.
    Info,
    /// Not actionable at all.
    Noise,
}

impl Severity {
    /// Returns the severity as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Noise => "noise",
        }
    }

    /// Parses a severity label value, case-insensitively.
    ///
    /// Returns `None` for values outside the known vocabulary.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "warning" => Some(Self::Warning),
            "info" => Some(Self::Info),
            "noise" => Some(Self::Noise),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An alert received from the upstream source.
///
/// The fingerprint is stable across the firing and resolved observations of
/// the same underlying condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Stable identifier of the underlying condition.
    pub fingerprint: String,
    /// Alert name (the `alertname` of the rule that produced it).
    pub name: String,
    /// Firing or resolved.
    pub status: AlertStatus,
    /// Identifying labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Descriptive annotations.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// When the condition started.
    pub starts_at: DateTime<Utc>,
    /// When the condition ended, if it has.
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    /// Link back to the source of the alert.
    #[serde(default)]
    pub generator_url: Option<String>,
}

impl Alert {
    /// Creates a firing alert starting now.
    #[must_use]
    pub fn new(fingerprint: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            name: name.into(),
            status: AlertStatus::Firing,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
            generator_url: None,
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Sets the start time.
    #[must_use]
    pub fn with_starts_at(mut self, starts_at: DateTime<Utc>) -> Self {
        self.starts_at = starts_at;
        self
    }

    /// Marks the alert as resolved at the given time.
    #[must_use]
    pub fn resolved_at(mut self, ends_at: DateTime<Utc>) -> Self {
        self.status = AlertStatus::Resolved;
        self.ends_at = Some(ends_at);
        self
    }

    /// Returns the namespace label, if any.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.labels.get(NAMESPACE_LABEL).map(String::as_str)
    }

    /// Returns the severity carried by the alert's own label, if it is a known value.
    #[must_use]
    pub fn label_severity(&self) -> Option<Severity> {
        self.labels.get(SEVERITY_LABEL).and_then(|v| Severity::parse(v))
    }
}

/// The outcome of classifying an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Assigned severity.
    pub severity: Severity,
    /// Confidence in the assignment, within `[0, 1]` once normalized.
    pub confidence: f64,
    /// Human-readable explanation.
    pub reasoning: String,
    /// Suggested actions, most relevant first.
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// Wall time spent producing the result, in milliseconds.
    #[serde(default)]
    pub processing_time_ms: u64,
    /// Free-form details supplied by the classifier.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ClassificationResult {
    /// Creates a new result.
    #[must_use]
    pub fn new(severity: Severity, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            severity,
            confidence,
            reasoning: reasoning.into(),
            recommendations: Vec::new(),
            processing_time_ms: 0,
            metadata: HashMap::new(),
        }
    }

    /// Adds a recommendation.
    #[must_use]
    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendations.push(recommendation.into());
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Clamps confidence to `[0, 1]`, fills empty reasoning, and caps recommendations.
    ///
    /// A NaN confidence is treated as zero.
    pub fn normalize(&mut self) {
        self.confidence = if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        };
        if self.reasoning.trim().is_empty() {
            self.reasoning = DEFAULT_REASONING.to_string();
        }
        self.recommendations.truncate(MAX_RECOMMENDATIONS);
    }

    /// Consumes and returns the normalized result.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }
}

/// An alert paired with its classification, as it moves through one pipeline pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedAlert {
    /// The original alert.
    pub alert: Alert,
    /// Classification, absent when the classifier is disabled.
    pub classification: Option<ClassificationResult>,
    /// Pipeline metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// When enrichment happened.
    pub enriched_at: DateTime<Utc>,
}

impl EnrichedAlert {
    /// Wraps an alert with an optional classification.
    #[must_use]
    pub fn new(alert: Alert, classification: Option<ClassificationResult>) -> Self {
        Self {
            alert,
            classification,
            metadata: HashMap::new(),
            enriched_at: Utc::now(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Severity to route on: the classification's if present, otherwise the alert's label.
    #[must_use]
    pub fn effective_severity(&self) -> Option<Severity> {
        self.classification
            .as_ref()
            .map(|c| c.severity)
            .or_else(|| self.alert.label_severity())
    }

    /// Confidence of the classification, if any.
    #[must_use]
    pub fn confidence(&self) -> Option<f64> {
        self.classification.as_ref().map(|c| c.confidence)
    }
}

/// Payload format expected by a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    /// Alertmanager webhook receiver envelope.
    Alertmanager,
    /// Rootly alert event.
    Rootly,
    /// PagerDuty Events API v2.
    Pagerduty,
    /// Slack incoming webhook message.
    Slack,
    /// The enriched alert as plain JSON.
    #[default]
    Webhook,
}

impl TargetFormat {
    /// All formats, in table order.
    pub const ALL: [Self; 5] = [
        Self::Alertmanager,
        Self::Rootly,
        Self::Pagerduty,
        Self::Slack,
        Self::Webhook,
    ];

    /// Returns the format as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Alertmanager => "alertmanager",
            Self::Rootly => "rootly",
            Self::Pagerduty => "pagerduty",
            Self::Slack => "slack",
            Self::Webhook => "webhook",
        }
    }

    /// Position of this format in [`Self::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Alertmanager => 0,
            Self::Rootly => 1,
            Self::Pagerduty => 2,
            Self::Slack => 3,
            Self::Webhook => 4,
        }
    }
}

impl std::fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Eligibility filter embedded in a target definition.
///
/// Empty allow-lists allow everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Severities the target accepts.
    pub severities: Vec<Severity>,
    /// Namespaces the target accepts.
    pub namespaces: Vec<String>,
    /// Minimum classification confidence.
    pub min_confidence: Option<f64>,
    /// Reject alerts classified as noise.
    pub exclude_noise: bool,
    /// Regex the alert name must match.
    pub alert_name_pattern: Option<String>,
}

impl FilterConfig {
    /// Returns true if no criterion is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.severities.is_empty()
            && self.namespaces.is_empty()
            && self.min_confidence.is_none()
            && !self.exclude_noise
            && self.alert_name_pattern.is_none()
    }
}

/// A downstream destination for alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishingTarget {
    /// Unique name within the active target set.
    pub name: String,
    /// Delivery URL.
    pub url: String,
    /// Payload format.
    #[serde(default)]
    pub format: TargetFormat,
    /// Whether alerts are delivered to this target.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Extra HTTP headers sent with every delivery.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Eligibility filter.
    #[serde(default)]
    pub filter_config: FilterConfig,
}

const fn default_enabled() -> bool {
    true
}

impl PublishingTarget {
    /// Creates an enabled target with no filter.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>, format: TargetFormat) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            format,
            enabled: true,
            headers: HashMap::new(),
            filter_config: FilterConfig::default(),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the filter.
    #[must_use]
    pub fn with_filter(mut self, filter_config: FilterConfig) -> Self {
        self.filter_config = filter_config;
        self
    }

    /// Sets whether the target is enabled.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Checks the definition is usable.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::InvalidTarget` if the name or URL is empty, or the
    /// minimum confidence lies outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RouterError::InvalidTarget {
                reason: "target name cannot be empty".to_string(),
            });
        }
        if self.url.trim().is_empty() {
            return Err(RouterError::InvalidTarget {
                reason: format!("target '{}' has an empty url", self.name),
            });
        }
        if let Some(min) = self.filter_config.min_confidence {
            if !(0.0..=1.0).contains(&min) {
                return Err(RouterError::InvalidTarget {
                    reason: format!(
                        "target '{}' min_confidence {min} is outside [0, 1]",
                        self.name
                    ),
                });
            }
        }
        Ok(())
    }
}
