//! Alert classification with caching and heuristic fallback.
//!
//! [`ClassificationService::classify`] never fails. A cached result is
//! returned when present; otherwise the classifier is consulted with a
//! context summarizing earlier alerts of the same name, and the normalized
//! result is written through to the cache and to storage. Any classifier
//! failure, including a timeout, yields a heuristic fallback result instead.
//!
//! Concurrent requests for the same fingerprint share a single classifier
//! call: the first caller computes, later callers await its result.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClassificationConfig;
use crate::error::{Result, RouterError};
use crate::memory::NoopMetrics;
use crate::ports::{
    AlertQuery, Cache, ClassificationContext, Classifier, HistoricalPattern, Metrics, Storage,
    metric_names,
};
use crate::types::{Alert, AlertStatus, ClassificationResult, Severity};

/// Prefix of classification cache keys.
pub const CACHE_KEY_PREFIX: &str = "classification:";

/// Alert-name fragments that escalate a fallback to critical.
const OUTAGE_KEYWORDS: [&str; 4] = ["down", "failed", "critical", "outage"];

const FALLBACK_DEFAULT_CONFIDENCE: f64 = 0.1;
const FALLBACK_LABEL_CONFIDENCE: f64 = 0.3;
const FALLBACK_KEYWORD_CONFIDENCE: f64 = 0.4;

/// Returns the cache key for a fingerprint.
#[must_use]
pub fn cache_key(fingerprint: &str) -> String {
    format!("{CACHE_KEY_PREFIX}{fingerprint}")
}

/// Snapshot of classification counters and derived rates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationStats {
    /// Calls to `classify`.
    pub total_requests: u64,
    /// Requests answered from the cache.
    pub cache_hits: u64,
    /// Calls made to the classifier.
    pub llm_calls: u64,
    /// Requests answered with a fallback result.
    pub fallbacks: u64,
    /// Classifier failures.
    pub errors: u64,
    /// Requests that awaited another caller's in-flight classification.
    pub coalesced: u64,
    /// `cache_hits / total_requests`.
    pub cache_hit_rate: f64,
    /// `fallbacks / total_requests`.
    pub fallback_rate: f64,
    /// `errors / total_requests`.
    pub error_rate: f64,
}

#[derive(Debug, Default)]
struct ClassificationCounters {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    llm_calls: AtomicU64,
    fallbacks: AtomicU64,
    errors: AtomicU64,
    coalesced: AtomicU64,
}

impl ClassificationCounters {
    fn snapshot(&self) -> ClassificationStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let fallbacks = self.fallbacks.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        ClassificationStats {
            total_requests,
            cache_hits,
            llm_calls: self.llm_calls.load(Ordering::Relaxed),
            fallbacks,
            errors,
            coalesced: self.coalesced.load(Ordering::Relaxed),
            cache_hit_rate: ratio(cache_hits, total_requests),
            fallback_rate: ratio(fallbacks, total_requests),
            error_rate: ratio(errors, total_requests),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

type InFlight = Arc<OnceCell<ClassificationResult>>;

/// Where a caller's result came from once it reached the in-flight map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Joined,
    Cache,
    Computed,
}

/// Classifies alerts through the classifier port.
#[derive(Debug)]
pub struct ClassificationService {
    classifier: Arc<dyn Classifier>,
    cache: Arc<dyn Cache>,
    storage: Option<Arc<dyn Storage>>,
    metrics: Arc<dyn Metrics>,
    config: ClassificationConfig,
    in_flight: Mutex<HashMap<String, InFlight>>,
    counters: ClassificationCounters,
}

impl ClassificationService {
    /// Creates a service without storage; historical context is skipped.
    #[must_use]
    pub fn new(
        classifier: Arc<dyn Classifier>,
        cache: Arc<dyn Cache>,
        config: ClassificationConfig,
    ) -> Self {
        Self {
            classifier,
            cache,
            storage: None,
            metrics: Arc::new(NoopMetrics),
            config,
            in_flight: Mutex::new(HashMap::new()),
            counters: ClassificationCounters::default(),
        }
    }

    /// Sets the storage used for history lookups and persisting results.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Whether classification is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ClassificationConfig {
        &self.config
    }

    /// Classifies an alert.
    ///
    /// Unless `force_refresh` is set, a cached result is returned when one
    /// exists. Never fails: classifier errors produce a fallback result.
    pub async fn classify(
        &self,
        alert: &Alert,
        context: Option<ClassificationContext>,
        force_refresh: bool,
    ) -> ClassificationResult {
        let started = Instant::now();
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        if !force_refresh {
            if let Some(result) = self.cached(&alert.fingerprint).await {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %alert.fingerprint, "classification cache hit");
                self.observe(started, "cache_hit");
                return result;
            }
        }

        let cell = {
            let mut in_flight = self.in_flight.lock();
            Arc::clone(in_flight.entry(alert.fingerprint.clone()).or_default())
        };

        let mut origin = Origin::Joined;
        let origin_slot = &mut origin;
        let result = cell
            .get_or_init(move || async move {
                // A caller that finished after our first lookup has already
                // stored its result and left the in-flight map.
                if !force_refresh {
                    if let Some(result) = self.cached(&alert.fingerprint).await {
                        *origin_slot = Origin::Cache;
                        return result;
                    }
                }
                *origin_slot = Origin::Computed;
                self.compute(alert, context).await
            })
            .await
            .clone();

        {
            let mut in_flight = self.in_flight.lock();
            if in_flight
                .get(&alert.fingerprint)
                .is_some_and(|current| Arc::ptr_eq(current, &cell))
            {
                in_flight.remove(&alert.fingerprint);
            }
        }

        match origin {
            Origin::Computed => {}
            Origin::Cache => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %alert.fingerprint, "classification cache hit on recheck");
                self.observe(started, "cache_hit");
            }
            Origin::Joined => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %alert.fingerprint, "joined in-flight classification");
                self.observe(started, "coalesced");
            }
        }
        result
    }

    /// Classifies many alerts with at most `max_parallel` in flight.
    ///
    /// Results are returned in input order. A failing alert gets a fallback
    /// result and does not affect the others.
    pub async fn bulk_classify(
        &self,
        alerts: &[Alert],
        max_parallel: usize,
    ) -> Vec<ClassificationResult> {
        let limiter = Semaphore::new(max_parallel.max(1));
        let limiter = &limiter;
        let tasks = alerts.iter().map(|alert| async move {
            let _permit = limiter.acquire().await.ok();
            self.classify(alert, None, false).await
        });
        let results = join_all(tasks).await;
        info!(
            count = results.len(),
            max_parallel = max_parallel.max(1),
            "bulk classification complete"
        );
        results
    }

    /// Drops the cached result for a fingerprint.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Cache` if the cache backend fails.
    pub async fn invalidate(&self, fingerprint: &str) -> Result<()> {
        self.cache.delete(&cache_key(fingerprint)).await?;
        debug!(fingerprint = %fingerprint, "classification cache entry invalidated");
        Ok(())
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> ClassificationStats {
        self.counters.snapshot()
    }

    async fn cached(&self, fingerprint: &str) -> Option<ClassificationResult> {
        match self.cache.get(&cache_key(fingerprint)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(fingerprint = %fingerprint, error = %e, "discarding unreadable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    async fn compute(
        &self,
        alert: &Alert,
        context: Option<ClassificationContext>,
    ) -> ClassificationResult {
        let started = Instant::now();
        match self.call_classifier(alert, context).await {
            Ok(mut result) => {
                result.processing_time_ms = elapsed_ms(started);
                self.store(&alert.fingerprint, &result).await;
                self.observe(started, "llm");
                result
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    fingerprint = %alert.fingerprint,
                    alert_name = %alert.name,
                    error = %e,
                    "classification failed, using fallback"
                );
                let mut result = fallback_classification(alert, &e);
                result.processing_time_ms = elapsed_ms(started);
                self.observe(started, "fallback");
                result
            }
        }
    }

    async fn call_classifier(
        &self,
        alert: &Alert,
        context: Option<ClassificationContext>,
    ) -> Result<ClassificationResult> {
        let mut context = context.unwrap_or_default();
        if self.config.use_history && context.historical.is_none() {
            context.historical = self.historical_pattern(alert).await;
        }

        self.counters.llm_calls.fetch_add(1, Ordering::Relaxed);
        let timeout = self.config.classifier_timeout();
        let mut result = tokio::time::timeout(timeout, self.classifier.classify(alert, &context))
            .await
            .map_err(|_| RouterError::Timeout {
                operation: "classification".to_string(),
            })??
            .normalized();

        if result.recommendations.is_empty() {
            let generated = tokio::time::timeout(
                timeout,
                self.classifier.generate_recommendations(alert, &result),
            )
            .await;
            match generated {
                Ok(Ok(recommendations)) => {
                    result.recommendations = recommendations;
                    result.normalize();
                }
                Ok(Err(e)) => {
                    warn!(fingerprint = %alert.fingerprint, error = %e, "recommendation generation failed");
                }
                Err(_) => {
                    warn!(fingerprint = %alert.fingerprint, "recommendation generation timed out");
                }
            }
        }
        Ok(result)
    }

    async fn historical_pattern(&self, alert: &Alert) -> Option<HistoricalPattern> {
        let storage = self.storage.as_ref()?;
        let query = AlertQuery::by_name(&alert.name).with_limit(self.config.history_limit);
        match storage.get_alerts(&query).await {
            Ok(history) => summarize_history(&history),
            Err(e) => {
                warn!(alert_name = %alert.name, error = %e, "history lookup failed, classifying without it");
                None
            }
        }
    }

    async fn store(&self, fingerprint: &str, result: &ClassificationResult) {
        match serde_json::to_string(result) {
            Ok(encoded) => {
                if let Err(e) = self
                    .cache
                    .set(&cache_key(fingerprint), encoded, self.config.cache_ttl())
                    .await
                {
                    warn!(fingerprint = %fingerprint, error = %e, "failed to cache classification");
                }
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "failed to encode classification");
            }
        }

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_classification(fingerprint, result).await {
                warn!(fingerprint = %fingerprint, error = %e, "failed to persist classification");
            }
        }
    }

    fn observe(&self, started: Instant, outcome: &str) {
        self.metrics.increment_counter(
            metric_names::CLASSIFICATION_REQUESTS,
            &[("outcome", outcome)],
        );
        self.metrics.observe_histogram(
            metric_names::CLASSIFICATION_DURATION,
            started.elapsed().as_secs_f64(),
            &[("outcome", outcome)],
        );
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Summarizes earlier alerts sharing a name.
///
/// Returns `None` when there is no history.
#[must_use]
pub fn summarize_history(history: &[Alert]) -> Option<HistoricalPattern> {
    if history.is_empty() {
        return None;
    }

    let cutoff = Utc::now() - ChronoDuration::hours(24);
    let recent_24h_count = history.iter().filter(|a| a.starts_at >= cutoff).count();
    let firing = history
        .iter()
        .filter(|a| a.status == AlertStatus::Firing)
        .count();

    let mut label_counts: HashMap<String, usize> = HashMap::new();
    for alert in history {
        for (key, value) in &alert.labels {
            *label_counts.entry(format!("{key}={value}")).or_insert(0) += 1;
        }
    }
    let mut common_labels: Vec<String> = label_counts
        .into_iter()
        .filter(|(_, count)| count * 2 >= history.len())
        .map(|(label, _)| label)
        .collect();
    common_labels.sort_unstable();

    Some(HistoricalPattern {
        frequency: history.len(),
        recent_24h_count,
        firing_ratio: ratio(firing as u64, history.len() as u64),
        common_labels,
    })
}

/// Builds the heuristic result used when the classifier cannot be used.
///
/// Starts at warning with low confidence, trusts a known severity label
/// somewhat more, and escalates to critical when the alert name reads like
/// an outage.
#[must_use]
pub fn fallback_classification(alert: &Alert, error: &RouterError) -> ClassificationResult {
    let name = alert.name.to_ascii_lowercase();
    let (severity, confidence, basis) = if OUTAGE_KEYWORDS.iter().any(|k| name.contains(k)) {
        (
            Severity::Critical,
            FALLBACK_KEYWORD_CONFIDENCE,
            "alert name indicates an outage",
        )
    } else if let Some(severity) = alert.label_severity() {
        (severity, FALLBACK_LABEL_CONFIDENCE, "severity label")
    } else {
        (
            Severity::Warning,
            FALLBACK_DEFAULT_CONFIDENCE,
            "default severity",
        )
    };

    ClassificationResult::new(
        severity,
        confidence,
        format!("fallback classification from {basis}: {error}"),
    )
    .with_metadata("fallback", serde_json::Value::Bool(true))
}
