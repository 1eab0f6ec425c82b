//! In-process implementations of the ports.
//!
//! These back the engines when no external store is configured and make the
//! pipeline testable without network services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, RouterError};
use crate::ports::{AlertQuery, Cache, Metrics, Storage, TargetSource};
use crate::types::{Alert, ClassificationResult, PublishingTarget};

/// A cache held in process memory.
///
/// Expired entries are dropped lazily when read. A TTL too large to
/// represent keeps the entry until it is deleted.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, (String, Option<Instant>)>>,
}

impl InMemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Cache for InMemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let now = Instant::now();
            {
                let entries = self.entries.read();
                match entries.get(key) {
                    None => return Ok(None),
                    Some((value, expires_at)) if expires_at.is_none_or(|t| t > now) => {
                        return Ok(Some(value.clone()));
                    }
                    Some(_) => {}
                }
            }
            debug!(key = %key, "cache entry expired");
            self.entries.write().remove(key);
            Ok(None)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let expires_at = Instant::now().checked_add(ttl);
            self.entries
                .write()
                .insert(key.to_string(), (value, expires_at));
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries.write().remove(key);
            Ok(())
        })
    }
}

/// Alert and classification storage held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    alerts: RwLock<Vec<Alert>>,
    classifications: RwLock<HashMap<String, ClassificationResult>>,
}

impl InMemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observed alert.
    pub fn record_alert(&self, alert: Alert) {
        self.alerts.write().push(alert);
    }

    /// Number of stored classifications.
    #[must_use]
    pub fn classification_count(&self) -> usize {
        self.classifications.read().len()
    }
}

impl Storage for InMemoryStorage {
    fn get_alert<'a>(&'a self, fingerprint: &'a str) -> BoxFuture<'a, Result<Option<Alert>>> {
        Box::pin(async move {
            let alerts = self.alerts.read();
            Ok(alerts
                .iter()
                .rev()
                .find(|a| a.fingerprint == fingerprint)
                .cloned())
        })
    }

    fn get_alerts<'a>(&'a self, query: &'a AlertQuery) -> BoxFuture<'a, Result<Vec<Alert>>> {
        Box::pin(async move {
            let alerts = self.alerts.read();
            let limit = query.limit.unwrap_or(usize::MAX);
            Ok(alerts
                .iter()
                .rev()
                .filter(|a| query.matches(a))
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn save_classification<'a>(
        &'a self,
        fingerprint: &'a str,
        result: &'a ClassificationResult,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.classifications
                .write()
                .insert(fingerprint.to_string(), result.clone());
            Ok(())
        })
    }

    fn get_classification<'a>(
        &'a self,
        fingerprint: &'a str,
    ) -> BoxFuture<'a, Result<Option<ClassificationResult>>> {
        Box::pin(async move { Ok(self.classifications.read().get(fingerprint).cloned()) })
    }
}

/// A target source whose contents are set programmatically.
///
/// Useful for fixed deployments and for simulating discovery outages.
#[derive(Debug, Default)]
pub struct StaticTargetSource {
    targets: RwLock<Vec<PublishingTarget>>,
    unavailable: AtomicBool,
    discover_calls: AtomicU64,
}

impl StaticTargetSource {
    /// Creates a source serving the given targets.
    #[must_use]
    pub fn new(targets: Vec<PublishingTarget>) -> Self {
        Self {
            targets: RwLock::new(targets),
            unavailable: AtomicBool::new(false),
            discover_calls: AtomicU64::new(0),
        }
    }

    /// Replaces the served targets.
    pub fn set_targets(&self, targets: Vec<PublishingTarget>) {
        *self.targets.write() = targets;
    }

    /// Makes subsequent discoveries fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of times `discover` has been called.
    #[must_use]
    pub fn discover_calls(&self) -> u64 {
        self.discover_calls.load(Ordering::SeqCst)
    }
}

impl TargetSource for StaticTargetSource {
    fn discover(&self) -> BoxFuture<'_, Result<Vec<PublishingTarget>>> {
        Box::pin(async move {
            self.discover_calls.fetch_add(1, Ordering::SeqCst);
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(RouterError::Discovery {
                    reason: "target source unavailable".to_string(),
                });
            }
            Ok(self.targets.read().clone())
        })
    }
}

/// A metrics sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn increment_counter(&self, _name: &str, _labels: &[(&str, &str)]) {}

    fn observe_histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}

    fn set_gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

/// A metrics sink that keeps the latest values in memory.
///
/// Series are keyed Prometheus-style as `name{k="v",...}` with labels sorted.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<String, u64>>,
    gauges: RwLock<HashMap<String, f64>>,
    histograms: RwLock<HashMap<String, Vec<f64>>>,
}

impl MetricsRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter series, zero if never incremented.
    #[must_use]
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter across all label sets.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .read()
            .iter()
            .filter(|(k, _)| series_name(k) == name)
            .map(|(_, v)| *v)
            .sum()
    }

    /// Current value of a gauge series.
    #[must_use]
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.read().get(&series_key(name, labels)).copied()
    }

    /// Number of observations recorded for a histogram series.
    #[must_use]
    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> usize {
        self.histograms
            .read()
            .get(&series_key(name, labels))
            .map_or(0, Vec::len)
    }
}

impl Metrics for MetricsRecorder {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        *self
            .counters
            .write()
            .entry(series_key(name, labels))
            .or_insert(0) += 1;
    }

    fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.histograms
            .write()
            .entry(series_key(name, labels))
            .or_default()
            .push(value);
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.gauges.write().insert(series_key(name, labels), value);
    }
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_unstable();
    let rendered: Vec<String> = sorted
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    format!("{name}{{{}}}", rendered.join(","))
}

fn series_name(key: &str) -> &str {
    key.split('{').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertStatus, Severity, TargetFormat};

    mod cache_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn set_then_get() {
            let cache = InMemoryCache::new();
            cache
                .set("k", "v".to_string(), Duration::from_secs(10))
                .await
                .unwrap();

            assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
            assert_eq!(cache.len(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn entries_expire() {
            let cache = InMemoryCache::new();
            cache
                .set("k", "v".to_string(), Duration::from_secs(10))
                .await
                .unwrap();

            tokio::time::advance(Duration::from_secs(11)).await;

            assert_eq!(cache.get("k").await.unwrap(), None);
            assert!(cache.is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn unrepresentable_ttl_never_expires() {
            let cache = InMemoryCache::new();
            cache.set("k", "v".to_string(), Duration::MAX).await.unwrap();

            tokio::time::advance(Duration::from_secs(10 * 365 * 24 * 3600)).await;

            assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        }

        #[tokio::test]
        async fn delete_removes() {
            let cache = InMemoryCache::new();
            cache
                .set("k", "v".to_string(), Duration::from_secs(10))
                .await
                .unwrap();
            cache.delete("k").await.unwrap();

            assert_eq!(cache.get("k").await.unwrap(), None);
        }
    }

    mod storage_tests {
        use super::*;

        #[tokio::test]
        async fn get_alerts_newest_first_with_limit() {
            let storage = InMemoryStorage::new();
            for i in 0..5 {
                storage.record_alert(Alert::new(format!("fp-{i}"), "HighCPU"));
            }
            storage.record_alert(Alert::new("other", "DiskFull"));

            let query = AlertQuery::by_name("HighCPU").with_limit(3);
            let alerts = storage.get_alerts(&query).await.unwrap();

            assert_eq!(alerts.len(), 3);
            assert_eq!(alerts[0].fingerprint, "fp-4");
        }

        #[tokio::test]
        async fn get_alert_returns_latest_observation() {
            let storage = InMemoryStorage::new();
            let firing = Alert::new("fp", "HighCPU");
            storage.record_alert(firing.clone());
            storage.record_alert(firing.resolved_at(chrono::Utc::now()));

            let alert = storage.get_alert("fp").await.unwrap().unwrap();
            assert_eq!(alert.status, AlertStatus::Resolved);
        }

        #[tokio::test]
        async fn classification_round_trip() {
            let storage = InMemoryStorage::new();
            let result = ClassificationResult::new(Severity::Critical, 0.8, "cpu");
            storage.save_classification("fp", &result).await.unwrap();

            assert_eq!(
                storage.get_classification("fp").await.unwrap(),
                Some(result)
            );
            assert_eq!(storage.classification_count(), 1);
        }
    }

    mod target_source_tests {
        use super::*;

        #[tokio::test]
        async fn serves_and_fails_on_demand() {
            let source = StaticTargetSource::new(vec![PublishingTarget::new(
                "slack",
                "http://slack",
                TargetFormat::Slack,
            )]);

            assert_eq!(source.discover().await.unwrap().len(), 1);

            source.set_unavailable(true);
            assert!(matches!(
                source.discover().await,
                Err(RouterError::Discovery { .. })
            ));
            assert_eq!(source.discover_calls(), 2);
        }
    }

    mod metrics_tests {
        use super::*;

        #[test]
        fn labels_are_order_independent() {
            let recorder = MetricsRecorder::new();
            recorder.increment_counter("c", &[("a", "1"), ("b", "2")]);
            recorder.increment_counter("c", &[("b", "2"), ("a", "1")]);

            assert_eq!(recorder.counter("c", &[("a", "1"), ("b", "2")]), 2);
        }

        #[test]
        fn counter_total_sums_series() {
            let recorder = MetricsRecorder::new();
            recorder.increment_counter("c", &[("target", "a")]);
            recorder.increment_counter("c", &[("target", "b")]);
            recorder.increment_counter("other", &[]);

            assert_eq!(recorder.counter_total("c"), 2);
        }

        #[test]
        fn gauges_and_histograms() {
            let recorder = MetricsRecorder::new();
            recorder.set_gauge("g", 3.0, &[]);
            recorder.set_gauge("g", 4.0, &[]);
            recorder.observe_histogram("h", 0.1, &[("t", "x")]);

            assert_eq!(recorder.gauge("g", &[]), Some(4.0));
            assert_eq!(recorder.histogram_count("h", &[("t", "x")]), 1);
        }
    }
}
