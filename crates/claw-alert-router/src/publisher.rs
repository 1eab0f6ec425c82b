//! Delivery of enriched alerts to publishing targets.
//!
//! The [`Publisher`] owns one [`CircuitBreaker`] and one [`PublishingStats`]
//! record per target name, created on first use and kept until
//! [`Publisher::retain_targets`] drops targets that are no longer configured.
//! Each record sits behind its own mutex so concurrent publish tasks
//! never interleave a breaker check with an update.
//!
//! A single publish goes through these steps:
//!
//! 1. Skip disabled targets and alerts the [`FilterEngine`] rejects
//! 2. Wait out any delay the filter asked for
//! 3. Skip, counting a block, if the target's breaker rejects the call
//! 4. Take a slot from the process-wide concurrency limiter
//! 5. Format the payload and send it, retrying transient failures with
//!    exponential backoff
//! 6. Record the outcome in the breaker and the stats
//!
//! Every publish is tracked so [`Publisher::shutdown`] can cancel the ones in
//! flight and wait for them before the transport is closed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{CircuitBreakerConfig, PublisherConfig};
use crate::error::{Result, RouterError};
use crate::filter::FilterEngine;
use crate::formatter::format_alert;
use crate::memory::NoopMetrics;
use crate::ports::{Metrics, Transport, TransportRequest, metric_names};
use crate::types::{EnrichedAlert, PublishingTarget};

/// Delivery counters for one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishingStats {
    /// Deliveries that reached the transport.
    pub total_attempts: u64,
    /// Deliveries that succeeded.
    pub successes: u64,
    /// Deliveries that failed after all retries.
    pub failures: u64,
    /// Deliveries skipped because the circuit was open.
    pub circuit_breaker_blocks: u64,
    /// When the last success happened.
    pub last_success_time: Option<DateTime<Utc>>,
    /// When the last failure happened.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Running average delivery latency in milliseconds, retries included.
    pub avg_latency_ms: f64,
}

impl PublishingStats {
    /// `successes / total_attempts`, or 0 when nothing was attempted.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.total_attempts as f64
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record(&mut self, success: bool, latency: Duration) {
        self.total_attempts += 1;
        let now = Utc::now();
        if success {
            self.successes += 1;
            self.last_success_time = Some(now);
        } else {
            self.failures += 1;
            self.last_failure_time = Some(now);
        }
        let sample = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms += (sample - self.avg_latency_ms) / self.total_attempts as f64;
    }
}

#[derive(Debug)]
struct TargetState {
    breaker: CircuitBreaker,
    stats: PublishingStats,
}

type SharedTargetState = Arc<Mutex<TargetState>>;

/// A call the breaker let through. If the publish is dropped before its
/// outcome is recorded, the half-open trial slot is handed back.
struct Admission<'a> {
    state: &'a SharedTargetState,
    settled: bool,
}

impl<'a> Admission<'a> {
    const fn new(state: &'a SharedTargetState) -> Self {
        Self {
            state,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.state.lock().breaker.release_half_open();
        }
    }
}

/// Publishes enriched alerts to targets.
#[derive(Debug)]
pub struct Publisher {
    filter: Arc<FilterEngine>,
    transport: Arc<dyn Transport>,
    metrics: Arc<dyn Metrics>,
    config: PublisherConfig,
    breaker_config: CircuitBreakerConfig,
    targets: Mutex<HashMap<String, SharedTargetState>>,
    limiter: Semaphore,
    tracker: TaskTracker,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Publisher {
    /// Creates a publisher.
    #[must_use]
    pub fn new(
        filter: Arc<FilterEngine>,
        transport: Arc<dyn Transport>,
        config: PublisherConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let limiter = Semaphore::new(config.max_concurrent.max(1));
        Self {
            filter,
            transport,
            metrics: Arc::new(NoopMetrics),
            config,
            breaker_config,
            targets: Mutex::new(HashMap::new()),
            limiter,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Uses the given token to cancel in-flight publishes.
    ///
    /// Pass a child of a wider shutdown token to stop the publisher together
    /// with other background work.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    // ============ Publishing ============

    /// Publishes an alert to one target.
    ///
    /// Returns true only if the target acknowledged the delivery. Skips,
    /// blocks and failures all return false.
    pub async fn publish(&self, enriched: &EnrichedAlert, target: &PublishingTarget) -> bool {
        let work = async {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    debug!(target_name = %target.name, "publish cancelled");
                    false
                }
                delivered = self.publish_inner(enriched, target) => delivered,
            }
        };
        self.tracker.track_future(work).await
    }

    /// Publishes an alert to every enabled target concurrently.
    ///
    /// Each target runs in its own task; a slow, failing or panicking target
    /// does not affect the others. Disabled targets are left out of the result.
    pub async fn publish_to_multiple(
        self: &Arc<Self>,
        enriched: &EnrichedAlert,
        targets: &[PublishingTarget],
    ) -> HashMap<String, bool> {
        let enriched = Arc::new(enriched.clone());
        let handles: Vec<_> = targets
            .iter()
            .filter(|t| t.enabled)
            .map(|target| {
                let publisher = Arc::clone(self);
                let enriched = Arc::clone(&enriched);
                let target = target.clone();
                let name = target.name.clone();
                let handle = self
                    .tracker
                    .spawn(async move { publisher.publish(&enriched, &target).await });
                (name, handle)
            })
            .collect();

        let results = join_all(handles.into_iter().map(|(name, handle)| async move {
            let delivered = match handle.await {
                Ok(delivered) => delivered,
                Err(e) => {
                    warn!(target_name = %name, error = %e, "publish task failed");
                    false
                }
            };
            (name, delivered)
        }))
        .await;

        results.into_iter().collect()
    }

    async fn publish_inner(&self, enriched: &EnrichedAlert, target: &PublishingTarget) -> bool {
        if !target.enabled {
            debug!(target_name = %target.name, "target disabled, skipping");
            return false;
        }

        let decision = self.filter.should_publish(enriched, target);
        if !decision.allow {
            debug!(
                target_name = %target.name,
                fingerprint = %enriched.alert.fingerprint,
                reason = ?decision.reason,
                "filtered out"
            );
            return false;
        }
        if !decision.delay.is_zero() {
            debug!(
                target_name = %target.name,
                delay_secs = decision.delay.as_secs(),
                "delaying publish"
            );
            tokio::time::sleep(decision.delay).await;
        }

        let state = self.target_state(&target.name);
        let admitted = state.lock().breaker.can_execute();
        if !admitted {
            state.lock().stats.circuit_breaker_blocks += 1;
            self.metrics.increment_counter(
                metric_names::CIRCUIT_BREAKER_BLOCKS,
                &[("target", &target.name)],
            );
            debug!(target_name = %target.name, "circuit open, skipping publish");
            self.export_state(&target.name, &state);
            return false;
        }
        let admission = Admission::new(&state);

        let Ok(_permit) = self.limiter.acquire().await else {
            return false;
        };

        let started = Instant::now();
        let outcome = match encode(enriched, target) {
            Ok(body) => {
                let request = self.build_request(target, body);
                self.send_with_retry(&state, &request).await
            }
            Err(e) => Err(e),
        };
        let latency = started.elapsed();
        let labels = [("target", target.name.as_str())];
        self.metrics
            .observe_histogram(metric_names::PUBLISH_DURATION, latency.as_secs_f64(), &labels);

        let delivered = outcome.is_ok();
        {
            let mut guard = state.lock();
            if delivered {
                guard.breaker.record_success();
            } else {
                guard.breaker.record_failure();
            }
            guard.stats.record(delivered, latency);
        }
        admission.settle();
        self.export_state(&target.name, &state);

        match outcome {
            Ok(()) => {
                self.metrics
                    .increment_counter(metric_names::PUBLISH_SUCCESSES, &labels);
                debug!(
                    target_name = %target.name,
                    fingerprint = %enriched.alert.fingerprint,
                    latency_ms = latency.as_millis(),
                    "published"
                );
            }
            Err(e) => {
                self.metrics
                    .increment_counter(metric_names::PUBLISH_FAILURES, &labels);
                warn!(
                    target_name = %target.name,
                    fingerprint = %enriched.alert.fingerprint,
                    error = %e,
                    "publish failed"
                );
            }
        }
        delivered
    }

    fn build_request(&self, target: &PublishingTarget, body: Vec<u8>) -> TransportRequest {
        let mut headers = target.headers.clone();
        headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| "application/json".to_string());
        TransportRequest {
            target: target.name.clone(),
            method: "POST".to_string(),
            url: target.url.clone(),
            headers,
            body,
            timeout: self.config.request_timeout(),
        }
    }

    async fn send_with_retry(
        &self,
        state: &SharedTargetState,
        request: &TransportRequest,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            self.metrics.increment_counter(
                metric_names::PUBLISH_ATTEMPTS,
                &[("target", &request.target)],
            );
            let err = match self.send_once(request).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= self.config.max_attempts {
                return Err(err);
            }
            // Another task may have tripped the breaker meanwhile.
            let circuit = state.lock().breaker.state();
            if circuit == CircuitState::Open {
                return Err(err);
            }

            let backoff = self.config.backoff(attempt);
            debug!(
                target_name = %request.target,
                attempt,
                backoff_ms = backoff.as_millis(),
                error = %err,
                "retrying publish"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn send_once(&self, request: &TransportRequest) -> Result<()> {
        let response = tokio::time::timeout(request.timeout, self.transport.send(request))
            .await
            .map_err(|_| RouterError::Timeout {
                operation: format!("publish to '{}'", request.target),
            })??;

        if response.is_success() {
            Ok(())
        } else {
            Err(RouterError::HttpStatus {
                target: request.target.clone(),
                status: response.status,
            })
        }
    }

    fn target_state(&self, name: &str) -> SharedTargetState {
        let mut targets = self.targets.lock();
        Arc::clone(targets.entry(name.to_string()).or_insert_with(|| {
            debug!(target_name = %name, "creating circuit breaker");
            Arc::new(Mutex::new(TargetState {
                breaker: CircuitBreaker::new(name, self.breaker_config.clone()),
                stats: PublishingStats::default(),
            }))
        }))
    }

    fn export_state(&self, name: &str, state: &SharedTargetState) {
        let circuit = state.lock().breaker.state();
        self.metrics.set_gauge(
            metric_names::CIRCUIT_BREAKER_STATE,
            circuit.gauge_value(),
            &[("target", name)],
        );
    }

    // ============ Inspection ============

    /// Stats for one target, if it has been published to.
    #[must_use]
    pub fn stats(&self, target: &str) -> Option<PublishingStats> {
        let state = self.targets.lock().get(target).cloned()?;
        let stats = state.lock().stats.clone();
        Some(stats)
    }

    /// Stats for every target published to so far.
    #[must_use]
    pub fn all_stats(&self) -> HashMap<String, PublishingStats> {
        let targets: Vec<(String, SharedTargetState)> = self
            .targets
            .lock()
            .iter()
            .map(|(name, state)| (name.clone(), Arc::clone(state)))
            .collect();
        targets
            .into_iter()
            .map(|(name, state)| {
                let stats = state.lock().stats.clone();
                (name, stats)
            })
            .collect()
    }

    /// Circuit state for one target, if it has been published to.
    #[must_use]
    pub fn circuit_state(&self, target: &str) -> Option<CircuitState> {
        let state = self.targets.lock().get(target).cloned()?;
        let circuit = state.lock().breaker.state();
        Some(circuit)
    }

    /// Closes a target's circuit. Returns false if the target is unknown.
    pub fn reset_circuit_breaker(&self, target: &str) -> bool {
        let Some(state) = self.targets.lock().get(target).cloned() else {
            return false;
        };
        state.lock().breaker.reset();
        self.export_state(target, &state);
        info!(target_name = %target, "circuit breaker reset");
        true
    }

    /// Drops the breaker and stats of every target not in `targets`.
    ///
    /// Returns how many records were removed. A removed target that comes
    /// back later starts with a closed breaker and empty stats.
    pub fn retain_targets(&self, targets: &[PublishingTarget]) -> usize {
        let keep: HashSet<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        let mut states = self.targets.lock();
        let before = states.len();
        states.retain(|name, _| keep.contains(name.as_str()));
        let removed = before - states.len();
        if removed > 0 {
            info!(removed, remaining = states.len(), "dropped state of removed targets");
        }
        removed
    }

    /// Number of publishes currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &PublisherConfig {
        &self.config
    }

    // ============ Lifecycle ============

    /// Returns true once shutdown has begun.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cancels in-flight publishes, waits up to `grace` for them to stop,
    /// then closes the transport.
    ///
    /// Publishes started after this call return false immediately. Calling
    /// it again does nothing.
    pub async fn shutdown(&self, grace: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let in_flight = self.tracker.len();
        info!(in_flight, "publisher shutting down");

        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.tracker.len(),
                grace_secs = grace.as_secs(),
                "in-flight publishes did not stop within grace period"
            );
        }

        self.transport.close().await;
        info!("publisher stopped");
    }
}

fn encode(enriched: &EnrichedAlert, target: &PublishingTarget) -> Result<Vec<u8>> {
    let payload = format_alert(enriched, target)?;
    Ok(serde_json::to_vec(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterEngineConfig;
    use crate::filter::{FilterRule, RuleAction};
    use crate::memory::MetricsRecorder;
    use crate::ports::TransportResponse;
    use crate::types::{Alert, ClassificationResult, Severity, TargetFormat};
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Status(u16),
        Refused,
        Hang,
    }

    /// Transport scripted per target name; unscripted calls answer 200.
    #[derive(Debug, Default)]
    struct ScriptedTransport {
        latency: Duration,
        scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
        sticky: Mutex<HashMap<String, Outcome>>,
        calls: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        closed: AtomicBool,
    }

    impl ScriptedTransport {
        fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Self::default()
            }
        }

        fn script(self, target: &str, outcomes: &[Outcome]) -> Self {
            self.scripts
                .lock()
                .insert(target.to_string(), outcomes.iter().copied().collect());
            self
        }

        fn always(self, target: &str, outcome: Outcome) -> Self {
            self.sticky.lock().insert(target.to_string(), outcome);
            self
        }

        fn calls(&self, target: &str) -> usize {
            self.calls.lock().get(target).copied().unwrap_or(0)
        }
    }

    impl Transport for ScriptedTransport {
        fn send<'a>(
            &'a self,
            request: &'a TransportRequest,
        ) -> BoxFuture<'a, Result<TransportResponse>> {
            Box::pin(async move {
                *self.calls.lock().entry(request.target.clone()).or_insert(0) += 1;
                let outcome = self
                    .scripts
                    .lock()
                    .get_mut(&request.target)
                    .and_then(VecDeque::pop_front)
                    .or_else(|| self.sticky.lock().get(&request.target).copied())
                    .unwrap_or(Outcome::Status(200));

                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.latency).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                match outcome {
                    Outcome::Status(status) => Ok(TransportResponse::new(status)),
                    Outcome::Refused => Err(RouterError::Transport {
                        target: request.target.clone(),
                        reason: "connection refused".to_string(),
                    }),
                    Outcome::Hang => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(TransportResponse::new(200))
                    }
                }
            })
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.closed.store(true, Ordering::SeqCst);
            })
        }
    }

    fn publisher_with(
        transport: ScriptedTransport,
        config: PublisherConfig,
        breaker: CircuitBreakerConfig,
    ) -> (Arc<Publisher>, Arc<ScriptedTransport>, Arc<FilterEngine>) {
        let transport = Arc::new(transport);
        let filter = Arc::new(FilterEngine::new(&FilterEngineConfig::default()));
        let publisher = Publisher::new(filter.clone(), transport.clone(), config, breaker);
        (Arc::new(publisher), transport, filter)
    }

    fn publisher(transport: ScriptedTransport) -> (Arc<Publisher>, Arc<ScriptedTransport>) {
        let (publisher, transport, _) = publisher_with(
            transport,
            PublisherConfig::default(),
            CircuitBreakerConfig::default(),
        );
        (publisher, transport)
    }

    fn alert(fingerprint: &str) -> EnrichedAlert {
        EnrichedAlert::new(
            Alert::new(fingerprint, "HighErrorRate"),
            Some(ClassificationResult::new(Severity::Critical, 0.9, "errors")),
        )
    }

    fn target(name: &str) -> PublishingTarget {
        PublishingTarget::new(name, format!("http://{name}.example"), TargetFormat::Webhook)
    }

    mod single_target_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn successful_publish_records_stats() {
            let (publisher, transport) = publisher(ScriptedTransport::default());

            assert!(publisher.publish(&alert("fp-1"), &target("a")).await);

            let stats = publisher.stats("a").unwrap();
            assert_eq!(stats.total_attempts, 1);
            assert_eq!(stats.successes, 1);
            assert!((stats.success_rate() - 1.0).abs() < f64::EPSILON);
            assert!(stats.last_success_time.is_some());
            assert_eq!(transport.calls("a"), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn disabled_target_skipped() {
            let (publisher, transport) = publisher(ScriptedTransport::default());

            assert!(!publisher.publish(&alert("fp-1"), &target("a").enabled(false)).await);
            assert_eq!(transport.calls("a"), 0);
            assert!(publisher.stats("a").is_none());
        }

        #[tokio::test(start_paused = true)]
        async fn filtered_alert_not_sent() {
            let (publisher, transport) = publisher(ScriptedTransport::default());

            assert!(publisher.publish(&alert("fp-1"), &target("a")).await);
            assert!(!publisher.publish(&alert("fp-1"), &target("a")).await);
            assert_eq!(transport.calls("a"), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn transient_failures_retried() {
            let transport = ScriptedTransport::default()
                .script("a", &[Outcome::Status(503), Outcome::Refused]);
            let (publisher, transport) = publisher(transport);

            assert!(publisher.publish(&alert("fp-1"), &target("a")).await);
            assert_eq!(transport.calls("a"), 3);
            assert_eq!(publisher.stats("a").unwrap().successes, 1);
        }

        #[tokio::test(start_paused = true)]
        async fn retries_back_off_exponentially() {
            let transport = ScriptedTransport::default().always("a", Outcome::Status(500));
            let (publisher, _) = publisher(transport);

            let started = Instant::now();
            assert!(!publisher.publish(&alert("fp-1"), &target("a")).await);
            let elapsed = started.elapsed();
            assert!(elapsed >= Duration::from_millis(3000), "took {elapsed:?}");
            assert!(elapsed < Duration::from_millis(3100), "took {elapsed:?}");
        }

        #[tokio::test(start_paused = true)]
        async fn client_error_not_retried() {
            let transport = ScriptedTransport::default().always("a", Outcome::Status(400));
            let (publisher, transport) = publisher(transport);

            assert!(!publisher.publish(&alert("fp-1"), &target("a")).await);
            assert_eq!(transport.calls("a"), 1);
            let stats = publisher.stats("a").unwrap();
            assert_eq!(stats.failures, 1);
            assert!(stats.success_rate().abs() < f64::EPSILON);
        }

        #[tokio::test(start_paused = true)]
        async fn throttling_is_retried() {
            let transport = ScriptedTransport::default().script("a", &[Outcome::Status(429)]);
            let (publisher, transport) = publisher(transport);

            assert!(publisher.publish(&alert("fp-1"), &target("a")).await);
            assert_eq!(transport.calls("a"), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn request_timeout_counts_as_failure() {
            let transport = ScriptedTransport::default().always("a", Outcome::Hang);
            let config = PublisherConfig {
                max_attempts: 1,
                request_timeout_secs: 2,
                ..PublisherConfig::default()
            };
            let (publisher, _, _) =
                publisher_with(transport, config, CircuitBreakerConfig::default());

            let started = Instant::now();
            assert!(!publisher.publish(&alert("fp-1"), &target("a")).await);
            let elapsed = started.elapsed();
            assert!(elapsed >= Duration::from_secs(2), "took {elapsed:?}");
            assert!(elapsed < Duration::from_millis(2100), "took {elapsed:?}");
            assert_eq!(publisher.stats("a").unwrap().failures, 1);
        }

        #[tokio::test(start_paused = true)]
        async fn format_error_fails_without_sending() {
            let (publisher, transport) = publisher(ScriptedTransport::default());
            let pagerduty = PublishingTarget::new("pd", "http://pd", TargetFormat::Pagerduty);

            assert!(!publisher.publish(&alert("fp-1"), &pagerduty).await);
            assert_eq!(transport.calls("pd"), 0);
            assert_eq!(publisher.stats("pd").unwrap().failures, 1);
        }

        #[tokio::test(start_paused = true)]
        async fn delay_rule_waits_before_sending() {
            let (publisher, transport, filter) = publisher_with(
                ScriptedTransport::default(),
                PublisherConfig::default(),
                CircuitBreakerConfig::default(),
            );
            filter
                .add_rule(FilterRule::new("hold", RuleAction::Delay { seconds: 30 }))
                .unwrap();

            let started = Instant::now();
            assert!(publisher.publish(&alert("fp-1"), &target("a")).await);
            assert!(started.elapsed() >= Duration::from_secs(30));
            assert_eq!(transport.calls("a"), 1);
        }
    }

    mod circuit_tests {
        use super::*;

        fn tripping_publisher(
            transport: ScriptedTransport,
        ) -> (Arc<Publisher>, Arc<ScriptedTransport>) {
            let config = PublisherConfig {
                max_attempts: 1,
                ..PublisherConfig::default()
            };
            let breaker = CircuitBreakerConfig {
                failure_threshold: 2,
                timeout_secs: 60,
                half_open_max_calls: 1,
            };
            let (publisher, transport, _) = publisher_with(transport, config, breaker);
            (publisher, transport)
        }

        #[tokio::test(start_paused = true)]
        async fn open_circuit_blocks_without_sending() {
            let transport = ScriptedTransport::default().always("a", Outcome::Status(503));
            let (publisher, transport) = tripping_publisher(transport);

            publisher.publish(&alert("fp-1"), &target("a")).await;
            publisher.publish(&alert("fp-2"), &target("a")).await;
            assert_eq!(publisher.circuit_state("a"), Some(CircuitState::Open));

            assert!(!publisher.publish(&alert("fp-3"), &target("a")).await);
            assert_eq!(transport.calls("a"), 2);
            let stats = publisher.stats("a").unwrap();
            assert_eq!(stats.circuit_breaker_blocks, 1);
            assert_eq!(stats.total_attempts, 2);
        }

        #[tokio::test(start_paused = true)]
        async fn half_open_success_closes() {
            let transport = ScriptedTransport::default()
                .script("a", &[Outcome::Status(503), Outcome::Status(503)]);
            let (publisher, _) = tripping_publisher(transport);

            publisher.publish(&alert("fp-1"), &target("a")).await;
            publisher.publish(&alert("fp-2"), &target("a")).await;
            tokio::time::advance(Duration::from_secs(61)).await;

            assert!(publisher.publish(&alert("fp-3"), &target("a")).await);
            assert_eq!(publisher.circuit_state("a"), Some(CircuitState::Closed));
        }

        #[tokio::test(start_paused = true)]
        async fn abandoned_half_open_trial_does_not_wedge_breaker() {
            let transport =
                ScriptedTransport::default().script("a", &[Outcome::Status(503), Outcome::Hang]);
            let breaker = CircuitBreakerConfig {
                failure_threshold: 1,
                timeout_secs: 60,
                half_open_max_calls: 1,
            };
            let config = PublisherConfig {
                max_attempts: 1,
                ..PublisherConfig::default()
            };
            let (publisher, transport, _) = publisher_with(transport, config, breaker);

            publisher.publish(&alert("fp-1"), &target("a")).await;
            assert_eq!(publisher.circuit_state("a"), Some(CircuitState::Open));
            tokio::time::advance(Duration::from_secs(61)).await;

            // The trial call hangs and its caller gives up on it.
            let abandoned = tokio::time::timeout(
                Duration::from_secs(1),
                publisher.publish(&alert("fp-2"), &target("a")),
            )
            .await;
            assert!(abandoned.is_err());
            assert_eq!(publisher.circuit_state("a"), Some(CircuitState::HalfOpen));

            assert!(publisher.publish(&alert("fp-3"), &target("a")).await);
            assert_eq!(publisher.circuit_state("a"), Some(CircuitState::Closed));
            assert_eq!(transport.calls("a"), 3);
            assert_eq!(publisher.stats("a").unwrap().circuit_breaker_blocks, 0);
        }

        #[tokio::test(start_paused = true)]
        async fn reset_circuit_breaker_closes() {
            let transport = ScriptedTransport::default().always("a", Outcome::Status(503));
            let (publisher, _) = tripping_publisher(transport);

            publisher.publish(&alert("fp-1"), &target("a")).await;
            publisher.publish(&alert("fp-2"), &target("a")).await;

            assert!(publisher.reset_circuit_breaker("a"));
            assert_eq!(publisher.circuit_state("a"), Some(CircuitState::Closed));
            assert!(!publisher.reset_circuit_breaker("unknown"));
        }

        #[tokio::test(start_paused = true)]
        async fn breaker_state_exported_as_gauge() {
            let recorder = Arc::new(MetricsRecorder::new());
            let transport = Arc::new(ScriptedTransport::default().always("a", Outcome::Status(503)));
            let filter = Arc::new(FilterEngine::new(&FilterEngineConfig::default()));
            let publisher = Publisher::new(
                filter,
                transport,
                PublisherConfig {
                    max_attempts: 1,
                    ..PublisherConfig::default()
                },
                CircuitBreakerConfig {
                    failure_threshold: 1,
                    ..CircuitBreakerConfig::default()
                },
            )
            .with_metrics(recorder.clone());

            publisher.publish(&alert("fp-1"), &target("a")).await;

            assert_eq!(
                recorder.gauge(metric_names::CIRCUIT_BREAKER_STATE, &[("target", "a")]),
                Some(2.0)
            );
            assert_eq!(
                recorder.counter(metric_names::PUBLISH_FAILURES, &[("target", "a")]),
                1
            );
        }
    }

    mod retention_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn retain_targets_drops_only_removed() {
            let transport = ScriptedTransport::default().always("b", Outcome::Status(400));
            let (publisher, _) = publisher(transport);
            publisher.publish(&alert("fp-1"), &target("a")).await;
            publisher.publish(&alert("fp-1"), &target("b")).await;

            assert_eq!(publisher.retain_targets(&[target("a")]), 1);

            assert!(publisher.stats("b").is_none());
            assert!(publisher.circuit_state("b").is_none());
            assert_eq!(publisher.stats("a").unwrap().successes, 1);
            assert_eq!(publisher.retain_targets(&[target("a")]), 0);
        }
    }

    mod fan_out_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn slow_target_does_not_hold_up_others() {
            let transport = ScriptedTransport::with_latency(Duration::from_millis(500))
                .always("b", Outcome::Hang);
            let config = PublisherConfig {
                max_attempts: 1,
                request_timeout_secs: 1,
                ..PublisherConfig::default()
            };
            let (publisher, _, _) =
                publisher_with(transport, config, CircuitBreakerConfig::default());
            let targets = vec![target("a"), target("b"), target("c")];

            let started = Instant::now();
            let results = publisher.publish_to_multiple(&alert("fp-1"), &targets).await;
            let elapsed = started.elapsed();

            assert_eq!(results.get("a"), Some(&true));
            assert_eq!(results.get("b"), Some(&false));
            assert_eq!(results.get("c"), Some(&true));
            assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
        }

        #[tokio::test(start_paused = true)]
        async fn disabled_targets_omitted() {
            let (publisher, _) = publisher(ScriptedTransport::default());
            let targets = vec![target("a"), target("b").enabled(false)];

            let results = publisher.publish_to_multiple(&alert("fp-1"), &targets).await;

            assert_eq!(results.len(), 1);
            assert!(results["a"]);
        }

        #[tokio::test(start_paused = true)]
        async fn global_concurrency_limit() {
            let transport = ScriptedTransport::with_latency(Duration::from_millis(100));
            let config = PublisherConfig {
                max_concurrent: 2,
                ..PublisherConfig::default()
            };
            let (publisher, transport, _) =
                publisher_with(transport, config, CircuitBreakerConfig::default());
            let targets: Vec<_> = (0..5).map(|i| target(&format!("t{i}"))).collect();

            let results = publisher.publish_to_multiple(&alert("fp-1"), &targets).await;

            assert!(results.values().all(|ok| *ok));
            assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 2);
        }
    }

    mod shutdown_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn shutdown_cancels_in_flight_and_closes_transport() {
            let transport = ScriptedTransport::default().always("a", Outcome::Hang);
            let (publisher, transport) = publisher(transport);

            let fan_out = {
                let publisher = Arc::clone(&publisher);
                tokio::spawn(async move {
                    publisher
                        .publish_to_multiple(&alert("fp-1"), &[target("a")])
                        .await
                })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(transport.calls("a"), 1);

            publisher.shutdown(Duration::from_secs(5)).await;

            let results = fan_out.await.unwrap();
            assert_eq!(results.get("a"), Some(&false));
            assert!(transport.closed.load(Ordering::SeqCst));
            assert_eq!(publisher.in_flight(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn publish_after_shutdown_is_refused() {
            let (publisher, transport) = publisher(ScriptedTransport::default());
            publisher.shutdown(Duration::from_secs(1)).await;

            assert!(publisher.is_shut_down());
            assert!(!publisher.publish(&alert("fp-1"), &target("a")).await);
            assert_eq!(transport.calls("a"), 0);
        }
    }
}
