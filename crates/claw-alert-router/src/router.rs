//! The assembled routing pipeline.
//!
//! [`AlertRouter`] wires the four engines together once, from explicit
//! ports, and exposes the operations callers need: classify and enrich an
//! alert, run an alert through filtering and publishing for every active
//! target, and force a target refresh. It also owns the background refresh
//! loop and stops it together with the publisher.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classification::ClassificationService;
use crate::config::RouterConfig;
use crate::error::Result;
use crate::filter::FilterEngine;
use crate::ports::{Cache, Classifier, Metrics, Storage, TargetSource, Transport};
use crate::publisher::Publisher;
use crate::targets::TargetManager;
use crate::types::{Alert, ClassificationResult, EnrichedAlert};

/// External collaborators the router is built from.
#[derive(Debug, Clone)]
pub struct RouterPorts {
    /// Classification backend.
    pub classifier: Arc<dyn Classifier>,
    /// Classification cache.
    pub cache: Arc<dyn Cache>,
    /// History and classification storage, if any.
    pub storage: Option<Arc<dyn Storage>>,
    /// Source of target definitions.
    pub target_source: Arc<dyn TargetSource>,
    /// Outbound delivery.
    pub transport: Arc<dyn Transport>,
    /// Metrics sink.
    pub metrics: Arc<dyn Metrics>,
}

/// What happened to one alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertProcessingReport {
    /// Fingerprint of the alert.
    pub fingerprint: String,
    /// Classification, absent when classification is disabled.
    pub classification: Option<ClassificationResult>,
    /// True when there were no active targets and publishing was skipped.
    pub metrics_only: bool,
    /// Delivery outcome per enabled target.
    pub results: HashMap<String, bool>,
}

impl AlertProcessingReport {
    /// Number of targets the alert was delivered to.
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.results.values().filter(|ok| **ok).count()
    }
}

/// The alert routing pipeline.
#[derive(Debug)]
pub struct AlertRouter {
    config: RouterConfig,
    classification: Arc<ClassificationService>,
    filter: Arc<FilterEngine>,
    publisher: Arc<Publisher>,
    targets: Arc<TargetManager>,
    cancel: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    /// Target-set change count the publisher's records were last pruned at.
    pruned_at_change: AtomicU64,
}

impl AlertRouter {
    /// Builds the engines from a validated configuration and the given ports.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::Config` if the configuration is invalid.
    pub fn new(config: RouterConfig, ports: RouterPorts) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();

        let mut classification =
            ClassificationService::new(ports.classifier, ports.cache, config.classification.clone())
                .with_metrics(Arc::clone(&ports.metrics));
        if let Some(storage) = ports.storage {
            classification = classification.with_storage(storage);
        }

        let filter = Arc::new(
            FilterEngine::new(&config.filter).with_metrics(Arc::clone(&ports.metrics)),
        );

        let publisher = Publisher::new(
            Arc::clone(&filter),
            ports.transport,
            config.publisher.clone(),
            config.circuit_breaker.clone(),
        )
        .with_metrics(Arc::clone(&ports.metrics))
        .with_cancellation(cancel.child_token());

        let targets = TargetManager::new(ports.target_source, config.targets.clone())
            .with_metrics(ports.metrics);

        Ok(Self {
            config,
            classification: Arc::new(classification),
            filter,
            publisher: Arc::new(publisher),
            targets: Arc::new(targets),
            cancel,
            refresh_task: Mutex::new(None),
            pruned_at_change: AtomicU64::new(0),
        })
    }

    /// The classification service.
    #[must_use]
    pub fn classification(&self) -> &Arc<ClassificationService> {
        &self.classification
    }

    /// The filter engine.
    #[must_use]
    pub fn filter(&self) -> &Arc<FilterEngine> {
        &self.filter
    }

    /// The publisher.
    #[must_use]
    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// The target manager.
    #[must_use]
    pub fn targets(&self) -> &Arc<TargetManager> {
        &self.targets
    }

    // ============ Operations ============

    /// Classifies an alert, unless classification is disabled.
    pub async fn classify_and_enrich(&self, alert: &Alert) -> EnrichedAlert {
        if !self.classification.is_enabled() {
            return EnrichedAlert::new(alert.clone(), None);
        }
        let classification = self.classification.classify(alert, None, false).await;
        EnrichedAlert::new(alert.clone(), Some(classification))
    }

    /// Classifies an alert and publishes it to every active target.
    ///
    /// With no active targets the alert is still classified but nothing is
    /// published. Never fails; per-target outcomes are in the report.
    pub async fn process_alert(&self, alert: &Alert) -> AlertProcessingReport {
        let enriched = self.classify_and_enrich(alert).await;
        let mut report = AlertProcessingReport {
            fingerprint: alert.fingerprint.clone(),
            classification: enriched.classification.clone(),
            metrics_only: false,
            results: HashMap::new(),
        };

        self.prune_removed_targets();
        if self.targets.is_metrics_only() {
            debug!(fingerprint = %alert.fingerprint, "metrics-only mode, skipping publish");
            report.metrics_only = true;
            return report;
        }

        let active = self.targets.active_targets();
        report.results = self.publisher.publish_to_multiple(&enriched, &active).await;
        debug!(
            fingerprint = %alert.fingerprint,
            targets = active.len(),
            published = report.published_count(),
            "alert processed"
        );
        report
    }

    /// Pulls the target set from the source now.
    pub async fn refresh_targets(&self) -> bool {
        let refreshed = self.targets.refresh().await;
        self.prune_removed_targets();
        refreshed
    }

    /// Drops publisher state for targets that left the set since the last
    /// prune. The refresh loop changes the set in the background, so this
    /// runs lazily from the operations above.
    fn prune_removed_targets(&self) {
        let changes = self.targets.stats().changes;
        if self.pruned_at_change.swap(changes, Ordering::AcqRel) != changes {
            self.publisher.retain_targets(&self.targets.all_targets());
        }
    }

    // ============ Lifecycle ============

    /// Starts the background target refresh loop. Does nothing if it is
    /// already running.
    pub fn start(&self) {
        let mut task = self.refresh_task.lock();
        if task.is_some() {
            return;
        }
        *task = Some(
            Arc::clone(&self.targets).spawn_refresh_loop(self.cancel.child_token()),
        );
        info!("alert router started");
    }

    /// Stops the refresh loop and in-flight publishes, waiting at most the
    /// configured grace period, then closes the transport.
    pub async fn shutdown(&self) {
        let grace = self.config.publisher.shutdown_grace();
        info!(grace_secs = grace.as_secs(), "alert router shutting down");
        self.cancel.cancel();

        self.publisher.shutdown(grace).await;

        let task = self.refresh_task.lock().take();
        if let Some(task) = task {
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "target refresh loop failed"),
                Err(_) => warn!("target refresh loop did not stop within grace period"),
            }
        }
        info!("alert router stopped");
    }
}
