//! The live set of publishing targets.
//!
//! The [`TargetManager`] pulls target definitions from a [`TargetSource`]
//! on demand and on a fixed interval. A successful discovery that differs
//! from the current set replaces the whole map at once, so readers see
//! either the old set or the new one and never a mix. A failed discovery
//! keeps the last known-good set.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TargetManagerConfig;
use crate::memory::NoopMetrics;
use crate::ports::{Metrics, TargetSource, metric_names};
use crate::types::PublishingTarget;

type TargetMap = BTreeMap<String, PublishingTarget>;

/// Refresh counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetManagerStats {
    /// Discoveries attempted.
    pub refreshes: u64,
    /// Discoveries that failed.
    pub failures: u64,
    /// Discoveries that changed the target set.
    pub changes: u64,
    /// Definitions dropped as invalid or duplicate.
    pub rejected: u64,
    /// When the last successful discovery finished.
    pub last_success: Option<DateTime<Utc>>,
    /// When the last failed discovery finished.
    pub last_failure: Option<DateTime<Utc>>,
    /// Targets in the current set, enabled or not.
    pub total_targets: usize,
    /// Enabled targets in the current set.
    pub active_targets: usize,
}

/// Owns the current target set.
#[derive(Debug)]
pub struct TargetManager {
    source: Arc<dyn TargetSource>,
    metrics: Arc<dyn Metrics>,
    config: TargetManagerConfig,
    targets: RwLock<Arc<TargetMap>>,
    stats: Mutex<TargetManagerStats>,
}

impl TargetManager {
    /// Creates a manager with an empty target set.
    ///
    /// Call [`refresh`](Self::refresh) or start the refresh loop to load targets.
    #[must_use]
    pub fn new(source: Arc<dyn TargetSource>, config: TargetManagerConfig) -> Self {
        Self {
            source,
            metrics: Arc::new(NoopMetrics),
            config,
            targets: RwLock::new(Arc::new(TargetMap::new())),
            stats: Mutex::new(TargetManagerStats::default()),
        }
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    fn snapshot(&self) -> Arc<TargetMap> {
        Arc::clone(&self.targets.read())
    }

    /// Enabled targets, sorted by name.
    #[must_use]
    pub fn active_targets(&self) -> Vec<PublishingTarget> {
        self.snapshot()
            .values()
            .filter(|t| t.enabled)
            .cloned()
            .collect()
    }

    /// Every known target, including disabled ones, sorted by name.
    #[must_use]
    pub fn all_targets(&self) -> Vec<PublishingTarget> {
        self.snapshot().values().cloned().collect()
    }

    /// Looks up a target by name.
    #[must_use]
    pub fn target(&self, name: &str) -> Option<PublishingTarget> {
        self.snapshot().get(name).cloned()
    }

    /// Returns true when no target is enabled, so nothing can be published.
    #[must_use]
    pub fn is_metrics_only(&self) -> bool {
        !self.snapshot().values().any(|t| t.enabled)
    }

    /// Returns a snapshot of the refresh counters.
    #[must_use]
    pub fn stats(&self) -> TargetManagerStats {
        self.stats.lock().clone()
    }

    /// Pulls the target set from the source.
    ///
    /// Returns false if discovery failed, in which case the current set is
    /// kept. An unchanged result leaves the current set untouched.
    pub async fn refresh(&self) -> bool {
        self.stats.lock().refreshes += 1;

        let discovered = match self.source.discover().await {
            Ok(discovered) => discovered,
            Err(e) => {
                let kept = self.snapshot().len();
                warn!(error = %e, kept, "target discovery failed, keeping last known targets");
                let mut stats = self.stats.lock();
                stats.failures += 1;
                stats.last_failure = Some(Utc::now());
                drop(stats);
                self.metrics.increment_counter(
                    metric_names::TARGET_REFRESHES,
                    &[("outcome", "failure")],
                );
                return false;
            }
        };

        let (next, rejected) = build_target_map(discovered);
        let previous = {
            let mut current = self.targets.write();
            if **current == next {
                None
            } else {
                Some(std::mem::replace(&mut *current, Arc::new(next)))
            }
        };

        let snapshot = self.snapshot();
        let active = snapshot.values().filter(|t| t.enabled).count();
        let outcome = match &previous {
            Some(previous) => {
                log_changes(previous, &snapshot);
                "changed"
            }
            None => {
                debug!(targets = snapshot.len(), "target set unchanged");
                "unchanged"
            }
        };

        {
            let mut stats = self.stats.lock();
            stats.rejected += rejected;
            stats.last_success = Some(Utc::now());
            stats.total_targets = snapshot.len();
            stats.active_targets = active;
            if previous.is_some() {
                stats.changes += 1;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let active_gauge = active as f64;
        self.metrics
            .set_gauge(metric_names::ACTIVE_TARGETS, active_gauge, &[]);
        self.metrics
            .increment_counter(metric_names::TARGET_REFRESHES, &[("outcome", outcome)]);
        if active == 0 && previous.is_some() {
            info!("no active publishing targets, running in metrics-only mode");
        }
        true
    }

    /// Refreshes immediately and then every refresh interval until `cancel` fires.
    pub fn spawn_refresh_loop(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.config.refresh_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "target refresh loop started");

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = async {
                        interval.tick().await;
                        self.refresh().await
                    } => {}
                }
            }
            info!("target refresh loop stopped");
        })
    }
}

/// Drops invalid and duplicate definitions; the first definition of a name wins.
fn build_target_map(discovered: Vec<PublishingTarget>) -> (TargetMap, u64) {
    let mut map = TargetMap::new();
    let mut rejected = 0;
    for target in discovered {
        if let Err(e) = target.validate() {
            warn!(target_name = %target.name, error = %e, "ignoring invalid target definition");
            rejected += 1;
            continue;
        }
        if map.contains_key(&target.name) {
            warn!(target_name = %target.name, "ignoring duplicate target definition");
            rejected += 1;
            continue;
        }
        map.insert(target.name.clone(), target);
    }
    (map, rejected)
}

fn log_changes(previous: &TargetMap, current: &TargetMap) {
    let added: Vec<&str> = current
        .keys()
        .filter(|name| !previous.contains_key(*name))
        .map(String::as_str)
        .collect();
    let removed: Vec<&str> = previous
        .keys()
        .filter(|name| !current.contains_key(*name))
        .map(String::as_str)
        .collect();
    let updated: Vec<&str> = current
        .iter()
        .filter(|(name, target)| previous.get(*name).is_some_and(|old| old != *target))
        .map(|(name, _)| name.as_str())
        .collect();

    info!(
        total = current.len(),
        added = ?added,
        removed = ?removed,
        updated = ?updated,
        "publishing targets changed"
    );
}
