//! Per-target publish eligibility.
//!
//! The [`FilterEngine`] decides whether an enriched alert should be
//! delivered to a target. Checks run in a fixed order and the first one to
//! reach a verdict wins:
//!
//! 1. Deduplication of repeat fingerprints within the dedup window
//! 2. Per-target rate limiting
//! 3. The target's embedded [`FilterConfig`](crate::types::FilterConfig)
//! 4. Global rules, then target-specific rules, by ascending priority
//!
//! Only allowed deliveries update the dedup and rate-limit state. Internal
//! errors allow the alert rather than block it.

mod rules;
mod tracker;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use rules::{FilterRule, PatternCache, RuleAction, RuleCondition};
use tracker::{DedupKey, DedupTracker, RateLimiter};

use crate::config::FilterEngineConfig;
use crate::error::{Result, RouterError};
use crate::memory::NoopMetrics;
use crate::ports::{Metrics, metric_names};
use crate::types::{EnrichedAlert, PublishingTarget, Severity};

/// Why a decision was reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DecisionReason {
    /// The same delivery was allowed within the dedup window.
    Duplicate,
    /// The target's rate limit is exhausted.
    RateLimited,
    /// The target's embedded filter rejected the alert.
    TargetFilter {
        /// Which criterion rejected it.
        criterion: String,
    },
    /// A rule matched.
    Rule {
        /// Name of the matching rule.
        name: String,
    },
    /// No rule matched.
    NoMatchingRule,
    /// Evaluation failed and the alert was let through.
    FailOpen,
}

/// Outcome of [`FilterEngine::should_publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDecision {
    /// Whether to publish.
    pub allow: bool,
    /// How long to wait before publishing.
    pub delay: Duration,
    /// Why.
    pub reason: DecisionReason,
}

impl FilterDecision {
    fn allow(reason: DecisionReason) -> Self {
        Self {
            allow: true,
            delay: Duration::ZERO,
            reason,
        }
    }

    fn deny(reason: DecisionReason) -> Self {
        Self {
            allow: false,
            delay: Duration::ZERO,
            reason,
        }
    }

    fn label(&self) -> &'static str {
        if !self.allow {
            "deny"
        } else if self.delay.is_zero() {
            "allow"
        } else {
            "delay"
        }
    }
}

/// Snapshot of filter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStats {
    /// Decisions made.
    pub evaluated: u64,
    /// Decisions that allowed publishing (including delayed ones).
    pub allowed: u64,
    /// Allowed decisions with a delay.
    pub delayed: u64,
    /// Denied as duplicates.
    pub denied_duplicate: u64,
    /// Denied by rate limiting.
    pub denied_rate_limited: u64,
    /// Denied by a target's embedded filter.
    pub denied_target_filter: u64,
    /// Denied by a rule.
    pub denied_rule: u64,
    /// Allowed because evaluation failed.
    pub fail_open: u64,
}

#[derive(Debug, Default)]
struct FilterCounters {
    evaluated: AtomicU64,
    allowed: AtomicU64,
    delayed: AtomicU64,
    denied_duplicate: AtomicU64,
    denied_rate_limited: AtomicU64,
    denied_target_filter: AtomicU64,
    denied_rule: AtomicU64,
    fail_open: AtomicU64,
}

impl FilterCounters {
    fn record(&self, decision: &FilterDecision) {
        self.evaluated.fetch_add(1, Ordering::Relaxed);
        if decision.allow {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            if !decision.delay.is_zero() {
                self.delayed.fetch_add(1, Ordering::Relaxed);
            }
        }
        let counter = match &decision.reason {
            DecisionReason::Duplicate => &self.denied_duplicate,
            DecisionReason::RateLimited => &self.denied_rate_limited,
            DecisionReason::TargetFilter { .. } => &self.denied_target_filter,
            DecisionReason::Rule { .. } if !decision.allow => &self.denied_rule,
            DecisionReason::FailOpen => &self.fail_open,
            DecisionReason::Rule { .. } | DecisionReason::NoMatchingRule => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> FilterStats {
        FilterStats {
            evaluated: self.evaluated.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            denied_duplicate: self.denied_duplicate.load(Ordering::Relaxed),
            denied_rate_limited: self.denied_rate_limited.load(Ordering::Relaxed),
            denied_target_filter: self.denied_target_filter.load(Ordering::Relaxed),
            denied_rule: self.denied_rule.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
        }
    }
}

/// Evaluates dedup, rate limits, target filters and rules.
#[derive(Debug)]
pub struct FilterEngine {
    global_rules: RwLock<Vec<FilterRule>>,
    target_rules: RwLock<HashMap<String, Vec<FilterRule>>>,
    dedup: Mutex<DedupTracker>,
    rate_limiter: Mutex<RateLimiter>,
    patterns: PatternCache,
    counters: FilterCounters,
    metrics: Arc<dyn Metrics>,
}

impl FilterEngine {
    /// Creates an engine with no rules.
    #[must_use]
    pub fn new(config: &FilterEngineConfig) -> Self {
        Self {
            global_rules: RwLock::new(Vec::new()),
            target_rules: RwLock::new(HashMap::new()),
            dedup: Mutex::new(DedupTracker::new(config.dedup_window())),
            rate_limiter: Mutex::new(RateLimiter::new(
                config.rate_limit_max,
                config.rate_limit_window_minutes,
            )),
            patterns: PatternCache::new(),
            counters: FilterCounters::default(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    // ============ Decisions ============

    /// Decides whether `enriched` should be published to `target`.
    ///
    /// An allowed decision is recorded against the dedup and rate-limit state
    /// before returning, so the check and the update are atomic.
    pub fn should_publish(
        &self,
        enriched: &EnrichedAlert,
        target: &PublishingTarget,
    ) -> FilterDecision {
        let now = Instant::now();
        let key = DedupKey {
            target: target.name.clone(),
            fingerprint: enriched.alert.fingerprint.clone(),
            status: enriched.alert.status,
        };

        let mut dedup = self.dedup.lock();
        let mut rate_limiter = self.rate_limiter.lock();

        let decision = if dedup.is_duplicate(&key, now) {
            FilterDecision::deny(DecisionReason::Duplicate)
        } else if rate_limiter.is_limited(&target.name, now) {
            FilterDecision::deny(DecisionReason::RateLimited)
        } else {
            match self.evaluate(enriched, target) {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(
                        target_name = %target.name,
                        fingerprint = %enriched.alert.fingerprint,
                        error = %e,
                        "filter evaluation failed, allowing alert"
                    );
                    FilterDecision::allow(DecisionReason::FailOpen)
                }
            }
        };

        if decision.allow {
            dedup.record(key, now);
            rate_limiter.record(&target.name, now);
        }
        drop(rate_limiter);
        drop(dedup);

        debug!(
            target_name = %target.name,
            fingerprint = %enriched.alert.fingerprint,
            allow = decision.allow,
            delay_secs = decision.delay.as_secs(),
            reason = ?decision.reason,
            "filter decision"
        );
        self.counters.record(&decision);
        self.metrics.increment_counter(
            metric_names::FILTER_DECISIONS,
            &[("target", &target.name), ("decision", decision.label())],
        );
        decision
    }

    fn evaluate(
        &self,
        enriched: &EnrichedAlert,
        target: &PublishingTarget,
    ) -> Result<FilterDecision> {
        if let Some(criterion) = self.check_target_filter(enriched, target)? {
            return Ok(FilterDecision::deny(DecisionReason::TargetFilter {
                criterion: criterion.to_string(),
            }));
        }

        let global = self.global_rules.read();
        let target_rules = self.target_rules.read();
        let scoped = target_rules.get(&target.name).map(Vec::as_slice).unwrap_or_default();

        let matched = global
            .iter()
            .chain(scoped.iter())
            .find(|rule| rule.matches(enriched, &self.patterns));

        Ok(match matched {
            None => FilterDecision::allow(DecisionReason::NoMatchingRule),
            Some(rule) => {
                let reason = DecisionReason::Rule {
                    name: rule.name.clone(),
                };
                match rule.action {
                    RuleAction::Deny => FilterDecision::deny(reason),
                    RuleAction::Allow | RuleAction::Delay { .. } => FilterDecision {
                        allow: true,
                        delay: rule.delay(),
                        reason,
                    },
                }
            }
        })
    }

    /// Returns the name of the first criterion that rejects the alert.
    fn check_target_filter(
        &self,
        enriched: &EnrichedAlert,
        target: &PublishingTarget,
    ) -> Result<Option<&'static str>> {
        let filter = &target.filter_config;
        let severity = enriched.effective_severity();

        if !filter.severities.is_empty()
            && !severity.is_some_and(|s| filter.severities.contains(&s))
        {
            return Ok(Some("severity"));
        }

        if !filter.namespaces.is_empty()
            && !enriched
                .alert
                .namespace()
                .is_some_and(|ns| filter.namespaces.iter().any(|allowed| allowed == ns))
        {
            return Ok(Some("namespace"));
        }

        if filter.exclude_noise && severity == Some(Severity::Noise) {
            return Ok(Some("noise"));
        }

        // Unclassified alerts cannot be judged on confidence.
        if let (Some(min), Some(confidence)) = (filter.min_confidence, enriched.confidence()) {
            if confidence < min {
                return Ok(Some("min_confidence"));
            }
        }

        if let Some(pattern) = &filter.alert_name_pattern {
            let re = self.patterns.get(pattern)?;
            if !re.is_match(&enriched.alert.name) {
                return Ok(Some("alert_name_pattern"));
            }
        }

        Ok(None)
    }

    // ============ Rule Management ============

    /// Adds a global rule.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::InvalidRule` if the rule is invalid or its name is taken.
    pub fn add_rule(&self, rule: FilterRule) -> Result<()> {
        let mut rules = self.global_rules.write();
        insert_rule(&mut rules, rule)?;
        Ok(())
    }

    /// Adds a rule that only applies to one target.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::InvalidRule` if the rule is invalid or its name is
    /// taken for that target.
    pub fn add_target_rule(&self, target: &str, rule: FilterRule) -> Result<()> {
        let mut all = self.target_rules.write();
        insert_rule(all.entry(target.to_string()).or_default(), rule)?;
        Ok(())
    }

    /// Removes a global rule by name.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::RuleNotFound` if no such rule exists.
    pub fn remove_rule(&self, name: &str) -> Result<FilterRule> {
        let mut rules = self.global_rules.write();
        remove_named(&mut rules, name)
    }

    /// Removes a target-specific rule by name.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::RuleNotFound` if no such rule exists for the target.
    pub fn remove_target_rule(&self, target: &str, name: &str) -> Result<FilterRule> {
        let mut all = self.target_rules.write();
        let rules = all.get_mut(target).ok_or_else(|| RouterError::RuleNotFound {
            name: name.to_string(),
        })?;
        let removed = remove_named(rules, name)?;
        if rules.is_empty() {
            all.remove(target);
        }
        Ok(removed)
    }

    /// Global rules in evaluation order.
    #[must_use]
    pub fn list_rules(&self) -> Vec<FilterRule> {
        self.global_rules.read().clone()
    }

    /// Rules for one target in evaluation order.
    #[must_use]
    pub fn list_target_rules(&self, target: &str) -> Vec<FilterRule> {
        self.target_rules
            .read()
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    // ============ State ============

    /// Returns a snapshot of the decision counters.
    #[must_use]
    pub fn stats(&self) -> FilterStats {
        self.counters.snapshot()
    }

    /// Deliveries counted against a target's current rate-limit window.
    #[must_use]
    pub fn rate_limit_count(&self, target: &str) -> u32 {
        self.rate_limiter.lock().count(target)
    }

    /// Clears dedup and rate-limit state.
    pub fn reset(&self) {
        self.dedup.lock().clear();
        self.rate_limiter.lock().clear();
        info!("filter dedup and rate-limit state cleared");
    }
}

fn insert_rule(rules: &mut Vec<FilterRule>, rule: FilterRule) -> Result<()> {
    rule.validate()?;
    if rules.iter().any(|r| r.name == rule.name) {
        return Err(RouterError::InvalidRule {
            reason: format!("rule '{}' already exists", rule.name),
        });
    }
    info!(rule = %rule.name, action = %rule.action, priority = rule.priority, "added filter rule");
    rules.push(rule);
    // Stable: equal priorities keep insertion order.
    rules.sort_by_key(|r| r.priority);
    Ok(())
}

fn remove_named(rules: &mut Vec<FilterRule>, name: &str) -> Result<FilterRule> {
    let index = rules
        .iter()
        .position(|r| r.name == name)
        .ok_or_else(|| RouterError::RuleNotFound {
            name: name.to_string(),
        })?;
    info!(rule = %name, "removed filter rule");
    Ok(rules.remove(index))
}
