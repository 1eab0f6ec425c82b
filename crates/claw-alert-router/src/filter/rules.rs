//! Filter rules and their conditions.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, RouterError};
use crate::types::{AlertStatus, EnrichedAlert, Severity};

/// What a matching rule does with the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Publish.
    Allow,
    /// Do not publish.
    Deny,
    /// Publish after waiting.
    Delay {
        /// Seconds to wait before delivery.
        seconds: u64,
    },
}

impl RuleAction {
    /// Returns the action name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Delay { .. } => "delay",
        }
    }
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delay { seconds } => write!(f, "delay({seconds}s)"),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}

/// A predicate over an enriched alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Classification severity equals the value.
    SeverityEquals(Severity),
    /// Classification confidence is strictly above the threshold.
    ConfidenceAbove(f64),
    /// Classification confidence is strictly below the threshold.
    ConfidenceBelow(f64),
    /// The alert has (true) or lacks (false) a classification.
    HasClassification(bool),
    /// The namespace label equals the value.
    NamespaceEquals(String),
    /// The namespace label matches the regex.
    NamespaceMatches(String),
    /// The alert name equals the value.
    AlertNameEquals(String),
    /// The alert name matches the regex.
    AlertNameMatches(String),
    /// The label is present.
    LabelExists(String),
    /// The label has the given value.
    LabelEquals {
        /// Label key.
        key: String,
        /// Required value.
        value: String,
    },
    /// The alert status equals the value.
    StatusEquals(AlertStatus),
}

impl RuleCondition {
    /// Evaluates the condition.
    ///
    /// Conditions on the classification never match an unclassified alert.
    /// A regex that does not compile never matches.
    #[must_use]
    pub fn matches(&self, enriched: &EnrichedAlert, patterns: &PatternCache) -> bool {
        let alert = &enriched.alert;
        let classification = enriched.classification.as_ref();
        match self {
            Self::SeverityEquals(severity) => classification.is_some_and(|c| c.severity == *severity),
            Self::ConfidenceAbove(threshold) => {
                classification.is_some_and(|c| c.confidence > *threshold)
            }
            Self::ConfidenceBelow(threshold) => {
                classification.is_some_and(|c| c.confidence < *threshold)
            }
            Self::HasClassification(expected) => classification.is_some() == *expected,
            Self::NamespaceEquals(namespace) => alert.namespace() == Some(namespace.as_str()),
            Self::NamespaceMatches(pattern) => alert
                .namespace()
                .is_some_and(|ns| patterns.is_match(pattern, ns)),
            Self::AlertNameEquals(name) => alert.name == *name,
            Self::AlertNameMatches(pattern) => patterns.is_match(pattern, &alert.name),
            Self::LabelExists(key) => alert.labels.contains_key(key),
            Self::LabelEquals { key, value } => alert.labels.get(key) == Some(value),
            Self::StatusEquals(status) => alert.status == *status,
        }
    }
}

/// A named, prioritized rule.
///
/// Lower priorities are evaluated first; ties keep insertion order.
/// A rule without conditions matches every alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Unique name within its rule list.
    pub name: String,
    /// Action taken when all conditions match.
    pub action: RuleAction,
    /// Conditions, all of which must match.
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// Evaluation order, ascending.
    #[serde(default)]
    pub priority: i32,
    /// Disabled rules are skipped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

impl FilterRule {
    /// Creates an enabled rule at priority 0 with no conditions.
    #[must_use]
    pub fn new(name: impl Into<String>, action: RuleAction) -> Self {
        Self {
            name: name.into(),
            action,
            conditions: Vec::new(),
            priority: 0,
            enabled: true,
        }
    }

    /// Adds a condition.
    #[must_use]
    pub fn when(mut self, condition: RuleCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Sets the priority.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets whether the rule is enabled.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Checks the rule definition.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::InvalidRule` if the name is empty or a confidence
    /// threshold lies outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RouterError::InvalidRule {
                reason: "rule name cannot be empty".to_string(),
            });
        }
        for condition in &self.conditions {
            if let RuleCondition::ConfidenceAbove(t) | RuleCondition::ConfidenceBelow(t) =
                condition
            {
                if !(0.0..=1.0).contains(t) {
                    return Err(RouterError::InvalidRule {
                        reason: format!(
                            "rule '{}' confidence threshold {t} is outside [0, 1]",
                            self.name
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Returns true if the rule is enabled and every condition matches.
    #[must_use]
    pub fn matches(&self, enriched: &EnrichedAlert, patterns: &PatternCache) -> bool {
        self.enabled && self.conditions.iter().all(|c| c.matches(enriched, patterns))
    }

    /// Delay implied by the action.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        match self.action {
            RuleAction::Delay { seconds } => Duration::from_secs(seconds),
            RuleAction::Allow | RuleAction::Deny => Duration::ZERO,
        }
    }
}

/// Compiled regexes keyed by source pattern.
///
/// Patterns that fail to compile are remembered, so each is reported once.
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: RwLock<HashMap<String, Option<Regex>>>,
}

impl PatternCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `text` matches `pattern`; invalid patterns never match.
    #[must_use]
    pub fn is_match(&self, pattern: &str, text: &str) -> bool {
        self.get(pattern).is_ok_and(|re| re.is_match(text))
    }

    /// Returns the compiled pattern.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::InvalidPattern` if the pattern does not compile.
    pub fn get(&self, pattern: &str) -> Result<Regex> {
        if let Some(entry) = self.compiled.read().get(pattern) {
            return entry.clone().ok_or_else(|| invalid(pattern, "previously rejected"));
        }

        let mut compiled = self.compiled.write();
        let entry = compiled
            .entry(pattern.to_string())
            .or_insert_with(|| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "invalid filter pattern, treating as non-matching");
                    None
                }
            });
        entry.clone().ok_or_else(|| invalid(pattern, "does not compile"))
    }

    /// Number of distinct patterns seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.compiled.read().len()
    }

    /// Returns true if no pattern has been seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compiled.read().is_empty()
    }
}

fn invalid(pattern: &str, reason: &str) -> RouterError {
    RouterError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Alert, ClassificationResult};
    use test_case::test_case;

    fn classified(severity: Severity, confidence: f64) -> EnrichedAlert {
        let alert = Alert::new("fp", "KubePodCrashLooping")
            .with_label("namespace", "payments-prod")
            .with_label("team", "payments");
        EnrichedAlert::new(
            alert,
            Some(ClassificationResult::new(severity, confidence, "r")),
        )
    }

    fn unclassified() -> EnrichedAlert {
        EnrichedAlert::new(Alert::new("fp", "KubePodCrashLooping"), None)
    }

    #[test_case(RuleCondition::SeverityEquals(Severity::Critical), true ; "severity equals")]
    #[test_case(RuleCondition::SeverityEquals(Severity::Info), false ; "severity differs")]
    #[test_case(RuleCondition::ConfidenceAbove(0.5), true ; "confidence above")]
    #[test_case(RuleCondition::ConfidenceAbove(0.8), false ; "confidence not strictly above")]
    #[test_case(RuleCondition::ConfidenceBelow(0.9), true ; "confidence below")]
    #[test_case(RuleCondition::HasClassification(true), true ; "has classification")]
    #[test_case(RuleCondition::NamespaceEquals("payments-prod".into()), true ; "namespace equals")]
    #[test_case(RuleCondition::NamespaceMatches("^payments-".into()), true ; "namespace regex")]
    #[test_case(RuleCondition::NamespaceMatches("^billing-".into()), false ; "namespace regex miss")]
    #[test_case(RuleCondition::AlertNameEquals("KubePodCrashLooping".into()), true ; "name equals")]
    #[test_case(RuleCondition::AlertNameMatches("Crash".into()), true ; "name regex")]
    #[test_case(RuleCondition::AlertNameMatches("(".into()), false ; "invalid regex never matches")]
    #[test_case(RuleCondition::LabelExists("team".into()), true ; "label exists")]
    #[test_case(RuleCondition::LabelExists("owner".into()), false ; "label missing")]
    #[test_case(RuleCondition::LabelEquals { key: "team".into(), value: "payments".into() }, true ; "label equals")]
    #[test_case(RuleCondition::StatusEquals(AlertStatus::Resolved), false ; "status differs")]
    fn condition_on_classified_alert(condition: RuleCondition, expected: bool) {
        let patterns = PatternCache::new();
        assert_eq!(
            condition.matches(&classified(Severity::Critical, 0.8), &patterns),
            expected
        );
    }

    #[test_case(RuleCondition::SeverityEquals(Severity::Critical) ; "severity")]
    #[test_case(RuleCondition::ConfidenceAbove(0.0) ; "confidence above")]
    #[test_case(RuleCondition::ConfidenceBelow(1.0) ; "confidence below")]
    #[test_case(RuleCondition::HasClassification(true) ; "has classification")]
    #[test_case(RuleCondition::NamespaceEquals("payments-prod".into()) ; "no namespace label")]
    fn classification_conditions_miss_unclassified(condition: RuleCondition) {
        assert!(!condition.matches(&unclassified(), &PatternCache::new()));
    }

    #[test]
    fn lacks_classification_condition() {
        let condition = RuleCondition::HasClassification(false);
        assert!(condition.matches(&unclassified(), &PatternCache::new()));
    }

    #[test]
    fn rule_requires_all_conditions() {
        let patterns = PatternCache::new();
        let rule = FilterRule::new("crit-payments", RuleAction::Allow)
            .when(RuleCondition::SeverityEquals(Severity::Critical))
            .when(RuleCondition::NamespaceEquals("billing".into()));

        assert!(!rule.matches(&classified(Severity::Critical, 0.9), &patterns));
    }

    #[test]
    fn rule_without_conditions_matches_everything() {
        let rule = FilterRule::new("catch-all", RuleAction::Deny);
        assert!(rule.matches(&unclassified(), &PatternCache::new()));
    }

    #[test]
    fn disabled_rule_never_matches() {
        let rule = FilterRule::new("off", RuleAction::Deny).enabled(false);
        assert!(!rule.matches(&unclassified(), &PatternCache::new()));
    }

    #[test]
    fn delay_action_duration() {
        let rule = FilterRule::new("slow", RuleAction::Delay { seconds: 30 });
        assert_eq!(rule.delay(), Duration::from_secs(30));
        assert_eq!(
            FilterRule::new("x", RuleAction::Deny).delay(),
            Duration::ZERO
        );
    }

    #[test]
    fn validate_rejects_empty_name_and_bad_threshold() {
        assert!(FilterRule::new(" ", RuleAction::Allow).validate().is_err());
        assert!(FilterRule::new("x", RuleAction::Allow)
            .when(RuleCondition::ConfidenceAbove(2.0))
            .validate()
            .is_err());
        assert!(FilterRule::new("x", RuleAction::Allow)
            .when(RuleCondition::ConfidenceBelow(0.3))
            .validate()
            .is_ok());
    }

    #[test]
    fn rule_deserializes_from_json() {
        let json = r#"{
            "name": "mute-staging",
            "action": "deny",
            "priority": 5,
            "conditions": [
                {"kind": "namespace_matches", "value": "^staging-"},
                {"kind": "label_equals", "value": {"key": "team", "value": "infra"}}
            ]
        }"#;
        let rule: FilterRule = serde_json::from_str(json).unwrap();

        assert_eq!(rule.action, RuleAction::Deny);
        assert_eq!(rule.priority, 5);
        assert!(rule.enabled);
        assert_eq!(rule.conditions.len(), 2);
    }

    #[test]
    fn delay_action_deserializes() {
        let action: RuleAction = serde_json::from_str(r#"{"delay": {"seconds": 120}}"#).unwrap();
        assert_eq!(action, RuleAction::Delay { seconds: 120 });
        assert_eq!(action.to_string(), "delay(120s)");
    }

    #[test]
    fn invalid_pattern_cached_once() {
        let patterns = PatternCache::new();
        assert!(!patterns.is_match("[", "anything"));
        assert!(!patterns.is_match("[", "anything"));

        assert_eq!(patterns.len(), 1);
        assert!(matches!(
            patterns.get("["),
            Err(RouterError::InvalidPattern { .. })
        ));
    }
}
