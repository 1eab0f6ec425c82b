//! Payload formatting per target format.
//!
//! Each [`TargetFormat`] maps to one formatting function through a fixed
//! table indexed by [`TargetFormat::index`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Result, RouterError};
use crate::types::{AlertStatus, EnrichedAlert, PublishingTarget, Severity, TargetFormat};

/// Header carrying the PagerDuty integration key.
pub const PAGERDUTY_ROUTING_KEY_HEADER: &str = "X-Routing-Key";

/// Source reported in outbound payloads.
pub const PAYLOAD_SOURCE: &str = "claw-alert-router";

type FormatFn = fn(&EnrichedAlert, &PublishingTarget) -> Result<Value>;

const FORMATTERS: [FormatFn; TargetFormat::ALL.len()] = [
    format_alertmanager,
    format_rootly,
    format_pagerduty,
    format_slack,
    format_webhook,
];

/// Renders an alert in the payload format of `target`.
///
/// # Errors
///
/// Returns `RouterError::InvalidTarget` if the target lacks something its
/// format requires, or `RouterError::Serialization` if encoding fails.
pub fn format_alert(enriched: &EnrichedAlert, target: &PublishingTarget) -> Result<Value> {
    FORMATTERS[target.format.index()](enriched, target)
}

/// Alertmanager webhook receiver envelope (version 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerPayload {
    /// Envelope version.
    pub version: String,
    /// Group key; the fingerprint of the single alert.
    pub group_key: String,
    /// Number of alerts left out.
    pub truncated_alerts: usize,
    /// Status of the group.
    pub status: AlertStatus,
    /// Receiver name; the target name.
    pub receiver: String,
    /// Grouping labels.
    pub group_labels: HashMap<String, String>,
    /// Labels shared by every alert.
    pub common_labels: HashMap<String, String>,
    /// Annotations shared by every alert.
    pub common_annotations: HashMap<String, String>,
    /// Link back to the sender.
    pub external_url: String,
    /// The alerts.
    pub alerts: Vec<AlertmanagerAlert>,
}

/// One alert inside an [`AlertmanagerPayload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerAlert {
    /// Firing or resolved.
    pub status: AlertStatus,
    /// Labels, with classification labels added.
    pub labels: HashMap<String, String>,
    /// Annotations, with classification reasoning added.
    pub annotations: HashMap<String, String>,
    /// RFC 3339 start time.
    pub starts_at: String,
    /// RFC 3339 end time, if resolved.
    pub ends_at: Option<String>,
    /// Link to the alert source.
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
    /// Fingerprint.
    pub fingerprint: String,
}

impl AlertmanagerAlert {
    fn from_enriched(enriched: &EnrichedAlert) -> Self {
        let alert = &enriched.alert;
        let mut labels = alert.labels.clone();
        let mut annotations = alert.annotations.clone();
        if let Some(c) = &enriched.classification {
            labels.insert("ai_severity".to_string(), c.severity.to_string());
            annotations.insert("ai_confidence".to_string(), format!("{:.2}", c.confidence));
            annotations.insert("ai_reasoning".to_string(), c.reasoning.clone());
            if !c.recommendations.is_empty() {
                annotations.insert("ai_recommendations".to_string(), c.recommendations.join("\n"));
            }
        }
        Self {
            status: alert.status,
            labels,
            annotations,
            starts_at: alert.starts_at.to_rfc3339(),
            ends_at: alert.ends_at.map(|t| t.to_rfc3339()),
            generator_url: alert.generator_url.clone().unwrap_or_default(),
            fingerprint: alert.fingerprint.clone(),
        }
    }
}

fn format_alertmanager(enriched: &EnrichedAlert, target: &PublishingTarget) -> Result<Value> {
    let alert = AlertmanagerAlert::from_enriched(enriched);
    let payload = AlertmanagerPayload {
        version: "4".to_string(),
        group_key: enriched.alert.fingerprint.clone(),
        truncated_alerts: 0,
        status: enriched.alert.status,
        receiver: target.name.clone(),
        group_labels: HashMap::new(),
        common_labels: alert.labels.clone(),
        common_annotations: alert.annotations.clone(),
        external_url: enriched.alert.generator_url.clone().unwrap_or_default(),
        alerts: vec![alert],
    };
    Ok(serde_json::to_value(payload)?)
}

fn summary(enriched: &EnrichedAlert) -> String {
    enriched
        .alert
        .annotations
        .get("summary")
        .or_else(|| enriched.alert.annotations.get("description"))
        .cloned()
        .unwrap_or_else(|| enriched.alert.name.clone())
}

fn classification_json(enriched: &EnrichedAlert) -> Value {
    enriched.classification.as_ref().map_or(Value::Null, |c| {
        json!({
            "severity": c.severity,
            "confidence": c.confidence,
            "reasoning": c.reasoning,
            "recommendations": c.recommendations,
        })
    })
}

fn format_rootly(enriched: &EnrichedAlert, _target: &PublishingTarget) -> Result<Value> {
    let alert = &enriched.alert;
    let status = match alert.status {
        AlertStatus::Firing => "open",
        AlertStatus::Resolved => "resolved",
    };
    let severity = match enriched.effective_severity() {
        Some(Severity::Critical) => "critical",
        Some(Severity::Warning) => "high",
        Some(Severity::Info) => "medium",
        Some(Severity::Noise) | None => "low",
    };
    Ok(json!({
        "title": alert.name,
        "summary": summary(enriched),
        "status": status,
        "severity": severity,
        "source": PAYLOAD_SOURCE,
        "external_id": alert.fingerprint,
        "started_at": alert.starts_at.to_rfc3339(),
        "ended_at": alert.ends_at.map(|t| t.to_rfc3339()),
        "url": alert.generator_url,
        "labels": alert.labels,
        "classification": classification_json(enriched),
    }))
}

fn format_pagerduty(enriched: &EnrichedAlert, target: &PublishingTarget) -> Result<Value> {
    let routing_key = target
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(PAGERDUTY_ROUTING_KEY_HEADER))
        .map(|(_, v)| v.clone())
        .ok_or_else(|| RouterError::InvalidTarget {
            reason: format!(
                "pagerduty target '{}' has no {PAGERDUTY_ROUTING_KEY_HEADER} header",
                target.name
            ),
        })?;

    let alert = &enriched.alert;
    let event_action = match alert.status {
        AlertStatus::Firing => "trigger",
        AlertStatus::Resolved => "resolve",
    };
    let severity = match enriched.effective_severity() {
        Some(Severity::Critical) => "critical",
        Some(Severity::Warning) | None => "warning",
        Some(Severity::Info | Severity::Noise) => "info",
    };
    let links: Vec<Value> = alert
        .generator_url
        .iter()
        .map(|href| json!({ "href": href, "text": "Source" }))
        .collect();

    Ok(json!({
        "routing_key": routing_key,
        "event_action": event_action,
        "dedup_key": alert.fingerprint,
        "payload": {
            "summary": format!("{}: {}", alert.name, summary(enriched)),
            "source": alert.labels.get("instance").map_or(PAYLOAD_SOURCE, String::as_str),
            "severity": severity,
            "timestamp": alert.starts_at.to_rfc3339(),
            "component": alert.labels.get("job"),
            "group": alert.namespace(),
            "custom_details": {
                "labels": alert.labels,
                "annotations": alert.annotations,
                "classification": classification_json(enriched),
            },
        },
        "links": links,
    }))
}

const fn slack_color(severity: Option<Severity>, status: AlertStatus) -> &'static str {
    if matches!(status, AlertStatus::Resolved) {
        return "good";
    }
    match severity {
        Some(Severity::Critical) => "danger",
        Some(Severity::Warning) => "warning",
        Some(Severity::Info | Severity::Noise) | None => "#439FE0",
    }
}

fn format_slack(enriched: &EnrichedAlert, _target: &PublishingTarget) -> Result<Value> {
    let alert = &enriched.alert;
    let severity = enriched.effective_severity();
    let severity_text = severity.map_or("unknown", |s| s.as_str());

    let mut fields = vec![
        json!({ "title": "Status", "value": alert.status.as_str(), "short": true }),
        json!({ "title": "Severity", "value": severity_text, "short": true }),
    ];
    if let Some(ns) = alert.namespace() {
        fields.push(json!({ "title": "Namespace", "value": ns, "short": true }));
    }
    if let Some(c) = &enriched.classification {
        fields.push(json!({
            "title": "Confidence",
            "value": format!("{:.0}%", c.confidence * 100.0),
            "short": true,
        }));
        fields.push(json!({ "title": "Reasoning", "value": c.reasoning, "short": false }));
        if !c.recommendations.is_empty() {
            let steps: Vec<String> = c.recommendations.iter().map(|r| format!("• {r}")).collect();
            fields.push(json!({
                "title": "Recommendations",
                "value": steps.join("\n"),
                "short": false,
            }));
        }
    }

    Ok(json!({
        "text": format!("[{}] {}", alert.status.as_str().to_uppercase(), alert.name),
        "attachments": [{
            "color": slack_color(severity, alert.status),
            "title": alert.name,
            "title_link": alert.generator_url,
            "text": summary(enriched),
            "fields": fields,
            "footer": PAYLOAD_SOURCE,
            "ts": alert.starts_at.timestamp(),
        }],
    }))
}

fn format_webhook(enriched: &EnrichedAlert, _target: &PublishingTarget) -> Result<Value> {
    Ok(serde_json::to_value(enriched)?)
}
