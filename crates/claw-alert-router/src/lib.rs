//! Inline alert routing for Clawbernetes.
//!
//! `claw-alert-router` sits between an alert source and the incident tools
//! downstream of it. Every alert is classified, checked against per-target
//! filters, and fanned out to each active target through its own circuit
//! breaker.
//!
//! # Features
//!
//! - **Classification**: cached, single-flight classification with a
//!   rule-based fallback when the classifier is unavailable
//! - **Filtering**: deduplication, per-target rate limits, target filters,
//!   and prioritized allow/deny/delay rules
//! - **Publishing**: bounded concurrency, retries with backoff, and a circuit
//!   breaker per target
//! - **Target Management**: periodic discovery with last-good fallback and a
//!   metrics-only mode when nothing is configured
//! - **Payload Formats**: Alertmanager, Rootly, PagerDuty, Slack, and plain
//!   webhook
//!
//! # Example
//!
//! ```rust
//! use claw_alert_router::{
//!     Alert, EnrichedAlert, FilterEngine, FilterEngineConfig, FilterRule,
//!     PublishingTarget, RuleAction, RuleCondition, TargetFormat,
//! };
//!
//! let engine = FilterEngine::new(&FilterEngineConfig::default());
//!
//! // Keep the staging namespace out of every target
//! let rule = FilterRule::new("drop-staging", RuleAction::Deny)
//!     .when(RuleCondition::NamespaceEquals("staging".to_string()));
//! engine.add_rule(rule).unwrap();
//!
//! let target = PublishingTarget::new("oncall", "https://hooks.example.com", TargetFormat::Slack);
//! let alert = Alert::new("fp-1", "HighCPU").with_label("namespace", "staging");
//!
//! let decision = engine.should_publish(&EnrichedAlert::new(alert, None), &target);
//! assert!(!decision.allow);
//! ```
//!
//! # Assembling a Router
//!
//! The pipeline is built from explicit ports, so production adapters and the
//! in-memory ones in [`memory`] are interchangeable:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use claw_alert_router::{AlertRouter, RouterConfig, RouterPorts};
//! use claw_alert_router::memory::{InMemoryCache, NoopMetrics, StaticTargetSource};
//! use claw_alert_router::http::HttpTransport;
//!
//! let router = AlertRouter::new(
//!     RouterConfig::from_file("router.json")?,
//!     RouterPorts {
//!         classifier: Arc::new(my_classifier),
//!         cache: Arc::new(InMemoryCache::new()),
//!         storage: None,
//!         target_source: Arc::new(StaticTargetSource::new(targets)),
//!         transport: Arc::new(HttpTransport::new()?),
//!         metrics: Arc::new(NoopMetrics),
//!     },
//! )?;
//!
//! router.refresh_targets().await;
//! router.start();
//! let report = router.process_alert(&alert).await;
//! router.shutdown().await;
//! ```

#![forbid(unsafe_code)]
#![doc(html_root_url = "https://docs.rs/claw-alert-router/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod circuit_breaker;
pub mod classification;
pub mod config;
pub mod error;
pub mod filter;
pub mod formatter;
#[cfg(feature = "http")]
pub mod http;
pub mod memory;
pub mod ports;
pub mod publisher;
pub mod router;
pub mod targets;
pub mod types;

// Re-export main types at crate root
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use classification::{ClassificationService, ClassificationStats};
pub use config::{
    CircuitBreakerConfig, ClassificationConfig, FilterEngineConfig, PublisherConfig,
    RouterConfig, TargetManagerConfig,
};
pub use error::{Result, RouterError};
pub use filter::{
    DecisionReason, FilterDecision, FilterEngine, FilterRule, FilterStats, RuleAction,
    RuleCondition,
};
pub use formatter::format_alert;
pub use ports::{
    AlertQuery, Cache, ClassificationContext, Classifier, HistoricalPattern, Metrics, Storage,
    TargetSource, Transport, TransportRequest, TransportResponse,
};
pub use publisher::{Publisher, PublishingStats};
pub use router::{AlertProcessingReport, AlertRouter, RouterPorts};
pub use targets::{TargetManager, TargetManagerStats};
pub use types::{
    Alert, AlertStatus, ClassificationResult, EnrichedAlert, FilterConfig, PublishingTarget,
    Severity, TargetFormat,
};
