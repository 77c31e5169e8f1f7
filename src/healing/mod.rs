//! Locator self-healing.
//!
//! A failed locator is handed to the [`SelfHealingEngine`], which replays a
//! prior repair from its history or asks each applicable
//! [`HealingStrategy`] in priority order for a replacement.
//!
//! ```text
//! failed locator ──► history hit? ──yes──► HISTORICAL result
//!                        │ no
//!                        ▼
//!              Fallback (1) ─► Similarity (2) ─► ...   (budget checked between)
//!                        │
//!                        ▼
//!              decision: auto-apply / suggest / reject
//! ```

pub mod engine;
pub mod fallback;
pub mod registry;
pub mod similarity;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::browser::PageSession;
use crate::config::HealingConfig;

pub use engine::SelfHealingEngine;
pub use fallback::FallbackStrategy;
pub use registry::{LocatorRegistry, RegisteredLocator};
pub use similarity::SimilarityStrategy;

/// Strategy name used for results replayed from history.
pub const HISTORICAL: &str = "HISTORICAL";

/// Everything a strategy knows about the failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingContext {
    pub failed_locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    pub step_index: usize,
    pub test_case_id: String,
    pub error_message: String,
}

/// A proposed replacement locator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingResult {
    pub strategy: String,
    pub new_locator: String,
    /// In `[0, 1]`
    pub confidence: f64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl HealingResult {
    pub fn new(strategy: &str, new_locator: impl Into<String>, confidence: f64) -> Self {
        Self {
            strategy: strategy.to_string(),
            new_locator: new_locator.into(),
            confidence: confidence.clamp(0.0, 1.0),
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// What to do with a healing result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingDecision {
    AutoApply,
    Suggest,
    Reject,
}

impl HealingDecision {
    /// Decide from a confidence score.
    ///
    /// `auto` iff `c >= auto_apply_threshold`; `suggest` iff
    /// `suggestion_min <= c < suggestion_max`; otherwise `reject`.
    pub fn for_confidence(confidence: f64, config: &HealingConfig) -> Self {
        if confidence >= config.auto_apply_threshold {
            HealingDecision::AutoApply
        } else if confidence >= config.suggestion_min && confidence < config.suggestion_max {
            HealingDecision::Suggest
        } else {
            HealingDecision::Reject
        }
    }
}

/// Record of one healing attempt, exported to result sinks and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingEvent {
    pub test_id: String,
    pub step_index: usize,
    pub failed_locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<HealingResult>,
    pub decision: HealingDecision,
    pub duration_ms: u64,
}

/// One locator-repair algorithm.
#[async_trait]
pub trait HealingStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> u32;

    fn is_applicable(&self, ctx: &HealingContext) -> bool;

    async fn heal(&self, ctx: &HealingContext, session: &dyn PageSession) -> Option<HealingResult>;

    /// Called after a result from this strategy was applied and the retried
    /// step succeeded.
    fn record_success(&self, _ctx: &HealingContext, _result: &HealingResult) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_boundaries() {
        let config = HealingConfig::default();
        assert_eq!(HealingDecision::for_confidence(0.7, &config), HealingDecision::AutoApply);
        assert_eq!(HealingDecision::for_confidence(1.0, &config), HealingDecision::AutoApply);
        assert_eq!(HealingDecision::for_confidence(0.6999, &config), HealingDecision::Suggest);
        assert_eq!(HealingDecision::for_confidence(0.5, &config), HealingDecision::Suggest);
        assert_eq!(HealingDecision::for_confidence(0.4999, &config), HealingDecision::Reject);
        assert_eq!(HealingDecision::for_confidence(0.0, &config), HealingDecision::Reject);
    }

    #[test]
    fn test_decision_gap_between_suggest_and_auto_rejects() {
        let config = HealingConfig {
            auto_apply_threshold: 0.9,
            suggestion_min: 0.5,
            suggestion_max: 0.8,
            ..HealingConfig::default()
        };
        assert_eq!(HealingDecision::for_confidence(0.85, &config), HealingDecision::Reject);
        assert_eq!(HealingDecision::for_confidence(0.8, &config), HealingDecision::Reject);
        assert_eq!(HealingDecision::for_confidence(0.79, &config), HealingDecision::Suggest);
        assert_eq!(HealingDecision::for_confidence(0.9, &config), HealingDecision::AutoApply);
    }

    #[test]
    fn test_result_confidence_clamped() {
        assert_eq!(HealingResult::new("x", "#a", 1.4).confidence, 1.0);
        assert_eq!(HealingResult::new("x", "#a", -0.1).confidence, 0.0);
    }
}
