//! Strategy registry, healing history and decision policy.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::browser::PageSession;
use crate::config::HealingConfig;

use super::registry::LocatorRegistry;
use super::{
    FallbackStrategy, HealingContext, HealingDecision, HealingResult, HealingStrategy,
    SimilarityStrategy, HISTORICAL,
};

/// Successful heals remembered per failed locator.
pub const HISTORY_PER_KEY: usize = 10;
/// Distinct failed locators remembered.
pub const HISTORY_KEYS: usize = 10_000;

const HISTORICAL_BOOST: f64 = 0.05;
const HISTORICAL_CEILING: f64 = 0.99;

/// Outcome of one healing attempt.
#[derive(Debug, Clone)]
pub struct HealingOutcome {
    pub result: Option<HealingResult>,
    pub decision: HealingDecision,
    /// Strategies that ran
    pub attempts: usize,
    pub elapsed: Duration,
}

/// Repairs failed locators.
///
/// Shared by every executor batch for the lifetime of a run. The history
/// lock is only held for synchronous bookkeeping, never across an await.
pub struct SelfHealingEngine {
    strategies: Vec<Arc<dyn HealingStrategy>>,
    config: HealingConfig,
    history: Mutex<LruCache<String, VecDeque<HealingResult>>>,
}

impl SelfHealingEngine {
    /// Engine with no strategies.
    pub fn new(config: HealingConfig) -> Self {
        let capacity = NonZeroUsize::new(HISTORY_KEYS).unwrap_or(NonZeroUsize::MIN);
        Self {
            strategies: Vec::new(),
            config,
            history: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Engine with the built-in strategies enabled by `config`.
    pub fn with_defaults(config: HealingConfig, registry: Arc<LocatorRegistry>) -> Self {
        let mut engine = Self::new(config);
        engine.register(Arc::new(FallbackStrategy::new(registry)));
        if config.similarity_enabled {
            engine.register(Arc::new(SimilarityStrategy::new()));
        }
        engine
    }

    /// Add a strategy, replacing one with the same name.
    pub fn register(&mut self, strategy: Arc<dyn HealingStrategy>) {
        self.strategies.retain(|s| s.name() != strategy.name());
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| s.priority());
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.strategies.len();
        self.strategies.retain(|s| s.name() != name);
        self.strategies.len() != before
    }

    pub fn strategy(&self, name: &str) -> Option<&Arc<dyn HealingStrategy>> {
        self.strategies.iter().find(|s| s.name() == name)
    }

    /// Strategy names in the order they run.
    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn config(&self) -> &HealingConfig {
        &self.config
    }

    pub fn decide(&self, confidence: f64) -> HealingDecision {
        HealingDecision::for_confidence(confidence, &self.config)
    }

    /// Try to repair `ctx.failed_locator` on the session's current page.
    pub async fn heal(&self, ctx: &HealingContext, session: &dyn PageSession) -> HealingOutcome {
        let start = Instant::now();

        if let Some(result) = self.replay_history(&ctx.failed_locator) {
            tracing::debug!(
                "Replaying healed locator {} -> {} ({:.2})",
                ctx.failed_locator,
                result.new_locator,
                result.confidence
            );
            return HealingOutcome {
                decision: self.decide(result.confidence),
                result: Some(result),
                attempts: 0,
                elapsed: start.elapsed(),
            };
        }

        let budget = self.config.budget();
        let mut attempts = 0;
        for strategy in &self.strategies {
            if start.elapsed() >= budget {
                tracing::debug!(
                    "Healing budget of {:?} spent after {} strategies",
                    budget,
                    attempts
                );
                break;
            }
            if !strategy.is_applicable(ctx) {
                continue;
            }
            attempts += 1;
            if let Some(result) = strategy.heal(ctx, session).await {
                let decision = self.decide(result.confidence);
                tracing::info!(
                    "Healed {} -> {} via {} ({:.2}, {:?})",
                    ctx.failed_locator,
                    result.new_locator,
                    result.strategy,
                    result.confidence,
                    decision
                );
                return HealingOutcome {
                    result: Some(result),
                    decision,
                    attempts,
                    elapsed: start.elapsed(),
                };
            }
        }

        tracing::debug!("No healing found for {}", ctx.failed_locator);
        HealingOutcome {
            result: None,
            decision: HealingDecision::Reject,
            attempts,
            elapsed: start.elapsed(),
        }
    }

    fn replay_history(&self, failed_locator: &str) -> Option<HealingResult> {
        let mut history = self.history.lock();
        let prior = history.get(failed_locator)?.back()?;
        Some(
            HealingResult::new(
                HISTORICAL,
                prior.new_locator.clone(),
                (prior.confidence + HISTORICAL_BOOST).min(HISTORICAL_CEILING),
            )
            .with_meta("originalStrategy", prior.strategy.clone()),
        )
    }

    /// Remember a heal whose retried step succeeded.
    pub fn record_success(&self, ctx: &HealingContext, result: &HealingResult) {
        {
            let mut history = self.history.lock();
            if let Some(entries) = history.get_mut(&ctx.failed_locator) {
                if entries.len() >= HISTORY_PER_KEY {
                    entries.pop_front();
                }
                entries.push_back(result.clone());
            } else {
                history.put(ctx.failed_locator.clone(), VecDeque::from([result.clone()]));
            }
        }
        let origin = result
            .metadata
            .get("originalStrategy")
            .map(String::as_str)
            .unwrap_or(result.strategy.as_str());
        if let Some(strategy) = self.strategy(origin) {
            strategy.record_success(ctx, result);
        }
    }

    /// Forget a remembered heal whose retried step failed.
    ///
    /// Drops every entry for `ctx.failed_locator` pointing at the same
    /// replacement so the next failure runs the strategies again.
    pub fn record_failure(&self, ctx: &HealingContext, result: &HealingResult) {
        let mut history = self.history.lock();
        let Some(entries) = history.get_mut(&ctx.failed_locator) else {
            return;
        };
        entries.retain(|prior| prior.new_locator != result.new_locator);
        if entries.is_empty() {
            history.pop(&ctx.failed_locator);
        }
        tracing::debug!(
            "Dropped stale heal {} -> {}",
            ctx.failed_locator,
            result.new_locator
        );
    }

    /// Remembered heals for a failed locator, oldest first.
    pub fn history_for(&self, failed_locator: &str) -> Vec<HealingResult> {
        self.history
            .lock()
            .peek(failed_locator)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn history_keys(&self) -> usize {
        self.history.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::{MockBrowser, MockElement, MockPage, MockSite};
    use crate::browser::{Browser, SessionOptions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(locator: &str) -> HealingContext {
        HealingContext {
            failed_locator: locator.into(),
            object_id: None,
            step_index: 0,
            test_case_id: "t".into(),
            error_message: "Element not found".into(),
        }
    }

    async fn session(page: MockPage) -> Arc<dyn PageSession> {
        let site = MockSite::new("https://app.test").page(page);
        let browser = MockBrowser::new(Arc::new(site));
        let session = browser.new_session(SessionOptions::default()).await.unwrap();
        session.navigate("https://app.test/").await.unwrap();
        session
    }

    struct Fixed {
        name: &'static str,
        priority: u32,
        confidence: Option<f64>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, priority: u32, confidence: Option<f64>) -> Self {
            Self {
                name,
                priority,
                confidence,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HealingStrategy for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> u32 {
            self.priority
        }
        fn is_applicable(&self, _ctx: &HealingContext) -> bool {
            true
        }
        async fn heal(&self, _ctx: &HealingContext, _session: &dyn PageSession) -> Option<HealingResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.confidence.map(|c| HealingResult::new(self.name, "#fixed", c))
        }
    }

    #[test]
    fn test_registry_orders_by_priority_and_replaces_by_name() {
        let mut engine = SelfHealingEngine::new(HealingConfig::default());
        engine.register(Arc::new(Fixed::new("b", 2, None)));
        engine.register(Arc::new(Fixed::new("a", 1, None)));
        engine.register(Arc::new(Fixed::new("b", 3, None)));
        assert_eq!(engine.strategy_names(), vec!["a", "b"]);
        assert!(engine.unregister("a"));
        assert!(!engine.unregister("a"));
    }

    #[test]
    fn test_defaults_respect_similarity_toggle() {
        let registry = Arc::new(LocatorRegistry::new());
        let engine = SelfHealingEngine::with_defaults(HealingConfig::default(), registry.clone());
        assert_eq!(engine.strategy_names(), vec!["fallback", "similarity"]);
        let config = HealingConfig {
            similarity_enabled: false,
            ..HealingConfig::default()
        };
        let engine = SelfHealingEngine::with_defaults(config, registry);
        assert_eq!(engine.strategy_names(), vec!["fallback"]);
    }

    #[tokio::test]
    async fn test_first_result_wins_and_sets_decision() {
        let session = session(MockPage::new("/", "Home")).await;
        let mut engine = SelfHealingEngine::new(HealingConfig::default());
        let low = Arc::new(Fixed::new("low", 1, None));
        let mid = Arc::new(Fixed::new("mid", 2, Some(0.6)));
        let high = Arc::new(Fixed::new("high", 3, Some(0.95)));
        engine.register(low.clone());
        engine.register(mid.clone());
        engine.register(high.clone());

        let outcome = engine.heal(&ctx("#x"), session.as_ref()).await;
        assert_eq!(outcome.result.unwrap().strategy, "mid");
        assert_eq!(outcome.decision, HealingDecision::Suggest);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(high.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_budget_checked_between_strategies() {
        let session = session(MockPage::new("/", "Home")).await;
        let config = HealingConfig {
            budget_ms: 10,
            ..HealingConfig::default()
        };
        let mut engine = SelfHealingEngine::new(config);
        let mut slow = Fixed::new("slow", 1, None);
        slow.delay = Duration::from_millis(30);
        let later = Arc::new(Fixed::new("later", 2, Some(0.9)));
        engine.register(Arc::new(slow));
        engine.register(later.clone());

        let outcome = engine.heal(&ctx("#x"), session.as_ref()).await;
        assert!(outcome.result.is_none());
        assert_eq!(outcome.decision, HealingDecision::Reject);
        assert_eq!(later.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_history_replay_boosts_confidence() {
        let session = session(MockPage::new("/", "Home")).await;
        let engine = SelfHealingEngine::new(HealingConfig::default());
        let context = ctx("#old");

        engine.record_success(&context, &HealingResult::new("fallback", "#new", 0.75));
        let outcome = engine.heal(&context, session.as_ref()).await;
        let result = outcome.result.unwrap();
        assert_eq!(result.strategy, HISTORICAL);
        assert_eq!(result.new_locator, "#new");
        assert!((result.confidence - 0.80).abs() < 1e-9);
        assert_eq!(outcome.attempts, 0);

        engine.record_success(&context, &HealingResult::new("fallback", "#new", 0.97));
        let result = engine.heal(&context, session.as_ref()).await.result.unwrap();
        assert_eq!(result.confidence, 0.99);
    }

    #[tokio::test]
    async fn test_failed_replay_falls_back_to_strategies() {
        let session = session(MockPage::new("/", "Home")).await;
        let mut engine = SelfHealingEngine::new(HealingConfig::default());
        let fixed = Arc::new(Fixed::new("fixed", 1, Some(0.9)));
        engine.register(fixed.clone());
        let context = ctx("#old");

        engine.record_success(&context, &HealingResult::new("fixed", "#gone", 0.9));
        let replayed = engine.heal(&context, session.as_ref()).await.result.unwrap();
        assert_eq!(replayed.strategy, HISTORICAL);
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 0);

        engine.record_failure(&context, &replayed);
        assert!(engine.history_for("#old").is_empty());
        assert_eq!(engine.history_keys(), 0);

        let outcome = engine.heal(&context, session.as_ref()).await;
        let result = outcome.result.unwrap();
        assert_eq!(result.strategy, "fixed");
        assert_eq!(result.new_locator, "#fixed");
        assert_eq!(outcome.attempts, 1);
        assert_eq!(fixed.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_keeps_other_replacements() {
        let engine = SelfHealingEngine::new(HealingConfig::default());
        let context = ctx("#old");
        engine.record_success(&context, &HealingResult::new("fallback", "#a", 0.8));
        engine.record_success(&context, &HealingResult::new("fallback", "#b", 0.8));
        engine.record_failure(&context, &HealingResult::new(HISTORICAL, "#b", 0.85));
        let history = engine.history_for("#old");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].new_locator, "#a");
        engine.record_failure(&ctx("#unknown"), &HealingResult::new(HISTORICAL, "#a", 0.85));
        assert_eq!(engine.history_keys(), 1);
    }

    #[test]
    fn test_history_bounded_per_key() {
        let engine = SelfHealingEngine::new(HealingConfig::default());
        let context = ctx("#old");
        for i in 0..15 {
            engine.record_success(&context, &HealingResult::new("fallback", format!("#n{}", i), 0.8));
        }
        let history = engine.history_for("#old");
        assert_eq!(history.len(), HISTORY_PER_KEY);
        assert_eq!(history[0].new_locator, "#n5");
        assert_eq!(engine.history_keys(), 1);
    }

    #[tokio::test]
    async fn test_fallback_only_engine_heals_submit_button() {
        let session = session(
            MockPage::new("/", "Home").element(MockElement::button("Send").name("submit-btn")),
        )
        .await;
        let config = HealingConfig {
            similarity_enabled: false,
            ..HealingConfig::default()
        };
        let engine = SelfHealingEngine::with_defaults(config, Arc::new(LocatorRegistry::new()));
        let outcome = engine.heal(&ctx("#submit-btn"), session.as_ref()).await;
        assert_eq!(outcome.decision, HealingDecision::AutoApply);
        assert_eq!(outcome.result.unwrap().new_locator, "[name=\"submit-btn\"]");
    }
}
