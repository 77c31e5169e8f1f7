//! Running one test's steps against a session.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::browser::PageSession;
use crate::config::Timeouts;
use crate::generation::{Assertion, TestStep};
use crate::healing::{HealingContext, HealingDecision, HealingEvent, SelfHealingEngine};

/// Executes steps for one test on one session.
pub struct StepRunner<'a> {
    session: &'a dyn PageSession,
    engine: Option<&'a SelfHealingEngine>,
    http: &'a reqwest::Client,
    timeouts: Timeouts,
    test_id: &'a str,
    last_status: Option<u16>,
    /// Healing attempts made so far, applied or not
    pub healing: Vec<HealingEvent>,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        session: &'a dyn PageSession,
        engine: Option<&'a SelfHealingEngine>,
        http: &'a reqwest::Client,
        timeouts: Timeouts,
        test_id: &'a str,
    ) -> Self {
        Self {
            session,
            engine,
            http,
            timeouts,
            test_id,
            last_status: None,
            healing: Vec::new(),
        }
    }

    /// Whether any step ran on a healed locator.
    pub fn healed(&self) -> bool {
        self.healing
            .iter()
            .any(|e| e.decision == HealingDecision::AutoApply)
    }

    pub async fn run(&mut self, index: usize, step: &TestStep) -> Result<()> {
        match step {
            TestStep::Navigate { url } => {
                let nav = self.session.navigate(url).await?;
                self.last_status = nav.status;
                Ok(())
            }
            TestStep::Press { key } => self.session.press(key).await,
            TestStep::Wait { duration_ms } => {
                self.session
                    .wait_idle(Duration::from_millis(*duration_ms))
                    .await
            }
            TestStep::WaitFor { locator } => {
                self.session
                    .wait_for(locator, self.timeouts.interaction())
                    .await
            }
            TestStep::Assert { assertion } => self.check(assertion).await,
            TestStep::ApiRequest {
                method,
                url,
                body,
                expected_status,
            } => self.api_request(method, url, body.as_ref(), *expected_status).await,
            TestStep::Comment { text } => {
                tracing::debug!("[{}] {}", self.test_id, text);
                Ok(())
            }
            TestStep::Click { .. }
            | TestStep::Fill { .. }
            | TestStep::Select { .. }
            | TestStep::Check { .. }
            | TestStep::Uncheck { .. } => self.run_element_step(index, step).await,
        }
    }

    async fn act(&self, step: &TestStep) -> Result<()> {
        match step {
            TestStep::Click { locator, .. } => self.session.click(locator).await,
            TestStep::Fill { locator, value, .. } => self.session.fill(locator, value).await,
            TestStep::Select { locator, value } => self.session.select(locator, value).await,
            TestStep::Check { locator } => self.session.set_checked(locator, true).await,
            TestStep::Uncheck { locator } => self.session.set_checked(locator, false).await,
            other => Err(anyhow!("not an element step: {:?}", other)),
        }
    }

    /// Literal locator first; on failure heal once and retry on auto-apply.
    async fn run_element_step(&mut self, index: usize, step: &TestStep) -> Result<()> {
        let original = match self.act(step).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let (Some(engine), Some(locator)) = (self.engine, step.healable_locator()) else {
            return Err(original);
        };

        let ctx = HealingContext {
            failed_locator: locator.to_string(),
            object_id: step.object_id().map(str::to_string),
            step_index: index,
            test_case_id: self.test_id.to_string(),
            error_message: original.to_string(),
        };
        let started = Instant::now();
        let outcome = engine.heal(&ctx, self.session).await;
        let mut event = HealingEvent {
            test_id: self.test_id.to_string(),
            step_index: index,
            failed_locator: ctx.failed_locator.clone(),
            result: outcome.result.clone(),
            decision: outcome.decision,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let result = match (outcome.decision, outcome.result) {
            (HealingDecision::AutoApply, Some(result)) => result,
            (decision, result) => {
                if let (HealingDecision::Suggest, Some(r)) = (decision, &result) {
                    tracing::info!(
                        "Suggested locator for {} in {}: {} ({:.2})",
                        ctx.failed_locator,
                        self.test_id,
                        r.new_locator,
                        r.confidence
                    );
                }
                self.healing.push(event);
                return Err(original);
            }
        };

        match self.act(&step.with_locator(&result.new_locator)).await {
            Ok(()) => {
                engine.record_success(&ctx, &result);
                self.healing.push(event);
                Ok(())
            }
            Err(retry) => {
                tracing::debug!("Healed locator {} also failed: {}", result.new_locator, retry);
                engine.record_failure(&ctx, &result);
                event.decision = HealingDecision::Reject;
                self.healing.push(event);
                Err(original)
            }
        }
    }

    async fn check(&self, assertion: &Assertion) -> Result<()> {
        match assertion {
            Assertion::PageLoaded => match self.last_status {
                Some(status) if status >= 400 => {
                    bail!("Assertion failed: expected a successful load, got HTTP {}", status)
                }
                _ => Ok(()),
            },
            Assertion::TitleContains { expected } => {
                let title = self.session.title().await?;
                if title.contains(expected.as_str()) {
                    Ok(())
                } else {
                    bail!(
                        "Assertion failed: expected title to contain '{}', got '{}'",
                        expected,
                        title
                    )
                }
            }
            Assertion::UrlContains { expected } => {
                let url = self.session.current_url().await?;
                if url.contains(expected.as_str()) {
                    Ok(())
                } else {
                    bail!(
                        "Assertion failed: expected URL to contain '{}', got '{}'",
                        expected,
                        url
                    )
                }
            }
            Assertion::ElementVisible { locator } => {
                if self
                    .session
                    .wait_for(locator, self.timeouts.interaction())
                    .await
                    .is_ok()
                {
                    Ok(())
                } else {
                    bail!("Assertion failed: expected {} to be visible", locator)
                }
            }
            Assertion::TextVisible { expected } => {
                let text = self.session.page_text().await?;
                if text.contains(expected.as_str()) {
                    Ok(())
                } else {
                    bail!("Assertion failed: expected page text '{}'", expected)
                }
            }
            Assertion::AnyVisible { locators } => {
                let joined = locators.join(", ");
                if self.session.is_visible(&joined).await.unwrap_or(false) {
                    Ok(())
                } else {
                    bail!("Assertion failed: expected one of [{}] to be visible", joined)
                }
            }
        }
    }

    async fn api_request(
        &self,
        method: &str,
        url: &str,
        body: Option<&serde_json::Value>,
        expected: u16,
    ) -> Result<()> {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .with_context(|| format!("invalid HTTP method {}", method))?;
        let mut request = self
            .http
            .request(method.clone(), url)
            .timeout(self.timeouts.navigation());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url))?;
        let status = response.status().as_u16();
        if status != expected {
            bail!(
                "Assertion failed: expected {} {} to return {}, got {}",
                method,
                url,
                expected,
                status
            );
        }
        Ok(())
    }
}

/// Shared HTTP client for API steps.
pub fn http_client() -> Arc<reqwest::Client> {
    Arc::new(
        reqwest::Client::builder()
            .user_agent(concat!("autotest/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::{MockBrowser, MockElement, MockPage, MockSite};
    use crate::browser::{Browser, SessionOptions};
    use crate::config::HealingConfig;
    use crate::healing::{HealingResult, LocatorRegistry};

    fn site() -> MockSite {
        MockSite::new("https://app.test")
            .page(
                MockPage::new("/", "Home")
                    .element(MockElement::button("Send").name("submit-btn").navigates_to("/done")),
            )
            .page(MockPage::new("/done", "Done"))
    }

    async fn session() -> Arc<dyn PageSession> {
        let browser = MockBrowser::new(Arc::new(site()));
        browser.new_session(SessionOptions::default()).await.unwrap()
    }

    fn click(locator: &str) -> TestStep {
        TestStep::Click {
            locator: locator.into(),
            object_id: None,
        }
    }

    #[tokio::test]
    async fn test_heals_and_retries() {
        let session = session().await;
        let http = reqwest::Client::new();
        let engine =
            SelfHealingEngine::with_defaults(HealingConfig::default(), Arc::new(LocatorRegistry::new()));
        let mut runner = StepRunner::new(session.as_ref(), Some(&engine), &http, Timeouts::default(), "t1");

        runner
            .run(0, &TestStep::Navigate { url: "https://app.test/".into() })
            .await
            .unwrap();
        runner.run(1, &click("#submit-btn")).await.unwrap();
        assert!(runner.healed());
        assert_eq!(session.current_url().await.unwrap(), "https://app.test/done");
        assert_eq!(engine.history_for("#submit-btn").len(), 1);
    }

    #[tokio::test]
    async fn test_stale_history_dropped_after_failed_retry() {
        let session = session().await;
        let http = reqwest::Client::new();
        let engine =
            SelfHealingEngine::with_defaults(HealingConfig::default(), Arc::new(LocatorRegistry::new()));
        let stale = HealingContext {
            failed_locator: "#submit-btn".into(),
            object_id: None,
            step_index: 1,
            test_case_id: "t0".into(),
            error_message: "Element not found".into(),
        };
        engine.record_success(&stale, &HealingResult::new("fallback", "#gone", 0.9));

        let mut runner = StepRunner::new(session.as_ref(), Some(&engine), &http, Timeouts::default(), "t1");
        runner
            .run(0, &TestStep::Navigate { url: "https://app.test/".into() })
            .await
            .unwrap();
        assert!(runner.run(1, &click("#submit-btn")).await.is_err());
        assert_eq!(runner.healing[0].decision, HealingDecision::Reject);
        assert!(engine.history_for("#submit-btn").is_empty());

        runner.run(2, &click("#submit-btn")).await.unwrap();
        assert_eq!(runner.healing[1].decision, HealingDecision::AutoApply);
        assert_eq!(runner.healing[1].result.as_ref().unwrap().strategy, "fallback");
        assert_eq!(session.current_url().await.unwrap(), "https://app.test/done");
    }

    #[tokio::test]
    async fn test_without_healing_original_error_surfaces() {
        let session = session().await;
        let http = reqwest::Client::new();
        let mut runner = StepRunner::new(session.as_ref(), None, &http, Timeouts::default(), "t1");
        runner
            .run(0, &TestStep::Navigate { url: "https://app.test/".into() })
            .await
            .unwrap();
        let err = runner.run(1, &click("#submit-btn")).await.unwrap_err();
        assert!(err.to_string().contains("#submit-btn"));
        assert!(!runner.healed());
        assert!(runner.healing.is_empty());
    }

    #[tokio::test]
    async fn test_suggest_does_not_apply() {
        let session = session().await;
        let http = reqwest::Client::new();
        // Derived alternates score 0.75, below this threshold
        let config = HealingConfig {
            auto_apply_threshold: 0.8,
            suggestion_min: 0.5,
            suggestion_max: 0.8,
            similarity_enabled: false,
            ..HealingConfig::default()
        };
        let engine = SelfHealingEngine::with_defaults(config, Arc::new(LocatorRegistry::new()));
        let mut runner = StepRunner::new(session.as_ref(), Some(&engine), &http, Timeouts::default(), "t1");
        runner
            .run(0, &TestStep::Navigate { url: "https://app.test/".into() })
            .await
            .unwrap();
        assert!(runner.run(1, &click("#submit-btn")).await.is_err());
        assert_eq!(runner.healing.len(), 1);
        assert_eq!(runner.healing[0].decision, HealingDecision::Suggest);
        assert!(!runner.healed());
    }

    #[tokio::test]
    async fn test_assertions() {
        let session = session().await;
        let http = reqwest::Client::new();
        let mut runner = StepRunner::new(session.as_ref(), None, &http, Timeouts::default(), "t1");
        runner
            .run(0, &TestStep::Navigate { url: "https://app.test/".into() })
            .await
            .unwrap();
        let assert = |assertion| TestStep::Assert { assertion };

        runner.run(1, &assert(Assertion::PageLoaded)).await.unwrap();
        runner
            .run(2, &assert(Assertion::TitleContains { expected: "Home".into() }))
            .await
            .unwrap();
        let err = runner
            .run(3, &assert(Assertion::TitleContains { expected: "Away".into() }))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Assertion failed"));
        runner
            .run(4, &assert(Assertion::AnyVisible { locators: vec![".nope".into(), "[name=\"submit-btn\"]".into()] }))
            .await
            .unwrap();

        runner
            .run(5, &TestStep::Navigate { url: "https://app.test/missing".into() })
            .await
            .unwrap();
        assert!(runner.run(6, &assert(Assertion::PageLoaded)).await.is_err());
    }
}
