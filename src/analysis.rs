//! Failure classification and ticket filing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::execution::TestResult;
use crate::generation::GeneratedTest;
use crate::llm::{extract_json, CompletionOptions, LlmProvider};

/// Minimum confidence for filing a ticket.
pub const TICKET_CONFIDENCE: f64 = 0.8;

const HEURISTIC_MATCH_CONFIDENCE: f64 = 0.6;
const HEURISTIC_DEFAULT_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    AppBug,
    TestIssue,
    Environment,
    Flaky,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuggestedFix {
    #[serde(rename = "forDeveloper", alias = "for_developer", default)]
    pub for_developer: String,
    #[serde(rename = "forQA", alias = "forQa", alias = "for_qa", default)]
    pub for_qa: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub test_id: String,
    pub category: FailureCategory,
    pub root_cause: String,
    pub suggested_fix: SuggestedFix,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jira_ticket: Option<String>,
}

/// Ticket to file for an application bug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketRequest {
    pub summary: String,
    pub description: String,
    pub priority: String,
    pub labels: Vec<String>,
}

/// Issue tracker collaborator.
#[async_trait]
pub trait TicketTracker: Send + Sync {
    /// File a ticket and return its key.
    async fn create_ticket(&self, ticket: &TicketRequest) -> anyhow::Result<String>;
}

/// What the LLM is asked to return.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmVerdict {
    category: FailureCategory,
    #[serde(alias = "root_cause")]
    root_cause: String,
    #[serde(default, alias = "suggested_fix")]
    suggested_fix: SuggestedFix,
    confidence: f64,
}

/// Keyword classification of an error message.
pub fn classify_error(error: &str) -> (FailureCategory, f64, &'static str) {
    let e = error.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| e.contains(w));
    if has(&["timeout", "timed out", "network", "net::", "connection", "dns"]) {
        (
            FailureCategory::Environment,
            HEURISTIC_MATCH_CONFIDENCE,
            "The page or service did not respond in time",
        )
    } else if has(&["locator", "not found", "no element", "selector"]) {
        (
            FailureCategory::TestIssue,
            HEURISTIC_MATCH_CONFIDENCE,
            "The test could not find the element it targets",
        )
    } else if has(&["assertion", "expected"]) {
        (
            FailureCategory::AppBug,
            HEURISTIC_MATCH_CONFIDENCE,
            "The application did not behave as the test expected",
        )
    } else {
        (
            FailureCategory::TestIssue,
            HEURISTIC_DEFAULT_CONFIDENCE,
            "Unclassified test failure",
        )
    }
}

fn fix_for(category: FailureCategory) -> SuggestedFix {
    let (dev, qa) = match category {
        FailureCategory::AppBug => (
            "Reproduce the failing step and check the server logs for this request",
            "Confirm the expected behavior and attach the screenshot to the bug",
        ),
        FailureCategory::TestIssue => (
            "Add stable test attributes (data-testid) to the element",
            "Update the locator or regenerate the test from a fresh crawl",
        ),
        FailureCategory::Environment => (
            "Check that the application and its dependencies are reachable",
            "Re-run once the environment is stable",
        ),
        FailureCategory::Flaky => (
            "Look for race conditions around the failing step",
            "Add an explicit wait before the failing step",
        ),
    };
    SuggestedFix {
        for_developer: dev.to_string(),
        for_qa: qa.to_string(),
    }
}

/// Classifies failed tests, asking the LLM first when one is configured.
pub struct FailureAnalyzer {
    llm: Option<Arc<dyn LlmProvider>>,
    tracker: Option<Arc<dyn TicketTracker>>,
    create_tickets: bool,
}

impl FailureAnalyzer {
    pub fn new() -> Self {
        Self {
            llm: None,
            tracker: None,
            create_tickets: false,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// File tickets for confident application bugs.
    pub fn with_tracker(mut self, tracker: Arc<dyn TicketTracker>, enabled: bool) -> Self {
        self.tracker = Some(tracker);
        self.create_tickets = enabled;
        self
    }

    /// Analyze every failed result.
    pub async fn analyze_all(
        &self,
        results: &[TestResult],
        tests: &[GeneratedTest],
    ) -> Vec<AnalysisResult> {
        let mut analyses = Vec::with_capacity(results.len());
        for result in results {
            let test = tests.iter().find(|t| t.id == result.test_id);
            analyses.push(self.analyze(result, test).await);
        }
        analyses
    }

    pub async fn analyze(&self, result: &TestResult, test: Option<&GeneratedTest>) -> AnalysisResult {
        let mut analysis = match self.ask_llm(result, test).await {
            Some(analysis) => analysis,
            None => Self::heuristic(result),
        };

        if self.create_tickets
            && analysis.category == FailureCategory::AppBug
            && analysis.confidence >= TICKET_CONFIDENCE
        {
            if let Some(tracker) = &self.tracker {
                match tracker.create_ticket(&ticket_for(result, &analysis)).await {
                    Ok(key) => {
                        tracing::info!("Filed {} for {}", key, result.name);
                        analysis.jira_ticket = Some(key);
                    }
                    Err(e) => tracing::warn!("Ticket creation failed for {}: {}", result.name, e),
                }
            }
        }
        analysis
    }

    /// Keyword classification of the recorded error.
    pub fn heuristic(result: &TestResult) -> AnalysisResult {
        let error = result.error.as_deref().unwrap_or_default();
        let (category, confidence, root_cause) = classify_error(error);
        AnalysisResult {
            test_id: result.test_id.clone(),
            category,
            root_cause: root_cause.to_string(),
            suggested_fix: fix_for(category),
            confidence,
            jira_ticket: None,
        }
    }

    async fn ask_llm(&self, result: &TestResult, test: Option<&GeneratedTest>) -> Option<AnalysisResult> {
        let llm = self.llm.as_ref()?;
        let reply = match llm
            .complete(&analysis_prompt(result, test), &CompletionOptions::default())
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("LLM analysis failed, using heuristics: {}", e);
                return None;
            }
        };
        let verdict: LlmVerdict = match extract_json(&reply).map(serde_json::from_str::<LlmVerdict>) {
            Some(Ok(verdict)) => verdict,
            _ => {
                tracing::debug!("Unparsable analysis reply for {}", result.name);
                return None;
            }
        };
        Some(AnalysisResult {
            test_id: result.test_id.clone(),
            category: verdict.category,
            root_cause: verdict.root_cause,
            suggested_fix: verdict.suggested_fix,
            confidence: verdict.confidence.clamp(0.0, 1.0),
            jira_ticket: None,
        })
    }
}

impl Default for FailureAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn analysis_prompt(result: &TestResult, test: Option<&GeneratedTest>) -> String {
    let steps = test
        .and_then(|t| serde_json::to_string_pretty(&t.steps).ok())
        .unwrap_or_else(|| "(unavailable)".to_string());
    format!(
        r#"You triage failed end-to-end browser tests.

Test: {}
Failed at step: {}
Error: {}
Steps:
{}

Classify the failure as one of APP_BUG, TEST_ISSUE, ENVIRONMENT, FLAKY.
Respond with ONLY this JSON object:
{{"category": "...", "rootCause": "...", "suggestedFix": {{"forDeveloper": "...", "forQA": "..."}}, "confidence": 0.0}}"#,
        result.name,
        result
            .failed_step
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into()),
        result.error.as_deref().unwrap_or("none"),
        steps
    )
}

fn ticket_for(result: &TestResult, analysis: &AnalysisResult) -> TicketRequest {
    let mut description = format!(
        "Test: {}\nError: {}\nRoot cause: {}\nSuggested fix: {}\n",
        result.name,
        result.error.as_deref().unwrap_or("none"),
        analysis.root_cause,
        analysis.suggested_fix.for_developer
    );
    for shot in &result.screenshots {
        description.push_str(&format!("Screenshot: {}\n", shot.display()));
    }
    TicketRequest {
        summary: format!("[autotest] {}", result.name),
        description,
        priority: if analysis.confidence >= 0.9 { "High" } else { "Medium" }.to_string(),
        labels: vec!["autotest".into(), "app-bug".into()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::TestStatus;
    use parking_lot::Mutex;

    fn failed(error: &str) -> TestResult {
        TestResult {
            test_id: "t1".into(),
            name: "Submit form".into(),
            status: TestStatus::Failed,
            duration_ms: 10,
            error: Some(error.into()),
            failed_step: Some(2),
            screenshots: vec![],
            video: None,
            healing: vec![],
        }
    }

    struct Canned(String);

    #[async_trait]
    impl LlmProvider for Canned {
        async fn complete(&self, _p: &str, _o: &CompletionOptions) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TicketRequest>>);

    #[async_trait]
    impl TicketTracker for Recorder {
        async fn create_ticket(&self, ticket: &TicketRequest) -> anyhow::Result<String> {
            let mut tickets = self.0.lock();
            tickets.push(ticket.clone());
            Ok(format!("QA-{}", tickets.len()))
        }
    }

    #[test]
    fn test_heuristics() {
        assert_eq!(classify_error("Navigation timed out").0, FailureCategory::Environment);
        assert_eq!(classify_error("net::ERR_CONNECTION_REFUSED").0, FailureCategory::Environment);
        assert_eq!(classify_error("Element not found: #go").0, FailureCategory::TestIssue);
        assert_eq!(
            classify_error("Assertion failed: expected title to contain 'Home'").0,
            FailureCategory::AppBug
        );
        let (category, confidence, _) = classify_error("something odd");
        assert_eq!(category, FailureCategory::TestIssue);
        assert_eq!(confidence, 0.3);
    }

    #[tokio::test]
    async fn test_llm_verdict_used() {
        let reply = r#"```json
{"category": "APP_BUG", "rootCause": "500 on submit", "suggestedFix": {"forDeveloper": "fix handler", "forQA": "retest"}, "confidence": 0.92}
```"#;
        let analyzer = FailureAnalyzer::new().with_llm(Arc::new(Canned(reply.into())));
        let analysis = analyzer.analyze(&failed("boom"), None).await;
        assert_eq!(analysis.category, FailureCategory::AppBug);
        assert_eq!(analysis.root_cause, "500 on submit");
        assert_eq!(analysis.suggested_fix.for_qa, "retest");
        assert!(analysis.jira_ticket.is_none());
    }

    #[tokio::test]
    async fn test_unparsable_llm_falls_back() {
        let analyzer = FailureAnalyzer::new().with_llm(Arc::new(Canned("no idea".into())));
        let analysis = analyzer.analyze(&failed("Element not found"), None).await;
        assert_eq!(analysis.category, FailureCategory::TestIssue);
        assert_eq!(analysis.confidence, 0.6);
    }

    #[tokio::test]
    async fn test_ticket_only_for_confident_app_bugs() {
        let tracker = Arc::new(Recorder::default());
        let confident = r#"{"category": "APP_BUG", "rootCause": "x", "confidence": 0.85}"#;
        let analyzer = FailureAnalyzer::new()
            .with_llm(Arc::new(Canned(confident.into())))
            .with_tracker(tracker.clone(), true);
        let analysis = analyzer.analyze(&failed("boom"), None).await;
        assert_eq!(analysis.jira_ticket.as_deref(), Some("QA-1"));

        let unsure = r#"{"category": "APP_BUG", "rootCause": "x", "confidence": 0.79}"#;
        let analyzer = FailureAnalyzer::new()
            .with_llm(Arc::new(Canned(unsure.into())))
            .with_tracker(tracker.clone(), true);
        assert!(analyzer.analyze(&failed("boom"), None).await.jira_ticket.is_none());

        let disabled = FailureAnalyzer::new()
            .with_llm(Arc::new(Canned(confident.into())))
            .with_tracker(tracker.clone(), false);
        assert!(disabled.analyze(&failed("boom"), None).await.jira_ticket.is_none());
        assert_eq!(tracker.0.lock().len(), 1);
    }

    #[test]
    fn test_category_wire_names() {
        assert_eq!(serde_json::to_value(FailureCategory::TestIssue).unwrap(), "TEST_ISSUE");
        let fix = serde_json::to_value(SuggestedFix::default()).unwrap();
        assert!(fix.get("forQA").is_some());
    }
}
