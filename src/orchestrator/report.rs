//! Run reports and their renderers: pretty JSON, JUnit XML, console text.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::analysis::AnalysisResult;
use crate::auth::AuthDecision;
use crate::execution::{ExecutionResults, TestResult, TestStatus};
use crate::healing::HealingEvent;
use crate::models::ApplicationMap;
use crate::rbac::RbacReport;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub healed: usize,
    /// (passed + healed) / total
    pub pass_rate: f64,
    pub duration_ms: u64,
    pub pages_discovered: usize,
    pub endpoints_discovered: usize,
}

impl ReportSummary {
    pub fn new(map: &ApplicationMap, results: &ExecutionResults, duration_ms: u64) -> Self {
        Self {
            total: results.total,
            passed: results.passed.len(),
            failed: results.failed.len(),
            healed: results.healed.len(),
            pass_rate: results.pass_rate(),
            duration_ms,
            pages_discovered: map.website.as_ref().map_or(0, |w| w.pages.len()),
            endpoints_discovered: map.api.as_ref().map_or(0, |a| a.endpoints.len()),
        }
    }
}

/// How the run authenticated, if at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSummary {
    pub decision: AuthDecision,
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub session_id: String,
    pub name: String,
    pub generated_at: String,
    pub summary: ReportSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSummary>,
    pub results: Vec<TestResult>,
    pub analyses: Vec<AnalysisResult>,
    pub healing: Vec<HealingEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbac: Option<RbacReport>,
}

impl RunReport {
    pub fn new(
        session_id: &str,
        name: impl Into<String>,
        map: &ApplicationMap,
        results: &ExecutionResults,
        analyses: Vec<AnalysisResult>,
        duration_ms: u64,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            name: name.into(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            summary: ReportSummary::new(map, results, duration_ms),
            auth: None,
            results: results.all().cloned().collect(),
            analyses,
            healing: results.healing_events().cloned().collect(),
            rbac: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// JUnit XML for CI. Healed tests count as passing.
    pub fn to_junit(&self) -> String {
        let mut cases = String::new();
        for result in &self.results {
            let time = result.duration_ms as f64 / 1000.0;
            let name = escape_xml(&result.name);
            match result.status {
                TestStatus::Passed => cases.push_str(&format!(
                    "  <testcase name=\"{}\" classname=\"autotest\" time=\"{:.3}\" />\n",
                    name, time
                )),
                TestStatus::Healed => {
                    let healed: Vec<String> = result
                        .healing
                        .iter()
                        .filter_map(|e| {
                            e.result
                                .as_ref()
                                .map(|r| format!("{} -> {}", e.failed_locator, r.new_locator))
                        })
                        .collect();
                    cases.push_str(&format!(
                        "  <testcase name=\"{}\" classname=\"autotest\" time=\"{:.3}\">\n    <system-out>healed: {}</system-out>\n  </testcase>\n",
                        name,
                        time,
                        escape_xml(&healed.join(", "))
                    ));
                }
                TestStatus::Failed => {
                    let error = result.error.as_deref().unwrap_or("test failed");
                    let message = match result.failed_step {
                        Some(step) => format!("step {} failed", step),
                        None => "execution error".to_string(),
                    };
                    cases.push_str(&format!(
                        "  <testcase name=\"{}\" classname=\"autotest\" time=\"{:.3}\">\n    <failure message=\"{}\" type=\"StepFailure\">{}</failure>\n  </testcase>\n",
                        name,
                        time,
                        escape_xml(&message),
                        escape_xml(error)
                    ));
                }
            }
        }
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<testsuite name=\"{name}\" tests=\"{tests}\" failures=\"{failures}\" time=\"{time:.3}\">\n{cases}</testsuite>\n",
            name = escape_xml(&self.name),
            tests = self.summary.total,
            failures = self.summary.failed,
            time = self.summary.duration_ms as f64 / 1000.0,
            cases = cases,
        )
    }

    /// Human summary for the terminal.
    pub fn to_console(&self) -> String {
        let mut out = format!("=== {} ({}) ===\n\n", self.name, self.session_id);

        if let Some(auth) = &self.auth {
            out.push_str(&format!(
                "Authentication: {:?}, {} ({})\n\n",
                auth.decision.strategy,
                if auth.authenticated { "signed in" } else { "not signed in" },
                auth.decision.reason
            ));
        }

        for result in &self.results {
            let marker = match result.status {
                TestStatus::Passed => "\u{2713} PASS ",
                TestStatus::Healed => "\u{2713} HEAL ",
                TestStatus::Failed => "\u{2717} FAIL ",
            };
            out.push_str(&format!("{} {} ({} ms)\n", marker, result.name, result.duration_ms));
            if let Some(error) = &result.error {
                out.push_str(&format!("    [ERROR] {}\n", error));
            }
            for event in &result.healing {
                if let Some(healed) = &event.result {
                    out.push_str(&format!(
                        "    [HEAL] {} -> {} ({}, {:.2}, {:?})\n",
                        event.failed_locator,
                        healed.new_locator,
                        healed.strategy,
                        healed.confidence,
                        event.decision
                    ));
                }
            }
            if let Some(analysis) = self.analyses.iter().find(|a| a.test_id == result.test_id) {
                out.push_str(&format!(
                    "    [{:?}] {}\n",
                    analysis.category, analysis.root_cause
                ));
            }
        }

        if let Some(rbac) = &self.rbac {
            out.push_str(&format!(
                "\nRBAC: {} probes passed, {} failed\n",
                rbac.passed(),
                rbac.failed()
            ));
            for finding in rbac.critical() {
                out.push_str(&format!("    [CRITICAL] {}: {}\n", finding.url, finding.message));
            }
        }

        let s = &self.summary;
        out.push_str(&format!(
            "\n=== Results: {} passed, {} healed, {} failed ({} total, {:.0}% pass rate) in {:.1}s ===\n",
            s.passed,
            s.healed,
            s.failed,
            s.total,
            s.pass_rate * 100.0,
            s.duration_ms as f64 / 1000.0
        ));
        out
    }

    /// Write `report.json` and `junit.xml` into `dir`.
    pub async fn write_to(&self, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir).await?;
        let json_path = dir.join("report.json");
        tokio::fs::write(&json_path, self.to_json()?).await?;
        let junit_path = dir.join("junit.xml");
        tokio::fs::write(&junit_path, self.to_junit()).await?;
        tracing::info!("Report written to {}", dir.display());
        Ok(vec![json_path, junit_path])
    }
}

pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{FailureCategory, SuggestedFix};
    use crate::healing::{HealingDecision, HealingResult};

    fn result(id: &str, status: TestStatus) -> TestResult {
        TestResult {
            test_id: id.into(),
            name: format!("Test <{}>", id),
            status,
            duration_ms: 1500,
            error: (status == TestStatus::Failed).then(|| "Element not found: #a & #b".to_string()),
            failed_step: (status == TestStatus::Failed).then_some(2),
            screenshots: vec![],
            video: None,
            healing: vec![],
        }
    }

    fn report() -> RunReport {
        let mut healed = result("h", TestStatus::Healed);
        healed.healing.push(HealingEvent {
            test_id: "h".into(),
            step_index: 1,
            failed_locator: "#submit-btn".into(),
            result: Some(HealingResult::new("fallback", "[name=\"submit-btn\"]", 0.75)),
            decision: HealingDecision::AutoApply,
            duration_ms: 3,
        });
        let results = ExecutionResults {
            total: 3,
            passed: vec![result("p", TestStatus::Passed)],
            failed: vec![result("f", TestStatus::Failed)],
            healed: vec![healed],
            total_duration_ms: 4500,
            batches: 1,
        };
        let analyses = vec![AnalysisResult {
            test_id: "f".into(),
            category: FailureCategory::TestIssue,
            root_cause: "Locator no longer matches".into(),
            suggested_fix: SuggestedFix {
                for_developer: "Add a test id".into(),
                for_qa: "Update the locator".into(),
            },
            confidence: 0.6,
            jira_ticket: None,
        }];
        RunReport::new("s1", "Suite", &ApplicationMap::default(), &results, analyses, 4500)
    }

    #[test]
    fn test_summary_counts() {
        let report = report();
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.healed, 1);
        assert!((report.summary.pass_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.healing.len(), 1);
        assert_eq!(report.results.len(), 3);
    }

    #[test]
    fn test_junit_escapes_and_counts() {
        let xml = report().to_junit();
        assert!(xml.contains("tests=\"3\" failures=\"1\""));
        assert!(xml.contains("Test &lt;f&gt;"));
        assert!(xml.contains("#a &amp; #b"));
        assert!(xml.contains("step 2 failed"));
        assert!(xml.contains("<system-out>healed: #submit-btn -&gt; [name=&quot;submit-btn&quot;]</system-out>"));
    }

    #[test]
    fn test_console_lists_everything() {
        let text = report().to_console();
        assert!(text.contains("\u{2717} FAIL  Test <f>"));
        assert!(text.contains("[HEAL] #submit-btn -> [name=\"submit-btn\"]"));
        assert!(text.contains("[TestIssue] Locator no longer matches"));
        assert!(text.contains("1 passed, 1 healed, 1 failed (3 total, 67% pass rate) in 4.5s"));
    }

    #[tokio::test]
    async fn test_write_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = report().write_to(dir.path()).await.unwrap();
        assert_eq!(paths.len(), 2);
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths[0]).unwrap()).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["summary"]["failed"], 1);
    }
}
