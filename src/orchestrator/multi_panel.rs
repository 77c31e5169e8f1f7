//! Multi-panel runs: the same pipeline once per panel (public, user, admin) on
//! one shared browser, followed by an RBAC cross-check of admin-only pages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use super::{AutonomousTestingOrchestrator, PipelineOutput, RunResult};
use crate::auth::AuthDetection;
use crate::browser::{Browser, SessionOptions};
use crate::config::{MultiPanelConfig, PanelRole};
use crate::discovery::url::{path_of, resolve};
use crate::error::Result;
use crate::progress::Phase;
use crate::rbac::{RbacReport, RbacTester, RoleAccount};

/// One panel's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelOutcome {
    pub role: PanelRole,
    pub result: RunResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coverage {
    /// Distinct page paths across all panels
    pub total_pages: usize,
    pub pages_per_panel: Vec<(PanelRole, usize)>,
    pub admin_only_pages: Vec<String>,
    pub tests_total: usize,
    pub tests_passed: usize,
    pub tests_healed: usize,
    pub tests_failed: usize,
    pub pass_rate: f64,
}

/// Aggregate of every panel plus the RBAC cross-check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeReport {
    pub session_id: String,
    pub panels: Vec<PanelOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbac: Option<RbacReport>,
    pub coverage: Coverage,
    pub duration_ms: u64,
}

impl CompositeReport {
    pub fn to_console(&self) -> String {
        let mut out = format!("=== Multi-panel run {} ===\n\n", self.session_id);
        for panel in &self.panels {
            let r = &panel.result;
            out.push_str(&format!(
                "[{}] {} pages, {} tests: {} passed, {} healed, {} failed\n",
                panel.role.as_str(),
                r.report.summary.pages_discovered,
                r.tests_generated,
                r.tests_passed,
                r.tests_healed,
                r.tests_failed
            ));
        }
        let c = &self.coverage;
        out.push_str(&format!(
            "\nCoverage: {} distinct pages, {} admin-only\n",
            c.total_pages,
            c.admin_only_pages.len()
        ));
        if let Some(rbac) = &self.rbac {
            out.push_str(&format!(
                "RBAC: {} probes passed, {} failed\n",
                rbac.passed(),
                rbac.failed()
            ));
            for finding in rbac.critical() {
                out.push_str(&format!(
                    "    [CRITICAL] {} as '{}': {}\n",
                    finding.url, finding.role, finding.message
                ));
            }
        }
        out.push_str(&format!(
            "\n=== Results: {} of {} tests passing ({:.0}%) ===\n",
            c.tests_passed + c.tests_healed,
            c.tests_total,
            c.pass_rate * 100.0
        ));
        out
    }
}

pub struct MultiPanelOrchestrator {
    inner: AutonomousTestingOrchestrator,
}

impl MultiPanelOrchestrator {
    pub fn new(inner: AutonomousTestingOrchestrator) -> Self {
        Self { inner }
    }

    pub fn progress(&self) -> &crate::progress::ProgressReporter {
        self.inner.progress()
    }

    pub async fn run(&self, session_id: &str, config: &MultiPanelConfig) -> Result<CompositeReport> {
        let start = Instant::now();
        if let Err(e) = config.validate() {
            self.inner.report_error(&e);
            return Err(e);
        }
        let output_dir = config.base.output_dir_for(session_id);
        let browser = match self.inner.launch(config.base.headless, &output_dir).await {
            Ok(browser) => browser,
            Err(e) => {
                self.inner.report_error(&e);
                return Err(e);
            }
        };

        let outcome = self.run_panels(&browser, session_id, config, start).await;
        if let Err(e) = browser.close().await {
            tracing::warn!("Closing browser failed: {}", e);
        }

        match outcome {
            Ok(report) => {
                let path = output_dir.join("composite.json");
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => {
                        if let Err(e) = tokio::fs::write(&path, json).await {
                            tracing::warn!("Could not write {}: {}", path.display(), e);
                        }
                    }
                    Err(e) => tracing::warn!("Could not serialize composite report: {}", e),
                }
                self.inner.progress().report(
                    Phase::Completed,
                    1.0,
                    format!("Multi-panel run complete: {} panels", report.panels.len()),
                );
                Ok(report)
            }
            Err(e) => {
                self.inner.report_error(&e);
                Err(e)
            }
        }
    }

    async fn run_panels(
        &self,
        browser: &Arc<dyn Browser>,
        session_id: &str,
        config: &MultiPanelConfig,
        start: Instant,
    ) -> Result<CompositeReport> {
        let output_dir = config.base.output_dir_for(session_id);
        let mut panels = Vec::with_capacity(config.panels.len());
        let mut detections: Vec<(PanelRole, Option<AuthDetection>)> = Vec::new();

        for panel in &config.panels {
            let role = panel.role;
            tracing::info!("Running panel '{}'", role.as_str());
            let panel_config = config.panel_config(panel);
            let PipelineOutput { result, detection } = self
                .inner
                .pipeline(
                    Arc::clone(browser),
                    &format!("{}-{}", session_id, role.as_str()),
                    &panel_config,
                    &output_dir.join(role.as_str()),
                    Instant::now(),
                )
                .await?;
            detections.push((role, detection));
            panels.push(PanelOutcome { role, result });
        }

        let admin_only = admin_only_pages(&panels);
        let rbac = self
            .cross_check(browser, config, &detections, &admin_only)
            .await?;

        let coverage = coverage(&panels, admin_only);
        Ok(CompositeReport {
            session_id: session_id.to_string(),
            panels,
            rbac,
            coverage,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn cross_check(
        &self,
        browser: &Arc<dyn Browser>,
        config: &MultiPanelConfig,
        detections: &[(PanelRole, Option<AuthDetection>)],
        admin_only: &[String],
    ) -> Result<Option<RbacReport>> {
        let Some(admin_panel) = config.panels.iter().find(|p| p.role == PanelRole::Admin) else {
            tracing::info!("No admin panel configured, skipping RBAC cross-check");
            return Ok(None);
        };
        let Some(admin_credentials) = admin_panel.credentials.clone() else {
            return Ok(None);
        };
        let progress = self.inner.progress().phase(Phase::Rbac);
        progress.report(0.0, format!("Cross-checking {} admin-only pages", admin_only.len()));

        let Some(admin_url) = config.panel_config(admin_panel).website_url else {
            return Ok(None);
        };
        let urls: Vec<String> = admin_only
            .iter()
            .filter_map(|path| resolve(&admin_url, path))
            .collect();

        let login = detections
            .iter()
            .filter_map(|(_, d)| d.as_ref().and_then(|d| d.login.clone()))
            .next();
        let tester = RbacTester::new(
            Arc::clone(browser),
            SessionOptions {
                record_video_dir: None,
                timeouts: config.base.timeouts,
            },
        )
        .with_login_flow(self.inner.login_flow().clone());

        let elevated = RoleAccount::new(PanelRole::Admin.as_str(), admin_credentials);
        let restricted: Vec<RoleAccount> = config
            .panels
            .iter()
            .filter(|p| p.role != PanelRole::Admin)
            .map(|panel| match &panel.credentials {
                Some(credentials) => RoleAccount::new(panel.role.as_str(), credentials.clone()),
                None => RoleAccount::anonymous(panel.role.as_str()),
            })
            .collect();
        let report = tester
            .run(login.as_ref(), &elevated, &restricted, &urls)
            .await?;
        progress.report(
            1.0,
            format!(
                "RBAC: {} probes, {} critical findings",
                report.probes.len(),
                report.critical().count()
            ),
        );
        Ok(Some(report))
    }
}

/// Paths the panel actually reached (error pages excluded).
fn panel_paths(panel: &PanelOutcome) -> BTreeSet<String> {
    panel
        .result
        .application_map
        .website
        .as_ref()
        .map(|w| {
            w.pages
                .iter()
                .filter(|p| p.status.map_or(true, |s| s < 400))
                .map(|p| path_of(&p.url))
                .collect()
        })
        .unwrap_or_default()
}

/// Admin pages reachable by neither the user nor the public panel.
pub fn admin_only_pages(panels: &[PanelOutcome]) -> Vec<String> {
    let Some(admin) = panels.iter().find(|p| p.role == PanelRole::Admin) else {
        return Vec::new();
    };
    let others: BTreeSet<String> = panels
        .iter()
        .filter(|p| p.role != PanelRole::Admin)
        .flat_map(panel_paths)
        .collect();
    panel_paths(admin)
        .into_iter()
        .filter(|path| !others.contains(path))
        .collect()
}

fn coverage(panels: &[PanelOutcome], admin_only_pages: Vec<String>) -> Coverage {
    let all: BTreeSet<String> = panels.iter().flat_map(panel_paths).collect();
    let sum = |f: fn(&RunResult) -> usize| panels.iter().map(|p| f(&p.result)).sum::<usize>();
    let tests_total = sum(|r| r.tests_generated);
    let tests_passed = sum(|r| r.tests_passed);
    let tests_healed = sum(|r| r.tests_healed);
    Coverage {
        total_pages: all.len(),
        pages_per_panel: panels
            .iter()
            .map(|p| (p.role, panel_paths(p).len()))
            .collect(),
        admin_only_pages,
        tests_total,
        tests_passed,
        tests_healed,
        tests_failed: sum(|r| r.tests_failed),
        pass_rate: if tests_total == 0 {
            0.0
        } else {
            (tests_passed + tests_healed) as f64 / tests_total as f64
        },
    }
}
