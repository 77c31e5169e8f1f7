//! Phase-based orchestration of an autonomous run.
//!
//! ```text
//! discovery -> [authentication -> authenticated_discovery] -> generation
//!           -> execution -> analysis -> report -> completed
//! ```
//!
//! Any phase may end in `error`, but only fatal errors (browser launch, a
//! browser that died mid-run) get there; everything else is logged and the run
//! continues with what it has. The orchestrator owns the run's single browser
//! and closes it exactly once.

pub mod multi_panel;
pub mod report;

pub use multi_panel::{CompositeReport, Coverage, MultiPanelOrchestrator, PanelOutcome};
pub use report::{AuthSummary, ReportSummary, RunReport};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::analysis::{FailureAnalyzer, TicketTracker};
use crate::auth::{detect, determine_auth_strategy, AuthDetection, AuthStrategy, LoginFlow};
use crate::browser::{Browser, BrowserLauncher, LaunchOptions, SessionOptions};
use crate::config::RunConfig;
use crate::discovery::api::observe_page;
use crate::discovery::url::origin_of;
use crate::discovery::{ApiCrawler, ClassifiedPages, CrawlOptions, PostAuthCrawler, WebsiteCrawler};
use crate::error::{AutotestError, Result};
use crate::execution::{ExecutionResults, ExecutorOptions, TestExecutor};
use crate::generation::{GeneratedTest, TestGenerator};
use crate::healing::{LocatorRegistry, SelfHealingEngine};
use crate::llm::LlmProvider;
use crate::models::{ApplicationMap, AuthState, WebsiteMap};
use crate::progress::{Phase, ProgressReporter};
use crate::sink::{CoreEvent, ResultSink, SinkHandle};

/// Outcome of one autonomous run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub session_id: String,
    pub success: bool,
    pub application_map: ApplicationMap,
    pub tests_generated: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub tests_healed: usize,
    /// Wall-clock milliseconds
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub report: RunReport,
}

/// Optional collaborators injected into a run.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub tracker: Option<Arc<dyn TicketTracker>>,
    pub sink: Option<Arc<dyn ResultSink>>,
}

/// What one pipeline pass produced, beyond the public result.
pub(crate) struct PipelineOutput {
    pub result: RunResult,
    pub detection: Option<AuthDetection>,
}

pub struct AutonomousTestingOrchestrator {
    launcher: Arc<dyn BrowserLauncher>,
    progress: ProgressReporter,
    collaborators: Collaborators,
    login_flow: LoginFlow,
    crawl_idle_wait: Option<Duration>,
}

impl AutonomousTestingOrchestrator {
    pub fn new(launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            launcher,
            progress: ProgressReporter::new(),
            collaborators: Collaborators::default(),
            login_flow: LoginFlow::new(),
            crawl_idle_wait: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn with_login_flow(mut self, flow: LoginFlow) -> Self {
        self.login_flow = flow;
        self
    }

    /// Override the crawler's per-page network-idle wait.
    pub fn with_crawl_idle_wait(mut self, wait: Duration) -> Self {
        self.crawl_idle_wait = Some(wait);
        self
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub(crate) fn login_flow(&self) -> &LoginFlow {
        &self.login_flow
    }

    /// Run the full pipeline for `config`.
    pub async fn run(&self, session_id: &str, config: &RunConfig) -> Result<RunResult> {
        let start = Instant::now();
        if let Err(e) = config.validate() {
            self.report_error(&e);
            return Err(e);
        }
        let output_dir = config.output_dir_for(session_id);
        let browser = match self.launch(config.headless, &output_dir).await {
            Ok(browser) => browser,
            Err(e) => {
                self.report_error(&e);
                return Err(e);
            }
        };

        let outcome = self
            .pipeline(Arc::clone(&browser), session_id, config, &output_dir, start)
            .await;
        close_browser(browser.as_ref()).await;

        match outcome {
            Ok(output) => {
                self.progress.report_with(
                    Phase::Completed,
                    1.0,
                    format!(
                        "Run complete: {} passed, {} healed, {} failed",
                        output.result.tests_passed,
                        output.result.tests_healed,
                        output.result.tests_failed
                    ),
                    serde_json::json!({ "sessionId": session_id }),
                );
                Ok(output.result)
            }
            Err(e) => {
                self.report_error(&e);
                Err(e)
            }
        }
    }

    pub(crate) fn report_error(&self, error: &AutotestError) {
        tracing::error!("Run failed: {}", error);
        self.progress.report(Phase::Error, 1.0, error.to_string());
    }

    pub(crate) async fn launch(&self, headless: bool, output_dir: &Path) -> Result<Arc<dyn Browser>> {
        self.progress.report(Phase::Discovery, 0.0, "Launching browser");
        let options = LaunchOptions {
            headless,
            user_data_dir: output_dir.join("profile"),
        };
        self.launcher
            .launch(&options)
            .await
            .map_err(AutotestError::BrowserLaunch)
    }

    fn session_options(&self, config: &RunConfig) -> SessionOptions {
        SessionOptions {
            record_video_dir: None,
            timeouts: config.timeouts,
        }
    }

    fn crawl_options(&self, config: &RunConfig) -> CrawlOptions {
        let mut options = CrawlOptions::from(config.depth);
        if let Some(wait) = self.crawl_idle_wait {
            options.idle_wait = wait;
        }
        options
    }

    /// Every phase after launch, on a browser the caller owns.
    pub(crate) async fn pipeline(
        &self,
        browser: Arc<dyn Browser>,
        session_id: &str,
        config: &RunConfig,
        output_dir: &Path,
        start: Instant,
    ) -> Result<PipelineOutput> {
        let (sink, sink_task) = match &self.collaborators.sink {
            Some(sink) => {
                let (handle, task) = SinkHandle::spawn(Arc::clone(sink));
                (Some(handle), Some(task))
            }
            None => (None, None),
        };

        let mut map = self.discover(&browser, config).await?;

        let mut auth_summary = None;
        let mut auth_state = None;
        let mut detection = None;
        let mut focus = ClassifiedPages::default();
        if let (Some(website_url), Some(website)) = (&config.website_url, map.website.as_mut()) {
            let found = detect(&website.pages);
            let (summary, state) = self.authenticate(&browser, config, &found).await?;
            if let Some(state) = &state {
                if let Some((extra, categories)) =
                    self.authenticated_discovery(&browser, config, website_url, state).await?
                {
                    website.merge(extra);
                    focus = categories;
                }
            }
            auth_summary = Some(summary);
            auth_state = state;
            detection = Some(found);
        }

        let tests = self.generate(config, &map, focus).await;

        let results = self
            .execute(&browser, config, output_dir, &map, &tests, auth_state, sink.clone())
            .await?;

        let analyses = {
            self.progress
                .report(Phase::Analysis, 0.0, format!("Analyzing {} failures", results.failed.len()));
            let mut analyzer = FailureAnalyzer::new();
            if config.ai_analysis_enabled {
                if let Some(llm) = &self.collaborators.llm {
                    analyzer = analyzer.with_llm(Arc::clone(llm));
                }
            }
            if let Some(tracker) = &self.collaborators.tracker {
                analyzer = analyzer.with_tracker(Arc::clone(tracker), config.create_jira_tickets);
            }
            let analyses = analyzer.analyze_all(&results.failed, &tests).await;
            if let Some(sink) = &sink {
                for analysis in &analyses {
                    sink.emit(CoreEvent::Analysis(analysis.clone()));
                }
            }
            self.progress
                .report(Phase::Analysis, 1.0, format!("{} failures analyzed", analyses.len()));
            analyses
        };

        self.progress.report(Phase::Report, 0.0, "Writing report");
        let duration_ms = start.elapsed().as_millis() as u64;
        let name = config
            .website_url
            .clone()
            .or_else(|| config.api_url.clone())
            .unwrap_or_else(|| session_id.to_string());
        let mut report = RunReport::new(session_id, name, &map, &results, analyses, duration_ms);
        report.auth = auth_summary;
        if let Err(e) = report.write_to(output_dir).await {
            tracing::warn!("Could not write report to {}: {}", output_dir.display(), e);
        }
        self.progress.report(Phase::Report, 1.0, "Report written");

        drop(sink);
        if let Some(task) = sink_task {
            if let Err(e) = task.await {
                tracing::warn!("Result sink task ended abnormally: {}", e);
            }
        }

        let result = RunResult {
            session_id: session_id.to_string(),
            success: true,
            tests_generated: tests.len(),
            tests_passed: results.passed.len(),
            tests_failed: results.failed.len(),
            tests_healed: results.healed.len(),
            duration_ms,
            application_map: map,
            report,
        };
        Ok(PipelineOutput { result, detection })
    }

    /// Fail the run if the browser itself is gone.
    fn ensure_alive(&self, browser: &Arc<dyn Browser>, phase: &str) -> Result<()> {
        if browser.is_closed() {
            return Err(AutotestError::Fatal(format!("browser closed during {}", phase)));
        }
        Ok(())
    }

    async fn discover(&self, browser: &Arc<dyn Browser>, config: &RunConfig) -> Result<ApplicationMap> {
        let progress = self.progress.phase(Phase::Discovery);
        let mut map = ApplicationMap::default();

        if let Some(url) = &config.website_url {
            progress.report(0.1, format!("Crawling {}", url));
            let crawler = WebsiteCrawler::new(
                Arc::clone(browser),
                self.session_options(config),
                self.crawl_options(config),
            );
            let website = match crawler.crawl(url).await {
                Ok(website) => website,
                Err(e) => {
                    self.ensure_alive(browser, "discovery")?;
                    tracing::warn!("Website discovery failed: {}", e);
                    WebsiteMap::default()
                }
            };
            progress.report(0.6, format!("Discovered {} pages", website.pages.len()));
            map.website = Some(website);
        }

        if let Some(api_url) = &config.api_url {
            progress.report(0.7, format!("Discovering API at {}", api_url));
            let observed = match &config.website_url {
                Some(url) => match browser.new_session(self.session_options(config)).await {
                    Ok(session) => {
                        let observed = observe_page(session.as_ref(), url, config.timeouts.network_idle())
                            .await
                            .unwrap_or_else(|e| {
                                tracing::debug!("Request observation failed: {}", e);
                                Vec::new()
                            });
                        let _ = session.close().await;
                        observed
                    }
                    Err(e) => {
                        tracing::debug!("No session for request observation: {}", e);
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };
            let api = ApiCrawler::new(config.timeouts.navigation())
                .discover(api_url, &observed)
                .await;
            map.api = Some(api);
        }

        progress.report_details(
            1.0,
            "Discovery complete",
            serde_json::json!({
                "pages": map.website.as_ref().map_or(0, |w| w.pages.len()),
                "endpoints": map.api.as_ref().map_or(0, |a| a.endpoints.len()),
            }),
        );
        Ok(map)
    }

    async fn authenticate(
        &self,
        browser: &Arc<dyn Browser>,
        config: &RunConfig,
        detection: &AuthDetection,
    ) -> Result<(AuthSummary, Option<AuthState>)> {
        let progress = self.progress.phase(Phase::Authentication);
        let decision = determine_auth_strategy(
            detection.login.is_some(),
            detection.registration.is_some(),
            config.authentication.is_some(),
        );
        tracing::info!("Authentication strategy: {:?} ({})", decision.strategy, decision.reason);
        progress.report_details(
            0.0,
            format!("Authentication strategy: {:?}", decision.strategy),
            serde_json::json!({ "strategy": decision.strategy, "reason": decision.reason }),
        );

        if decision.strategy == AuthStrategy::None {
            return Ok((
                AuthSummary {
                    decision,
                    authenticated: false,
                    error: None,
                },
                None,
            ));
        }

        let session = match browser.new_session(self.session_options(config)).await {
            Ok(session) => session,
            Err(e) => {
                self.ensure_alive(browser, "authentication")?;
                return Ok((
                    AuthSummary {
                        decision,
                        authenticated: false,
                        error: Some(format!("could not open session: {}", e)),
                    },
                    None,
                ));
            }
        };
        let outcome = self
            .login_flow
            .authenticate(
                session.as_ref(),
                detection,
                &decision,
                config.authentication.as_ref(),
            )
            .await;
        let _ = session.close().await;

        let (state, error) = match outcome {
            Ok(state) => (state, None),
            Err(e) => {
                self.ensure_alive(browser, "authentication")?;
                tracing::warn!("Continuing without authentication: {}", e);
                (None, Some(e.to_string()))
            }
        };
        progress.report(
            1.0,
            if state.is_some() {
                "Authenticated"
            } else {
                "Authentication failed, continuing unauthenticated"
            },
        );
        Ok((
            AuthSummary {
                decision,
                authenticated: state.is_some(),
                error,
            },
            state,
        ))
    }

    async fn authenticated_discovery(
        &self,
        browser: &Arc<dyn Browser>,
        config: &RunConfig,
        website_url: &str,
        state: &AuthState,
    ) -> Result<Option<(WebsiteMap, ClassifiedPages)>> {
        let progress = self.progress.phase(Phase::AuthenticatedDiscovery);
        progress.report(0.0, "Crawling as an authenticated user");
        let crawler = PostAuthCrawler::new(
            Arc::clone(browser),
            self.session_options(config),
            self.crawl_options(config),
        );
        match crawler.crawl(website_url, state).await {
            Ok(found) => {
                progress.report(1.0, format!("Found {} authenticated pages", found.map.pages.len()));
                Ok(Some((found.map, found.categories)))
            }
            Err(e) => {
                self.ensure_alive(browser, "authenticated discovery")?;
                tracing::warn!("Authenticated discovery failed: {}", e);
                progress.report(1.0, "Authenticated discovery failed");
                Ok(None)
            }
        }
    }

    async fn generate(
        &self,
        config: &RunConfig,
        map: &ApplicationMap,
        focus: ClassifiedPages,
    ) -> Vec<GeneratedTest> {
        let progress = self.progress.phase(Phase::Generation);
        progress.report(0.0, "Generating tests");
        let mut generator = TestGenerator::new(config.generation).with_focus(focus);
        if config.ai_analysis_enabled {
            if let Some(llm) = &self.collaborators.llm {
                generator = generator.with_llm(Arc::clone(llm));
            }
        }
        let tests = generator.generate(map).await;
        progress.report(1.0, format!("Generated {} tests", tests.len()));
        tests
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        browser: &Arc<dyn Browser>,
        config: &RunConfig,
        output_dir: &Path,
        map: &ApplicationMap,
        tests: &[GeneratedTest],
        auth: Option<AuthState>,
        sink: Option<SinkHandle>,
    ) -> Result<ExecutionResults> {
        let progress = self.progress.phase(Phase::Execution);
        progress.report(0.0, format!("Executing {} tests", tests.len()));

        let registry = Arc::new(LocatorRegistry::new());
        if let Some(website) = &map.website {
            registry.register_map(website);
        }
        let engine = Arc::new(SelfHealingEngine::with_defaults(config.healing, registry));

        let mut executor = TestExecutor::new(
            Arc::clone(browser),
            ExecutorOptions::from_config(config, output_dir),
        )
        .with_healing(engine)
        .with_progress(progress.clone());
        if let (Some(state), Some(origin)) = (auth, config.website_url.as_deref().and_then(origin_of)) {
            executor = executor.with_auth(origin, state);
        }
        if let Some(sink) = sink {
            executor = executor.with_sink(sink);
        }

        let results = executor.execute(tests).await;
        if !tests.is_empty() && results.failed.len() == tests.len() {
            self.ensure_alive(browser, "execution")?;
        }
        Ok(results)
    }
}

async fn close_browser(browser: &dyn Browser) {
    if let Err(e) = browser.close().await {
        tracing::warn!("Closing browser failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::{MockLauncher, MockPage, MockSite};

    fn config(dir: &Path) -> RunConfig {
        RunConfig {
            output_dir: Some(dir.to_path_buf()),
            ..RunConfig::for_website("https://app.test/")
        }
    }

    #[tokio::test]
    async fn test_launch_failure_emits_error_phase() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(MockLauncher::failing(MockSite::new("https://app.test")));
        let orchestrator = AutonomousTestingOrchestrator::new(launcher);
        let mut rx = orchestrator.progress().subscribe();

        let err = orchestrator.run("s1", &config(dir.path())).await.unwrap_err();
        assert!(matches!(err, AutotestError::BrowserLaunch(_)));

        let mut last = None;
        while let Ok(update) = rx.try_recv() {
            last = Some(update);
        }
        assert_eq!(last.unwrap().phase, Phase::Error);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_launch() {
        let launcher = Arc::new(MockLauncher::new(MockSite::new("https://app.test")));
        let orchestrator = AutonomousTestingOrchestrator::new(launcher.clone());
        let err = orchestrator.run("s1", &RunConfig::default()).await.unwrap_err();
        assert!(matches!(err, AutotestError::Config(_)));
        assert!(launcher.browsers().is_empty());
    }

    #[tokio::test]
    async fn test_browser_closed_once() {
        let dir = tempfile::tempdir().unwrap();
        let site = MockSite::new("https://app.test").page(MockPage::new("/", "Home"));
        let launcher = Arc::new(MockLauncher::new(site));
        let orchestrator = AutonomousTestingOrchestrator::new(launcher.clone())
            .with_crawl_idle_wait(Duration::ZERO);

        let result = orchestrator.run("s1", &config(dir.path())).await.unwrap();
        assert!(result.success);
        assert_eq!(launcher.browsers().len(), 1);
        assert_eq!(launcher.browsers()[0].close_calls(), 1);
        assert!(dir.path().join("s1").join("report.json").exists());

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("duration").is_some());
        assert!(json.get("applicationMap").is_some());
    }
}
