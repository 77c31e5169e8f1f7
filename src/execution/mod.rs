//! Parallel test execution over isolated sessions.
//!
//! Tests are chunked into `ceil(T/W)` batches of at most `W` tests. Each batch
//! runs sequentially in its own session; up to `W` batches are in flight at
//! once as futures on the calling task. Batches accumulate results locally and
//! are merged after all of them finish.

pub mod steps;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::browser::{open_session, Browser, PageSession, SessionOptions};
use crate::config::{RunConfig, Timeouts};
use crate::generation::GeneratedTest;
use crate::healing::{HealingEvent, SelfHealingEngine};
use crate::models::AuthState;
use crate::progress::PhaseProgress;
use crate::sink::{CoreEvent, SinkHandle};

pub use steps::{http_client, StepRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Healed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_id: String,
    pub name: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Index of the step that raised
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub healing: Vec<HealingEvent>,
}

impl TestResult {
    fn failed(test: &GeneratedTest, error: String, duration_ms: u64) -> Self {
        Self {
            test_id: test.id.clone(),
            name: test.name.clone(),
            status: TestStatus::Failed,
            duration_ms,
            error: Some(error),
            failed_step: None,
            screenshots: Vec::new(),
            video: None,
            healing: Vec::new(),
        }
    }
}

/// Results of one execution, partitioned by status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResults {
    pub total: usize,
    pub passed: Vec<TestResult>,
    pub failed: Vec<TestResult>,
    pub healed: Vec<TestResult>,
    pub total_duration_ms: u64,
    /// Batches the tests were split into
    pub batches: usize,
}

impl ExecutionResults {
    fn push(&mut self, result: TestResult) {
        match result.status {
            TestStatus::Passed => self.passed.push(result),
            TestStatus::Failed => self.failed.push(result),
            TestStatus::Healed => self.healed.push(result),
        }
    }

    /// Every result, in no particular order.
    pub fn all(&self) -> impl Iterator<Item = &TestResult> {
        self.passed.iter().chain(&self.healed).chain(&self.failed)
    }

    /// `passed + failed + healed == total`.
    pub fn is_complete(&self) -> bool {
        self.passed.len() + self.failed.len() + self.healed.len() == self.total
    }

    pub fn healing_events(&self) -> impl Iterator<Item = &HealingEvent> {
        self.all().flat_map(|r| r.healing.iter())
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.passed.len() + self.healed.len()) as f64 / self.total as f64
        }
    }
}

/// Split tests into `ceil(T/W)` batches of at most `W`.
pub fn plan_batches(tests: &[GeneratedTest], workers: usize) -> Vec<Vec<GeneratedTest>> {
    tests
        .chunks(workers.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub workers: usize,
    pub enable_healing: bool,
    pub capture_screenshots: bool,
    pub capture_video: bool,
    /// Receives `screenshots/` and `video/`
    pub output_dir: PathBuf,
    pub timeouts: Timeouts,
}

impl ExecutorOptions {
    pub fn from_config(config: &RunConfig, output_dir: &Path) -> Self {
        Self {
            workers: config.parallel_workers,
            enable_healing: config.enable_healing,
            capture_screenshots: config.capture_screenshots,
            capture_video: config.capture_video,
            output_dir: output_dir.to_path_buf(),
            timeouts: config.timeouts,
        }
    }
}

/// Runs generated tests.
pub struct TestExecutor {
    browser: Arc<dyn Browser>,
    options: ExecutorOptions,
    engine: Option<Arc<SelfHealingEngine>>,
    auth: Option<(String, AuthState)>,
    sink: Option<SinkHandle>,
    progress: Option<PhaseProgress>,
    http: Arc<reqwest::Client>,
}

impl TestExecutor {
    pub fn new(browser: Arc<dyn Browser>, options: ExecutorOptions) -> Self {
        Self {
            browser,
            options,
            engine: None,
            auth: None,
            sink: None,
            progress: None,
            http: http_client(),
        }
    }

    /// Heal with `engine` when healing is enabled.
    pub fn with_healing(mut self, engine: Arc<SelfHealingEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Restore `state` into every batch session.
    pub fn with_auth(mut self, origin: impl Into<String>, state: AuthState) -> Self {
        self.auth = Some((origin.into(), state));
        self
    }

    pub fn with_sink(mut self, sink: SinkHandle) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_progress(mut self, progress: PhaseProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub async fn execute(&self, tests: &[GeneratedTest]) -> ExecutionResults {
        let start = Instant::now();
        let workers = self.options.workers.max(1);
        let batches = plan_batches(tests, workers);
        let batch_count = batches.len();
        tracing::info!(
            "Executing {} tests in {} batches ({} workers)",
            tests.len(),
            batch_count,
            workers
        );

        let mut done = 0usize;
        let mut per_batch: Vec<Vec<TestResult>> = Vec::with_capacity(batch_count);
        let mut running = stream::iter(batches.into_iter().enumerate())
            .map(|(index, batch)| self.run_batch(index, batch))
            .buffer_unordered(workers);
        while let Some(results) = running.next().await {
            done += 1;
            if let Some(progress) = &self.progress {
                progress.report(
                    done as f64 / batch_count as f64,
                    format!("Batch {}/{} finished", done, batch_count),
                );
            }
            per_batch.push(results);
        }

        let mut merged = ExecutionResults {
            total: tests.len(),
            batches: batch_count,
            ..ExecutionResults::default()
        };
        for result in per_batch.into_iter().flatten() {
            merged.push(result);
        }
        merged.total_duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "Execution finished: {} passed, {} healed, {} failed",
            merged.passed.len(),
            merged.healed.len(),
            merged.failed.len()
        );
        merged
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            record_video_dir: self
                .options
                .capture_video
                .then(|| self.options.output_dir.join("video")),
            timeouts: self.options.timeouts,
        }
    }

    async fn open(&self) -> anyhow::Result<Arc<dyn PageSession>> {
        let auth = self.auth.as_ref().map(|(o, s)| (o.as_str(), s));
        match open_session(self.browser.as_ref(), self.session_options(), auth).await {
            Ok(session) => Ok(session),
            Err(e) if auth.is_some() => {
                tracing::warn!("Could not restore auth into batch session: {}", e);
                self.browser.new_session(self.session_options()).await
            }
            Err(e) => Err(e),
        }
    }

    async fn run_batch(&self, index: usize, batch: Vec<GeneratedTest>) -> Vec<TestResult> {
        let session = match self.open().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Batch {} could not open a session: {}", index, e);
                let results: Vec<TestResult> = batch
                    .iter()
                    .map(|t| TestResult::failed(t, format!("could not open session: {}", e), 0))
                    .collect();
                self.emit_all(&results);
                return results;
            }
        };
        tracing::debug!("Batch {} running {} tests in {}", index, batch.len(), session.id());

        let mut results = Vec::with_capacity(batch.len());
        for test in &batch {
            let result = self.run_test(session.as_ref(), test).await;
            self.emit_all(std::slice::from_ref(&result));
            results.push(result);
        }
        if let Err(e) = session.close().await {
            tracing::debug!("Closing batch {} session failed: {}", index, e);
        }
        results
    }

    fn emit_all(&self, results: &[TestResult]) {
        let Some(sink) = &self.sink else {
            return;
        };
        for result in results {
            for event in &result.healing {
                sink.emit(CoreEvent::Healing(event.clone()));
            }
            sink.emit(CoreEvent::TestCompleted(result.clone()));
        }
    }

    async fn run_test(&self, session: &dyn PageSession, test: &GeneratedTest) -> TestResult {
        let start = Instant::now();
        let engine = if self.options.enable_healing {
            self.engine.as_deref()
        } else {
            None
        };
        let mut runner = StepRunner::new(session, engine, &self.http, self.options.timeouts, &test.id);

        let mut failure = None;
        for (index, step) in test.steps.iter().enumerate() {
            if let Err(e) = runner.run(index, step).await {
                failure = Some((index, e));
                break;
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let healed = runner.healed();
        let healing = std::mem::take(&mut runner.healing);
        match failure {
            None => {
                let status = if healed {
                    TestStatus::Healed
                } else {
                    TestStatus::Passed
                };
                tracing::debug!("{:?}: {}", status, test.name);
                TestResult {
                    test_id: test.id.clone(),
                    name: test.name.clone(),
                    status,
                    duration_ms,
                    error: None,
                    failed_step: None,
                    screenshots: Vec::new(),
                    video: None,
                    healing,
                }
            }
            Some((index, error)) => {
                tracing::info!("FAILED {} at step {}: {:#}", test.name, index, error);
                let mut screenshots = Vec::new();
                if self.options.capture_screenshots {
                    let path = self
                        .options
                        .output_dir
                        .join("screenshots")
                        .join(format!("{}-step{}.png", test.id, index));
                    match session.screenshot(&path).await {
                        Ok(()) => screenshots.push(path),
                        Err(e) => tracing::debug!("Screenshot failed: {}", e),
                    }
                }
                TestResult {
                    test_id: test.id.clone(),
                    name: test.name.clone(),
                    status: TestStatus::Failed,
                    duration_ms,
                    error: Some(format!("{:#}", error)),
                    failed_step: Some(index),
                    screenshots,
                    video: session.video_path(),
                    healing,
                }
            }
        }
    }
}
