//! Run configuration.
//!
//! A run is configured from an optional JSON file (camelCase keys, every
//! optional field defaulted) and then overridden by command-line flags.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AutotestError, Result};

/// How far the website crawler is allowed to go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CrawlDepth {
    #[default]
    Shallow,
    Deep,
    Exhaustive,
}

impl CrawlDepth {
    /// Page-count ceiling for this profile.
    pub fn max_pages(&self) -> usize {
        match self {
            CrawlDepth::Shallow => 10,
            CrawlDepth::Deep => 50,
            CrawlDepth::Exhaustive => 200,
        }
    }

    /// Maximum link hops from the start URL.
    pub fn max_link_depth(&self) -> usize {
        match self {
            CrawlDepth::Shallow => 2,
            CrawlDepth::Deep => 4,
            CrawlDepth::Exhaustive => 8,
        }
    }
}

/// Username/password pair for a target application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Per-operation timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    #[serde(default = "default_interaction_ms")]
    pub interaction_ms: u64,
    #[serde(default = "default_navigation_ms")]
    pub navigation_ms: u64,
    #[serde(default = "default_idle_ms")]
    pub network_idle_ms: u64,
}

impl Timeouts {
    pub fn interaction(&self) -> Duration {
        Duration::from_millis(self.interaction_ms)
    }

    pub fn navigation(&self) -> Duration {
        Duration::from_millis(self.navigation_ms)
    }

    pub fn network_idle(&self) -> Duration {
        Duration::from_millis(self.network_idle_ms)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            interaction_ms: default_interaction_ms(),
            navigation_ms: default_navigation_ms(),
            network_idle_ms: default_idle_ms(),
        }
    }
}

/// Self-healing thresholds and budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingConfig {
    #[serde(default = "default_auto_apply")]
    pub auto_apply_threshold: f64,
    #[serde(default = "default_suggestion_min")]
    pub suggestion_min: f64,
    #[serde(default = "default_auto_apply")]
    pub suggestion_max: f64,
    /// Wall-clock budget for one healing attempt, checked between strategies
    #[serde(default = "default_healing_budget_ms")]
    pub budget_ms: u64,
    #[serde(default = "default_true")]
    pub similarity_enabled: bool,
}

impl HealingConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(self.auto_apply_threshold)
            || !in_range(self.suggestion_min)
            || !in_range(self.suggestion_max)
        {
            return Err(AutotestError::Config(
                "healing thresholds must be within [0, 1]".into(),
            ));
        }
        if self.suggestion_min > self.suggestion_max {
            return Err(AutotestError::Config(
                "suggestionMin must not exceed suggestionMax".into(),
            ));
        }
        if self.suggestion_max > self.auto_apply_threshold {
            return Err(AutotestError::Config(
                "suggestionMax must not exceed autoApplyThreshold".into(),
            ));
        }
        Ok(())
    }
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            auto_apply_threshold: default_auto_apply(),
            suggestion_min: default_suggestion_min(),
            suggestion_max: default_auto_apply(),
            budget_ms: default_healing_budget_ms(),
            similarity_enabled: true,
        }
    }
}

/// Bounds on how many tests of each kind are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationLimits {
    #[serde(default = "default_navigation_tests")]
    pub max_navigation_tests: usize,
    #[serde(default = "default_interaction_tests")]
    pub max_interaction_tests: usize,
    #[serde(default = "default_api_tests")]
    pub max_api_tests: usize,
    #[serde(default = "default_flow_tests")]
    pub max_flow_tests: usize,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            max_navigation_tests: default_navigation_tests(),
            max_interaction_tests: default_interaction_tests(),
            max_api_tests: default_api_tests(),
            max_flow_tests: default_flow_tests(),
        }
    }
}

/// Local LLM endpoint used for generation and failure analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
        }
    }
}

/// Configuration of one autonomous run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub depth: CrawlDepth,
    #[serde(default = "default_true")]
    pub enable_healing: bool,
    #[serde(default)]
    pub create_jira_tickets: bool,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default = "default_workers")]
    pub parallel_workers: usize,
    #[serde(default)]
    pub capture_video: bool,
    #[serde(default = "default_true")]
    pub capture_screenshots: bool,
    #[serde(default)]
    pub ai_analysis_enabled: bool,
    #[serde(default)]
    pub authentication: Option<Credentials>,
    /// Where reports, screenshots and recordings go
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub healing: HealingConfig,
    #[serde(default)]
    pub generation: GenerationLimits,
    #[serde(default)]
    pub llm: Option<LlmConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            website_url: None,
            api_url: None,
            depth: CrawlDepth::default(),
            enable_healing: true,
            create_jira_tickets: false,
            headless: true,
            parallel_workers: default_workers(),
            capture_video: false,
            capture_screenshots: true,
            ai_analysis_enabled: false,
            authentication: None,
            output_dir: None,
            timeouts: Timeouts::default(),
            healing: HealingConfig::default(),
            generation: GenerationLimits::default(),
            llm: None,
        }
    }
}

impl RunConfig {
    /// Config targeting a single website.
    pub fn for_website(url: impl Into<String>) -> Self {
        Self {
            website_url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Load a config file. `~` is expanded.
    pub fn from_file(path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(path).to_string();
        let contents = std::fs::read_to_string(&expanded).map_err(|e| {
            AutotestError::Config(format!("failed to read {}: {}", expanded, e))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| AutotestError::Config(format!("invalid config {}: {}", expanded, e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.website_url.is_none() && self.api_url.is_none() {
            return Err(AutotestError::Config(
                "at least one of websiteUrl or apiUrl is required".into(),
            ));
        }
        for url in [&self.website_url, &self.api_url].into_iter().flatten() {
            url::Url::parse(url)
                .map_err(|e| AutotestError::Config(format!("invalid URL '{}': {}", url, e)))?;
        }
        if self.parallel_workers == 0 {
            return Err(AutotestError::Config(
                "parallelWorkers must be at least 1".into(),
            ));
        }
        self.healing.validate()
    }

    /// Output directory for a given run, defaulting to `~/.autotest/runs/<session>`.
    pub fn output_dir_for(&self, session_id: &str) -> PathBuf {
        match &self.output_dir {
            Some(dir) => expand_path(dir).join(session_id),
            None => default_base_dir().join("runs").join(session_id),
        }
    }
}

/// Most panels a multi-panel run accepts.
pub const MAX_PANELS: usize = 3;

/// Which audience a panel serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PanelRole {
    Public,
    User,
    Admin,
}

impl PanelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PanelRole::Public => "public",
            PanelRole::User => "user",
            PanelRole::Admin => "admin",
        }
    }
}

/// One panel of a multi-panel run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelConfig {
    pub role: PanelRole,
    /// Start URL; defaults to the shared website URL
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

/// A multi-panel run: shared settings plus up to three panels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiPanelConfig {
    #[serde(flatten)]
    pub base: RunConfig,
    pub panels: Vec<PanelConfig>,
}

impl MultiPanelConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(path).to_string();
        let contents = std::fs::read_to_string(&expanded).map_err(|e| {
            AutotestError::Config(format!("failed to read {}: {}", expanded, e))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| AutotestError::Config(format!("invalid config {}: {}", expanded, e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.panels.is_empty() || self.panels.len() > MAX_PANELS {
            return Err(AutotestError::Config(format!(
                "between 1 and {} panels are required, got {}",
                MAX_PANELS,
                self.panels.len()
            )));
        }
        for (i, panel) in self.panels.iter().enumerate() {
            if self.panels[..i].iter().any(|p| p.role == panel.role) {
                return Err(AutotestError::Config(format!(
                    "panel '{}' configured twice",
                    panel.role.as_str()
                )));
            }
            if panel.role != PanelRole::Public && panel.credentials.is_none() {
                return Err(AutotestError::Config(format!(
                    "panel '{}' needs credentials",
                    panel.role.as_str()
                )));
            }
            if panel.url.is_none() && self.base.website_url.is_none() {
                return Err(AutotestError::Config(format!(
                    "panel '{}' has no URL and no websiteUrl is set",
                    panel.role.as_str()
                )));
            }
        }
        let mut base = self.base.clone();
        if base.website_url.is_none() {
            base.website_url = self.panels.iter().find_map(|p| p.url.clone());
        }
        base.validate()
    }

    /// Run config for one panel: the shared settings with the panel's URL and credentials.
    pub fn panel_config(&self, panel: &PanelConfig) -> RunConfig {
        RunConfig {
            website_url: panel.url.clone().or_else(|| self.base.website_url.clone()),
            authentication: panel.credentials.clone(),
            ..self.base.clone()
        }
    }
}

/// Base directory for autotest state.
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".autotest")
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string())
}

// Serde default helpers
fn default_true() -> bool {
    true
}
fn default_workers() -> usize {
    4
}
fn default_interaction_ms() -> u64 {
    5_000
}
fn default_navigation_ms() -> u64 {
    30_000
}
fn default_idle_ms() -> u64 {
    10_000
}
fn default_auto_apply() -> f64 {
    0.7
}
fn default_suggestion_min() -> f64 {
    0.5
}
fn default_healing_budget_ms() -> u64 {
    10_000
}
fn default_navigation_tests() -> usize {
    20
}
fn default_interaction_tests() -> usize {
    15
}
fn default_api_tests() -> usize {
    50
}
fn default_flow_tests() -> usize {
    5
}
fn default_llm_endpoint() -> String {
    "http://localhost:11434/api/generate".to_string()
}
fn default_llm_model() -> String {
    "qwen2.5:7b".to_string()
}
