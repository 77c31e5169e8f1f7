//! Error taxonomy for autonomous runs.
//!
//! Only [`AutotestError::BrowserLaunch`] and [`AutotestError::Fatal`] abort a
//! run. Everything else is absorbed at page, test or step granularity by the
//! component that raised it.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutotestError {
    /// A page could not be loaded or read during crawling.
    #[error("discovery failed for {url}: {reason}")]
    Discovery { url: String, reason: String },

    /// Login or registration could not be verified.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The generation collaborator failed or returned unusable output.
    #[error("test generation failed: {0}")]
    Generation(String),

    /// A test step raised.
    #[error("step {step} failed: {message}")]
    Execution { step: usize, message: String },

    /// No healing strategy produced an auto-applicable locator in budget.
    #[error("healing exhausted for '{locator}' after {attempts} strategies")]
    HealingExhausted { locator: String, attempts: usize },

    /// The browser could not be launched.
    #[error("browser launch failed: {0}")]
    BrowserLaunch(#[source] anyhow::Error),

    /// Unexpected failure at the orchestrator's top level.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AutotestError {
    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AutotestError::BrowserLaunch(_) | AutotestError::Fatal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AutotestError>;
