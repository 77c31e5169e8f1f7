//! autotest - autonomous end-to-end testing of web applications.
//!
//! Point it at a website (and optionally an API): it crawls the application,
//! signs in when it can, generates tests, runs them in isolated browser
//! sessions, repairs broken locators on the fly and classifies what failed.
//!
//! The browser is reached through the [`browser::Browser`] traits. Production
//! runs use Chrome over CDP ([`browser::ChromeLauncher`]); tests use the
//! scripted [`browser::MockBrowser`].

pub mod analysis;
pub mod auth;
pub mod browser;
pub mod config;
pub mod discovery;
pub mod error;
pub mod execution;
pub mod generation;
pub mod healing;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod rbac;
pub mod sink;

pub use config::{MultiPanelConfig, PanelConfig, PanelRole, RunConfig};
pub use error::{AutotestError, Result};
pub use orchestrator::{
    AutonomousTestingOrchestrator, Collaborators, CompositeReport, MultiPanelOrchestrator, RunResult,
};
pub use progress::{Phase, ProgressReporter, ProgressUpdate};
