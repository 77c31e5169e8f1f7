//! Browser capability consumed by the testing core.
//!
//! Every method is an await point; a session is driven by exactly one task at
//! a time. Closing the [`Browser`] fails every in-flight operation on every
//! session, which is how a run is torn down.

pub mod client;
pub mod dom;
pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Timeouts;
use crate::models::{
    AuthState, LocalStorageState, NavigationResult, ObservedRequest, RawElement,
    SerializableCookie,
};

pub use client::{ChromeBrowser, ChromeLauncher};
pub use mock::{MockBrowser, MockLauncher};

/// Options for launching a browser instance.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub user_data_dir: PathBuf,
}

/// Options for one isolated session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Directory that receives recorded frames, if recording is enabled
    pub record_video_dir: Option<PathBuf>,
    pub timeouts: Timeouts,
}

/// Launches browser instances. One launch per orchestrator run.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Arc<dyn Browser>>;
}

/// A running browser able to open isolated sessions.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Open a fresh session with its own cookies, storage and cache.
    async fn new_session(&self, options: SessionOptions) -> Result<Arc<dyn PageSession>>;

    /// Close the browser. Idempotent.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// One page in one isolated browser context.
#[async_trait]
pub trait PageSession: Send + Sync {
    fn id(&self) -> &str;

    async fn navigate(&self, url: &str) -> Result<NavigationResult>;
    async fn reload(&self) -> Result<NavigationResult>;
    async fn current_url(&self) -> Result<String>;
    async fn title(&self) -> Result<String>;

    /// Interactive elements of the current document.
    async fn extract_elements(&self) -> Result<Vec<RawElement>>;
    /// Absolute hrefs of every anchor in the current document.
    async fn extract_links(&self) -> Result<Vec<String>>;
    /// Visible text of the document body.
    async fn page_text(&self) -> Result<String>;

    /// Whether the locator resolves to a visible element right now.
    async fn is_visible(&self, locator: &str) -> Result<bool>;
    /// Poll until the locator is visible or the timeout elapses.
    async fn wait_for(&self, locator: &str, timeout: Duration) -> Result<()>;
    async fn wait_idle(&self, timeout: Duration) -> Result<()>;

    async fn click(&self, locator: &str) -> Result<()>;
    async fn fill(&self, locator: &str, value: &str) -> Result<()>;
    async fn select(&self, locator: &str, value: &str) -> Result<()>;
    async fn set_checked(&self, locator: &str, checked: bool) -> Result<()>;
    async fn press(&self, key: &str) -> Result<()>;

    async fn screenshot(&self, path: &Path) -> Result<()>;

    async fn cookies(&self) -> Result<Vec<SerializableCookie>>;
    async fn set_cookies(&self, cookies: &[SerializableCookie]) -> Result<()>;
    async fn local_storage(&self) -> Result<LocalStorageState>;
    async fn set_local_storage(&self, state: &LocalStorageState) -> Result<()>;

    /// Requests observed since the previous call (drained).
    async fn observed_requests(&self) -> Result<Vec<ObservedRequest>>;

    /// Path of the in-progress recording, if this session records.
    fn video_path(&self) -> Option<PathBuf>;

    async fn close(&self) -> Result<()>;
}

/// Capture cookies and localStorage of a session.
pub async fn capture_auth_state(session: &dyn PageSession) -> Result<AuthState> {
    let cookies = session.cookies().await?;
    let local_storage = session.local_storage().await?;
    Ok(AuthState {
        cookies,
        local_storage,
        saved_at: chrono::Utc::now().to_rfc3339(),
    })
}

/// Replay a captured auth state into a session and reload so it takes effect.
///
/// localStorage is origin-scoped, so the session first navigates to `origin`.
pub async fn restore_auth_state(
    session: &dyn PageSession,
    origin: &str,
    state: &AuthState,
) -> Result<()> {
    session.navigate(origin).await?;
    session.set_cookies(&state.cookies).await?;
    if !state.local_storage.items.is_empty() {
        session.set_local_storage(&state.local_storage).await?;
    }
    session.reload().await?;
    tracing::debug!(
        "Restored {} cookies and {} storage items into session {}",
        state.cookies.len(),
        state.local_storage.items.len(),
        session.id()
    );
    Ok(())
}

/// Open a session and, when an auth state is given, restore it.
pub async fn open_session(
    browser: &dyn Browser,
    options: SessionOptions,
    auth: Option<(&str, &AuthState)>,
) -> Result<Arc<dyn PageSession>> {
    let session = browser.new_session(options).await?;
    if let Some((origin, state)) = auth {
        if let Err(e) = restore_auth_state(session.as_ref(), origin, state).await {
            let _ = session.close().await;
            return Err(e);
        }
    }
    Ok(session)
}
