//! Chrome CDP implementation of the browser capability.
//!
//! Each session is a page inside its own browser context (isolated cookies,
//! localStorage and cache). Element interactions resolve the locator in-page,
//! tag the element, then act on it through CDP.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EnableParams as NetworkEnableParams, EventRequestWillBeSent, SetCookiesParams,
    TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::{
    EventScreencastFrame, ScreencastFrameAckParams, StartScreencastFormat, StartScreencastParams,
};
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};
use chromiumoxide::page::Page;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::dom;
use super::{Browser, BrowserLauncher, LaunchOptions, PageSession, SessionOptions};
use crate::config::Timeouts;
use crate::models::{
    LocalStorageState, NavigationResult, ObservedRequest, RawElement, SerializableCookie,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Launches Chrome/Chromium through chromiumoxide.
pub struct ChromeLauncher;

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Arc<dyn Browser>> {
        let browser = ChromeBrowser::launch(options).await?;
        Ok(Arc::new(browser))
    }
}

struct Inner {
    browser: RwLock<CdpBrowser>,
    closed: AtomicBool,
}

/// A running Chrome instance.
pub struct ChromeBrowser {
    inner: Arc<Inner>,
    handler: Mutex<Option<JoinHandle<()>>>,
    contexts: Mutex<Vec<BrowserContextId>>,
    session_counter: AtomicUsize,
}

impl ChromeBrowser {
    /// Launch a browser with the given options.
    pub async fn launch(options: &LaunchOptions) -> Result<Self> {
        tokio::fs::create_dir_all(&options.user_data_dir).await?;

        let chrome_path = find_chrome_executable()?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .user_data_dir(&options.user_data_dir)
            .viewport(None)
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-breakpad")
            .arg("--disable-default-apps")
            .arg("--disable-extensions")
            .arg("--disable-hang-monitor")
            .arg("--disable-popup-blocking")
            .arg("--disable-prompt-on-repost")
            .arg("--disable-renderer-backgrounding")
            .arg("--disable-sync")
            .arg("--metrics-recording-only")
            .arg("--mute-audio")
            .arg("--no-first-run")
            .arg("--password-store=basic");

        if !options.headless {
            builder = builder.with_head();
        }

        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut handler) = CdpBrowser::launch(config)
            .await
            .context("Failed to launch browser")?;

        // Drain CDP events; the browser stalls if nobody polls the handler
        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

        tracing::info!(
            "Browser launched ({})",
            if options.headless { "headless" } else { "headed" }
        );

        Ok(Self {
            inner: Arc::new(Inner {
                browser: RwLock::new(browser),
                closed: AtomicBool::new(false),
            }),
            handler: Mutex::new(Some(handler_task)),
            contexts: Mutex::new(Vec::new()),
            session_counter: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn new_session(&self, options: SessionOptions) -> Result<Arc<dyn PageSession>> {
        if self.is_closed() {
            anyhow::bail!("Browser is closed");
        }

        let browser = self.inner.browser.read().await;

        let context_id = browser
            .create_browser_context(CreateBrowserContextParams::default())
            .await
            .context("Failed to create browser context")?;

        let page = browser
            .new_page(
                CreateTargetParams::builder()
                    .url("about:blank")
                    .browser_context_id(context_id.clone())
                    .build()
                    .map_err(|e| anyhow::anyhow!("Failed to build target params: {:?}", e))?,
            )
            .await
            .context("Failed to create page in context")?;
        drop(browser);

        self.contexts.lock().push(context_id.clone());

        let number = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("session-{}", number);

        let requests = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();

        page.execute(NetworkEnableParams::default())
            .await
            .context("Failed to enable network domain")?;
        tasks.push(spawn_request_observer(&page, Arc::clone(&requests)).await?);

        let video_dir = match options.record_video_dir {
            Some(base) => {
                let dir = base.join(&id);
                tokio::fs::create_dir_all(&dir).await?;
                tasks.push(spawn_screencast(&page, dir.clone()).await?);
                Some(dir)
            }
            None => None,
        };

        tracing::info!("Created new session: {}", id);

        Ok(Arc::new(ChromeSession {
            id,
            page,
            context_id,
            inner: Arc::clone(&self.inner),
            requests,
            tasks: Mutex::new(tasks),
            video_dir,
            timeouts: options.timeouts,
            ref_counter: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let contexts: Vec<BrowserContextId> = self.contexts.lock().drain(..).collect();
        let mut browser = self.inner.browser.write().await;
        for context_id in contexts {
            let _ = browser.dispose_browser_context(context_id).await;
        }
        let closed = browser.close().await;
        let _ = browser.wait().await;
        drop(browser);

        if let Some(handler) = self.handler.lock().take() {
            handler.abort();
        }

        tracing::info!("Browser closed");
        closed.map(|_| ()).context("Failed to close browser")
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// One page inside an isolated browser context.
pub struct ChromeSession {
    id: String,
    page: Page,
    context_id: BrowserContextId,
    inner: Arc<Inner>,
    requests: Arc<Mutex<Vec<ObservedRequest>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    video_dir: Option<PathBuf>,
    timeouts: Timeouts,
    ref_counter: AtomicUsize,
    closed: AtomicBool,
}

impl ChromeSession {
    async fn eval<T: DeserializeOwned>(&self, script: String, what: &str) -> Result<T> {
        self.page
            .evaluate(script)
            .await
            .with_context(|| format!("Failed to evaluate {}", what))?
            .into_value()
            .with_context(|| format!("Failed to parse {}", what))
    }

    /// Resolve and tag the locator, polling until the interaction timeout.
    async fn tag(&self, locator: &str) -> Result<String> {
        let ref_id = format!(
            "r{}",
            self.ref_counter.fetch_add(1, Ordering::SeqCst) + 1
        );
        let script = dom::tag_script(locator, &ref_id)?;
        let deadline = Instant::now() + self.timeouts.interaction();

        loop {
            let found: bool = self.eval(script.clone(), "locator").await.unwrap_or(false);
            if found {
                return Ok(dom::ref_selector(&ref_id));
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "Element not found: {} (not visible after {:?})",
                    locator,
                    self.timeouts.interaction()
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn document_status(&self) -> Option<u16> {
        self.eval::<Option<u16>>(dom::DOCUMENT_STATUS.to_string(), "document status")
            .await
            .ok()
            .flatten()
    }

    async fn dispatch_key(&self, key: &str, kind: DispatchKeyEventType) -> Result<()> {
        let mut builder = DispatchKeyEventParams::builder().r#type(kind.clone()).key(key);
        if matches!(kind, DispatchKeyEventType::KeyDown) {
            if let Some(text) = key_text(key) {
                builder = builder.text(text);
            }
        }
        self.page
            .execute(
                builder
                    .build()
                    .map_err(|e| anyhow::anyhow!("Failed to build key event: {:?}", e))?,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PageSession for ChromeSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str) -> Result<NavigationResult> {
        let limit = self.timeouts.navigation();
        tokio::time::timeout(limit, self.page.goto(url))
            .await
            .map_err(|_| anyhow::anyhow!("Navigation to {} timed out after {:?}", url, limit))?
            .with_context(|| format!("Navigation to {} failed", url))?;
        let _ = tokio::time::timeout(limit, self.page.wait_for_navigation()).await;

        let current_url = self.page.url().await?.unwrap_or_default();
        let title = self.page.get_title().await?.unwrap_or_default();
        let status = self.document_status().await;

        Ok(NavigationResult {
            url: current_url,
            title,
            status,
        })
    }

    async fn reload(&self) -> Result<NavigationResult> {
        let url = self.current_url().await?;
        self.navigate(&url).await
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn title(&self) -> Result<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    async fn extract_elements(&self) -> Result<Vec<RawElement>> {
        self.eval(dom::EXTRACT_ELEMENTS.to_string(), "element extraction")
            .await
    }

    async fn extract_links(&self) -> Result<Vec<String>> {
        self.eval(dom::EXTRACT_LINKS.to_string(), "link extraction")
            .await
    }

    async fn page_text(&self) -> Result<String> {
        self.eval(dom::PAGE_TEXT.to_string(), "page text").await
    }

    async fn is_visible(&self, locator: &str) -> Result<bool> {
        self.eval(dom::visible_script(locator)?, "visibility").await
    }

    async fn wait_for(&self, locator: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_visible(locator).await.unwrap_or(false) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("Timed out after {:?} waiting for {}", timeout, locator);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let before = self.requests.lock().len();
            tokio::time::sleep(Duration::from_millis(500)).await;
            let ready: bool = self
                .eval(
                    "document.readyState === 'complete'".to_string(),
                    "ready state",
                )
                .await
                .unwrap_or(true);
            if ready && self.requests.lock().len() == before {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::debug!("Network not idle after {:?}, continuing", timeout);
                return Ok(());
            }
        }
    }

    async fn click(&self, locator: &str) -> Result<()> {
        let selector = self.tag(locator).await?;
        let element = self
            .page
            .find_element(&selector)
            .await
            .with_context(|| format!("Element not found: {}", locator))?;
        tokio::time::timeout(self.timeouts.interaction(), element.click())
            .await
            .map_err(|_| anyhow::anyhow!("Click on {} timed out", locator))??;
        Ok(())
    }

    async fn fill(&self, locator: &str, value: &str) -> Result<()> {
        let selector = self.tag(locator).await?;
        let _: bool = self.eval(dom::clear_script(&selector)?, "clear").await?;
        let element = self
            .page
            .find_element(&selector)
            .await
            .with_context(|| format!("Element not found: {}", locator))?;
        element.click().await?;
        element.type_str(value).await?;
        let _: bool = self.eval(dom::commit_script(&selector)?, "commit").await?;
        Ok(())
    }

    async fn select(&self, locator: &str, value: &str) -> Result<()> {
        let selector = self.tag(locator).await?;
        let _: bool = self
            .eval(dom::select_script(&selector, value)?, "select")
            .await
            .context("Failed to select option")?;
        Ok(())
    }

    async fn set_checked(&self, locator: &str, checked: bool) -> Result<()> {
        let selector = self.tag(locator).await?;
        let _: bool = self
            .eval(dom::check_script(&selector, checked)?, "check")
            .await
            .context("Failed to set checkbox state")?;
        Ok(())
    }

    async fn press(&self, key: &str) -> Result<()> {
        self.dispatch_key(key, DispatchKeyEventType::KeyDown).await?;
        self.dispatch_key(key, DispatchKeyEventType::KeyUp).await?;
        Ok(())
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        let data = self
            .page
            .screenshot(
                chromiumoxide::page::ScreenshotParams::builder()
                    .full_page(true)
                    .build(),
            )
            .await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &data).await?;
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<SerializableCookie>> {
        let cookies = self.page.get_cookies().await?;

        Ok(cookies
            .into_iter()
            .map(|cookie| SerializableCookie {
                name: cookie.name,
                value: cookie.value,
                domain: cookie.domain,
                path: cookie.path,
                expires: if cookie.session {
                    None
                } else {
                    Some(cookie.expires)
                },
                secure: cookie.secure,
                http_only: cookie.http_only,
                same_site: cookie.same_site,
            })
            .collect())
    }

    async fn set_cookies(&self, cookies: &[SerializableCookie]) -> Result<()> {
        if cookies.is_empty() {
            return Ok(());
        }

        let params: Vec<CookieParam> = cookies
            .iter()
            .map(|cookie| {
                let mut param = CookieParam::new(cookie.name.clone(), cookie.value.clone());
                param.domain = Some(cookie.domain.clone());
                param.path = Some(cookie.path.clone());
                param.secure = Some(cookie.secure);
                param.http_only = Some(cookie.http_only);
                param.same_site = cookie.same_site.clone();
                param.expires = cookie.expires.map(TimeSinceEpoch::new);
                param
            })
            .collect();

        self.page.execute(SetCookiesParams::new(params)).await?;
        Ok(())
    }

    async fn local_storage(&self) -> Result<LocalStorageState> {
        let origin: String = self
            .eval("location.origin".to_string(), "location.origin")
            .await?;

        let entries: Vec<(String, String)> = self
            .eval(
                "(() => { try { return Object.entries(localStorage); } catch (_) { return []; } })()"
                    .to_string(),
                "localStorage entries",
            )
            .await?;

        let items: HashMap<String, String> = entries.into_iter().collect();
        Ok(LocalStorageState { origin, items })
    }

    async fn set_local_storage(&self, state: &LocalStorageState) -> Result<()> {
        let script = dom::set_local_storage_script(&state.items)?;
        self.page.evaluate(script).await?;
        Ok(())
    }

    async fn observed_requests(&self) -> Result<Vec<ObservedRequest>> {
        Ok(self.requests.lock().drain(..).collect())
    }

    fn video_path(&self) -> Option<PathBuf> {
        self.video_dir.clone()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.page.clone().close().await;
        let browser = self.inner.browser.read().await;
        browser
            .dispose_browser_context(self.context_id.clone())
            .await
            .context("Failed to dispose browser context")?;
        tracing::debug!("Closed session: {}", self.id);
        Ok(())
    }
}

/// Record every request the page issues.
async fn spawn_request_observer(
    page: &Page,
    sink: Arc<Mutex<Vec<ObservedRequest>>>,
) -> Result<JoinHandle<()>> {
    let mut events = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .context("Failed to subscribe to network events")?;

    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let resource_type = event
                .r#type
                .as_ref()
                .map(|t| format!("{:?}", t).to_lowercase())
                .unwrap_or_default();
            sink.lock().push(ObservedRequest {
                method: event.request.method.clone(),
                url: event.request.url.clone(),
                resource_type,
                post_data: event
                    .request
                    .post_data_entries
                    .as_ref()
                    .and_then(|entries| serde_json::to_value(entries).ok())
                    .and_then(|entries| post_body(&entries)),
            });
        }
    }))
}

/// Request body reassembled from serialized `postDataEntries` (base64 `bytes`).
fn post_body(entries: &serde_json::Value) -> Option<String> {
    let mut body = Vec::new();
    for entry in entries.as_array()? {
        if let Some(bytes) = entry.get("bytes").and_then(serde_json::Value::as_str) {
            body.extend(base64::engine::general_purpose::STANDARD.decode(bytes).ok()?);
        }
    }
    if body.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(&body).into_owned())
}

/// Write screencast frames as numbered JPEGs into `dir`.
async fn spawn_screencast(page: &Page, dir: PathBuf) -> Result<JoinHandle<()>> {
    let mut frames = page
        .event_listener::<EventScreencastFrame>()
        .await
        .context("Failed to subscribe to screencast frames")?;

    let mut params = StartScreencastParams::default();
    params.format = Some(StartScreencastFormat::Jpeg);
    params.quality = Some(60);
    params.every_nth_frame = Some(2);
    page.execute(params)
        .await
        .context("Failed to start screencast")?;

    let page = page.clone();
    Ok(tokio::spawn(async move {
        let mut index: u64 = 0;
        while let Some(frame) = frames.next().await {
            index += 1;
            if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&frame.data) {
                let path = dir.join(format!("frame-{:06}.jpg", index));
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    tracing::debug!("Failed to write frame {:?}: {}", path, e);
                }
            }
            let _ = page
                .execute(ScreencastFrameAckParams::new(frame.session_id))
                .await;
        }
    }))
}

/// Character a key press should insert, so Enter submits forms.
fn key_text(key: &str) -> Option<&'static str> {
    match key {
        "Enter" => Some("\r"),
        "Tab" => Some("\t"),
        " " | "Space" => Some(" "),
        _ => None,
    }
}

/// Find Chrome executable on the system.
///
/// `AUTOTEST_CHROME` wins, then Playwright's browser cache, then common
/// install locations.
fn find_chrome_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("AUTOTEST_CHROME") {
        let p = PathBuf::from(shellexpand::tilde(&path).to_string());
        if p.exists() {
            return Ok(p);
        }
        tracing::warn!("AUTOTEST_CHROME points to missing file: {}", path);
    }

    if let Some(home) = dirs::home_dir() {
        for cache in ["Library/Caches/ms-playwright", ".cache/ms-playwright"] {
            let playwright_cache = home.join(cache);
            let Ok(entries) = std::fs::read_dir(&playwright_cache) else {
                continue;
            };

            let mut chromium_dirs: Vec<_> = entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("chromium"))
                .collect();
            chromium_dirs.sort_by_key(|b| std::cmp::Reverse(b.file_name()));

            for dir in chromium_dirs {
                for candidate in [
                    "chrome-linux/chrome",
                    "chrome-headless-shell-linux/chrome-headless-shell",
                    "chrome-mac/Chromium.app/Contents/MacOS/Chromium",
                    "chrome-headless-shell-mac-arm64/chrome-headless-shell",
                    "chrome-headless-shell-mac-x64/chrome-headless-shell",
                ] {
                    let binary = dir.path().join(candidate);
                    if binary.exists() {
                        tracing::info!("Using Playwright Chromium at: {:?}", binary);
                        return Ok(binary);
                    }
                }
            }
        }
    }

    let paths = [
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    for path in &paths {
        let p = PathBuf::from(path);
        if p.exists() {
            tracing::info!("Found Chrome at: {}", path);
            return Ok(p);
        }
    }

    anyhow::bail!("Chrome/Chromium not found. Set AUTOTEST_CHROME or install Chromium (npx playwright install chromium).")
}
