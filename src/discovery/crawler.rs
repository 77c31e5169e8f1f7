//! Breadth-first website crawler.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::browser::{Browser, PageSession, SessionOptions};
use crate::config::CrawlDepth;
use crate::error::{AutotestError, Result};
use crate::models::{PageInfo, WebsiteMap};

use super::flows::{detect_flows, page_interactions};
use super::locator::to_element_info;
use super::url::{ends_session, is_document_link, normalize_url, resolve, same_origin};

/// Bounds for one crawl.
#[derive(Debug, Clone, Copy)]
pub struct CrawlOptions {
    pub max_pages: usize,
    /// Maximum link hops from the start URL
    pub max_depth: usize,
    /// Wait for network quiet after each navigation, at most this long
    pub idle_wait: Duration,
}

impl From<CrawlDepth> for CrawlOptions {
    fn from(depth: CrawlDepth) -> Self {
        Self {
            max_pages: depth.max_pages(),
            max_depth: depth.max_link_depth(),
            idle_wait: Duration::from_secs(2),
        }
    }
}

/// Discovers same-origin pages and their interactive elements.
pub struct WebsiteCrawler {
    browser: Arc<dyn Browser>,
    session_options: SessionOptions,
    options: CrawlOptions,
    preserve_session: bool,
}

impl WebsiteCrawler {
    pub fn new(browser: Arc<dyn Browser>, session_options: SessionOptions, options: CrawlOptions) -> Self {
        Self {
            browser,
            session_options,
            options,
            preserve_session: false,
        }
    }

    /// Never follow logout/sign-out links, so a signed-in session survives the crawl.
    pub fn preserving_session(mut self) -> Self {
        self.preserve_session = true;
        self
    }

    /// Crawl from `start_url` in a fresh session.
    pub async fn crawl(&self, start_url: &str) -> Result<WebsiteMap> {
        let session = self
            .browser
            .new_session(self.session_options.clone())
            .await
            .map_err(|e| AutotestError::Discovery {
                url: start_url.to_string(),
                reason: format!("could not open session: {}", e),
            })?;
        let result = self.crawl_with_session(session.as_ref(), start_url).await;
        let _ = session.close().await;
        result
    }

    /// Crawl from `start_url` using an existing (possibly authenticated) session.
    pub async fn crawl_with_session(
        &self,
        session: &dyn PageSession,
        start_url: &str,
    ) -> Result<WebsiteMap> {
        let start = normalize_url(start_url).ok_or_else(|| AutotestError::Discovery {
            url: start_url.to_string(),
            reason: "not an absolute http(s) URL".to_string(),
        })?;

        let mut frontier: VecDeque<(String, usize)> = VecDeque::from([(start.clone(), 0)]);
        let mut queued: HashSet<String> = HashSet::from([start.clone()]);
        let mut recorded: HashSet<String> = HashSet::new();
        let mut map = WebsiteMap::default();
        let mut skipped = 0usize;

        tracing::info!(
            "Crawling {} (max {} pages, {} hops)",
            start,
            self.options.max_pages,
            self.options.max_depth
        );

        while let Some((url, depth)) = frontier.pop_front() {
            if map.pages.len() >= self.options.max_pages {
                break;
            }

            let nav = match session.navigate(&url).await {
                Ok(nav) => nav,
                Err(e) => {
                    let err = AutotestError::Discovery {
                        url: url.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!("Skipping page: {}", err);
                    skipped += 1;
                    continue;
                }
            };

            // Redirects land on URLs that may already be recorded
            let final_url = normalize_url(&nav.url).unwrap_or_else(|| url.clone());
            if !same_origin(&final_url, &start) || !recorded.insert(final_url.clone()) {
                tracing::debug!("Skipping {} (redirected to {})", url, final_url);
                continue;
            }
            queued.insert(final_url.clone());

            let _ = session.wait_idle(self.options.idle_wait).await;

            let raw_elements = match session.extract_elements().await {
                Ok(elements) => elements,
                Err(e) => {
                    tracing::warn!("Element extraction failed on {}: {}", final_url, e);
                    Vec::new()
                }
            };
            let elements = raw_elements
                .iter()
                .filter(|raw| raw.visible || raw.tag == "form")
                .filter_map(to_element_info)
                .collect();

            let page = PageInfo {
                url: final_url.clone(),
                title: nav.title,
                elements,
                depth,
                status: nav.status,
            };
            map.interactions.extend(page_interactions(&page));

            if depth < self.options.max_depth {
                let links = session.extract_links().await.unwrap_or_default();
                for href in links {
                    if !is_document_link(&href) {
                        continue;
                    }
                    let Some(target) = resolve(&final_url, &href) else {
                        continue;
                    };
                    if self.preserve_session && ends_session(&target) {
                        tracing::debug!("Not following session-ending link {}", target);
                        continue;
                    }
                    if same_origin(&target, &start) && queued.insert(target.clone()) {
                        frontier.push_back((target, depth + 1));
                    }
                }
            }

            tracing::debug!(
                "Visited {} ({} elements, depth {})",
                page.url,
                page.elements.len(),
                depth
            );
            map.pages.push(page);
        }

        map.user_flows = detect_flows(&map.pages, &map.interactions);
        tracing::info!(
            "Crawl finished: {} pages, {} flows, {} skipped",
            map.pages.len(),
            map.user_flows.len(),
            skipped
        );
        Ok(map)
    }
}
