//! Auto-fill for create-record forms.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::browser::PageSession;
use crate::discovery::url::normalize_url;
use crate::generation::values::{sample_value, FieldValue, ERROR_INDICATORS, SUCCESS_KEYWORDS};
use crate::models::{ElementKind, PageInfo};

use super::login::{fill_field, submit_form};

/// Result of submitting a create form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOutcome {
    pub success: bool,
    pub page_url: String,
    pub final_url: String,
    /// Locators that received a value
    pub filled: Vec<String>,
    pub message: String,
}

/// Fills arbitrary create-record forms with plausible values.
pub struct CreatePageHandler {
    idle_wait: Duration,
}

impl Default for CreatePageHandler {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_secs(5),
        }
    }
}

impl CreatePageHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the first form of `page`, submit it and judge the outcome.
    pub async fn fill_and_submit(
        &self,
        session: &dyn PageSession,
        page: &PageInfo,
    ) -> anyhow::Result<CreateOutcome> {
        session.navigate(&page.url).await?;

        let form = page.form_indexes().first().copied();
        let mut filled = Vec::new();
        for el in page.fields().filter(|e| form.is_none() || e.form_index == form) {
            let value = sample_value(el);
            if value == FieldValue::Skip {
                continue;
            }
            match fill_field(session, el, &value).await {
                Ok(locator) => filled.push(locator),
                Err(e) => tracing::debug!("Could not fill {}: {}", el.locator, e),
            }
        }

        let submit = page
            .elements
            .iter()
            .find(|e| e.kind == ElementKind::Button && e.is_submit() && e.form_index == form);
        submit_form(session, submit).await?;
        let _ = session.wait_idle(self.idle_wait).await;

        let final_url = session.current_url().await?;
        let url_changed = normalize_url(&final_url) != normalize_url(&page.url);
        let text = session.page_text().await.unwrap_or_default().to_lowercase();
        let success_text = SUCCESS_KEYWORDS.iter().find(|k| text.contains(*k));
        let error_visible = session
            .is_visible(&ERROR_INDICATORS.join(", "))
            .await
            .unwrap_or(false);

        let (success, message) = if url_changed {
            (true, format!("redirected to {}", final_url))
        } else if let Some(keyword) = success_text {
            (true, format!("success text '{}' visible", keyword))
        } else if !error_visible {
            (true, "no inline error after submit".to_string())
        } else {
            (false, "inline error visible after submit".to_string())
        };

        tracing::info!(
            "Create form on {}: {} ({})",
            page.url,
            if success { "ok" } else { "rejected" },
            message
        );
        Ok(CreateOutcome {
            success,
            page_url: page.url.clone(),
            final_url,
            filled,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::{MockBrowser, MockElement, MockPage, MockSite, SubmitBehavior};
    use crate::browser::{Browser, SessionOptions};
    use crate::discovery::crawler::{CrawlOptions, WebsiteCrawler};
    use std::sync::Arc;

    fn site(success_url: Option<&str>) -> MockSite {
        MockSite::new("https://app.test")
            .page(
                MockPage::new("/products/new", "New product")
                    .element(MockElement::form(0))
                    .element(MockElement::input("title", "text").in_form(0).required())
                    .element(MockElement::input("price", "number").in_form(0).required())
                    .element(MockElement::new("select").name("category").options(&["", "books"]).in_form(0))
                    .element(MockElement::new("textarea").name("description").in_form(0))
                    .element(MockElement::button("Create").in_form(0))
                    .on_submit(SubmitBehavior::Form {
                        success_url: success_url.map(str::to_string),
                    }),
            )
            .page(MockPage::new("/products", "Products"))
    }

    async fn run(site: MockSite) -> CreateOutcome {
        let browser = Arc::new(MockBrowser::new(Arc::new(site)));
        let crawler = WebsiteCrawler::new(
            browser.clone(),
            SessionOptions::default(),
            CrawlOptions {
                max_pages: 1,
                max_depth: 0,
                idle_wait: Duration::ZERO,
            },
        );
        let map = crawler.crawl("https://app.test/products/new").await.unwrap();
        let session = browser.new_session(SessionOptions::default()).await.unwrap();
        CreatePageHandler::new()
            .fill_and_submit(session.as_ref(), &map.pages[0])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_redirect_counts_as_success() {
        let outcome = run(site(Some("/products"))).await;
        assert!(outcome.success);
        assert_eq!(outcome.final_url, "https://app.test/products");
        assert_eq!(outcome.filled.len(), 4);
    }

    #[tokio::test]
    async fn test_success_text_without_redirect() {
        let outcome = run(site(None)).await;
        assert!(outcome.success);
        assert!(outcome.message.contains("saved") || outcome.message.contains("success"));
    }
}
