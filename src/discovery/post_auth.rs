//! Authenticated re-crawl and page classification.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::browser::{open_session, Browser, SessionOptions};
use crate::error::{AutotestError, Result};
use crate::models::{AuthState, PageInfo, WebsiteMap};

use super::crawler::{CrawlOptions, WebsiteCrawler};
use super::url::origin_of;

/// Functional group of an authenticated page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageCategory {
    Create,
    Edit,
    List,
    Delete,
    Dashboard,
    Settings,
    Other,
}

/// Checked in order; the first match wins.
const CATEGORY_PATTERNS: &[(PageCategory, &[&str])] = &[
    (PageCategory::Delete, &["delete", "remove", "destroy"]),
    (PageCategory::Edit, &["edit", "update", "modify"]),
    (PageCategory::Create, &["create", "/new", "new ", "/add", "add "]),
    (
        PageCategory::Settings,
        &["settings", "preferences", "profile", "account", "config"],
    ),
    (PageCategory::Dashboard, &["dashboard", "overview", "home", "admin"]),
    (PageCategory::List, &["list", "all ", "manage", "index", "browse"]),
];

/// Classify a page by URL and title.
pub fn classify_page(page: &PageInfo) -> PageCategory {
    let haystack = format!("{} {} ", page.url, page.title).to_lowercase();
    CATEGORY_PATTERNS
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| haystack.contains(p)))
        .map(|(category, _)| *category)
        .unwrap_or(PageCategory::Other)
}

/// Authenticated page URLs grouped by category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedPages {
    pub create: Vec<String>,
    pub edit: Vec<String>,
    pub list: Vec<String>,
    pub delete: Vec<String>,
    pub dashboard: Vec<String>,
    pub settings: Vec<String>,
}

impl ClassifiedPages {
    pub fn from_pages(pages: &[PageInfo]) -> Self {
        let mut classified = Self::default();
        for page in pages {
            let bucket = match classify_page(page) {
                PageCategory::Create => &mut classified.create,
                PageCategory::Edit => &mut classified.edit,
                PageCategory::List => &mut classified.list,
                PageCategory::Delete => &mut classified.delete,
                PageCategory::Dashboard => &mut classified.dashboard,
                PageCategory::Settings => &mut classified.settings,
                PageCategory::Other => continue,
            };
            bucket.push(page.url.clone());
        }
        classified
    }

    /// Pages whose forms change application state.
    pub fn state_changing(&self) -> impl Iterator<Item = &String> {
        self.create.iter().chain(self.edit.iter()).chain(self.delete.iter())
    }
}

#[derive(Debug, Clone)]
pub struct PostAuthResult {
    pub map: WebsiteMap,
    pub categories: ClassifiedPages,
}

/// Re-runs the website crawler with a restored session.
pub struct PostAuthCrawler {
    browser: Arc<dyn Browser>,
    session_options: SessionOptions,
    options: CrawlOptions,
}

impl PostAuthCrawler {
    pub fn new(browser: Arc<dyn Browser>, session_options: SessionOptions, options: CrawlOptions) -> Self {
        Self {
            browser,
            session_options,
            options,
        }
    }

    pub async fn crawl(&self, start_url: &str, auth: &AuthState) -> Result<PostAuthResult> {
        let origin = origin_of(start_url).ok_or_else(|| AutotestError::Discovery {
            url: start_url.to_string(),
            reason: "not an absolute URL".to_string(),
        })?;
        let session = open_session(
            self.browser.as_ref(),
            self.session_options.clone(),
            Some((&origin, auth)),
        )
        .await
        .map_err(|e| AutotestError::Discovery {
            url: origin.clone(),
            reason: format!("could not restore session: {}", e),
        })?;

        let crawler = WebsiteCrawler::new(
            Arc::clone(&self.browser),
            self.session_options.clone(),
            self.options,
        )
        .preserving_session();
        let result = crawler.crawl_with_session(session.as_ref(), start_url).await;
        let _ = session.close().await;

        let map = result?;
        let categories = ClassifiedPages::from_pages(&map.pages);
        tracing::info!(
            "Authenticated crawl: {} pages ({} create, {} edit, {} list)",
            map.pages.len(),
            categories.create.len(),
            categories.edit.len(),
            categories.list.len()
        );
        Ok(PostAuthResult { map, categories })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{detect, LoginFlow};
    use crate::browser::PageSession;
    use crate::browser::mock::{Access, MockBrowser, MockElement, MockPage, MockSite, SubmitBehavior};
    use crate::config::Credentials;
    use std::time::Duration;

    fn page(url: &str, title: &str) -> PageInfo {
        PageInfo {
            url: url.into(),
            title: title.into(),
            elements: vec![],
            depth: 0,
            status: Some(200),
        }
    }

    #[test]
    fn test_classification_order() {
        assert_eq!(classify_page(&page("https://a.test/users/new", "New user")), PageCategory::Create);
        assert_eq!(classify_page(&page("https://a.test/users/1/edit", "Edit")), PageCategory::Edit);
        assert_eq!(classify_page(&page("https://a.test/users/1/delete", "Edit")), PageCategory::Delete);
        assert_eq!(classify_page(&page("https://a.test/dashboard", "Overview")), PageCategory::Dashboard);
        assert_eq!(classify_page(&page("https://a.test/settings", "Settings")), PageCategory::Settings);
        assert_eq!(classify_page(&page("https://a.test/users", "User list")), PageCategory::List);
        assert_eq!(classify_page(&page("https://a.test/about", "About us")), PageCategory::Other);
    }

    #[test]
    fn test_grouping() {
        let pages = vec![
            page("https://a.test/products/create", "Create product"),
            page("https://a.test/products", "Product list"),
            page("https://a.test/about", "About"),
        ];
        let classified = ClassifiedPages::from_pages(&pages);
        assert_eq!(classified.create.len(), 1);
        assert_eq!(classified.list.len(), 1);
        assert_eq!(classified.state_changing().count(), 1);
    }

    fn members_site() -> MockSite {
        MockSite::new("https://app.test")
            .page(
                MockPage::new("/", "Home")
                    .element(MockElement::link("Log out", "/logout"))
                    .element(MockElement::link("Account", "/account"))
                    .element(MockElement::link("Log in", "/login")),
            )
            .page(
                MockPage::new("/login", "Login")
                    .element(MockElement::form(0))
                    .element(MockElement::input("username", "text").in_form(0))
                    .element(MockElement::input("password", "password").in_form(0))
                    .element(MockElement::button("Sign in").in_form(0))
                    .on_submit(SubmitBehavior::Login {
                        redirect: "/account".into(),
                    }),
            )
            .page(
                MockPage::new("/account", "Account")
                    .access(Access::Authenticated)
                    .element(MockElement::link("Orders", "/orders")),
            )
            .page(MockPage::new("/orders", "Order list").access(Access::Authenticated))
            .login_page("/login")
            .logout_page("/logout")
            .account("alice", "secret", "user")
    }

    #[tokio::test]
    async fn test_logout_link_not_followed() {
        let browser = Arc::new(MockBrowser::new(Arc::new(members_site())));
        let options = CrawlOptions {
            max_pages: 10,
            max_depth: 3,
            idle_wait: Duration::ZERO,
        };
        let anonymous = WebsiteCrawler::new(browser.clone(), SessionOptions::default(), options)
            .crawl("https://app.test/")
            .await
            .unwrap();
        let form = detect(&anonymous.pages).login.unwrap();

        let session = browser.new_session(SessionOptions::default()).await.unwrap();
        let credentials = Credentials {
            username: "alice".into(),
            password: "secret".into(),
        };
        let state = LoginFlow::new()
            .with_settle_delay(Duration::ZERO)
            .login(session.as_ref(), &form, &credentials)
            .await
            .unwrap();
        session.close().await.unwrap();

        let found = PostAuthCrawler::new(browser, SessionOptions::default(), options)
            .crawl("https://app.test/", &state)
            .await
            .unwrap();
        assert!(!found.map.has_page("https://app.test/logout"));
        assert!(found.map.has_page("https://app.test/account"));
        assert!(found.map.has_page("https://app.test/orders"));
        assert!(found.categories.list.contains(&"https://app.test/orders".to_string()));
    }
}
