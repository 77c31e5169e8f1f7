//! Application discovery: website crawling, API discovery, authenticated re-crawl.

pub mod api;
pub mod crawler;
pub mod flows;
pub mod locator;
pub mod post_auth;
pub mod url;

pub use api::ApiCrawler;
pub use crawler::{CrawlOptions, WebsiteCrawler};
pub use post_auth::{ClassifiedPages, PageCategory, PostAuthCrawler, PostAuthResult};
