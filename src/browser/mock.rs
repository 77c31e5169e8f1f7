//! Scripted in-memory browser.
//!
//! A [`MockSite`] describes pages, their elements, access rules and what
//! submitting a form does. [`MockBrowser`] serves it through the same
//! [`Browser`]/[`PageSession`] traits the Chrome client implements, so the
//! whole pipeline can run without a real browser.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::{Browser, BrowserLauncher, LaunchOptions, PageSession, SessionOptions};
use crate::models::{
    LocalStorageState, NavigationResult, ObservedRequest, RawElement, SerializableCookie,
};

const SESSION_COOKIE: &str = "session";

// =============================================================================
// SITE DESCRIPTION
// =============================================================================

/// Who may open a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Public,
    Authenticated,
    /// Only accounts with this role (or `admin`)
    Role(String),
}

/// What happens when a form on the page is submitted.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitBehavior {
    Nothing,
    /// Check the typed credentials against the site's accounts
    Login { redirect: String },
    /// Create an account from the typed values and sign in
    Register { redirect: String },
    /// Succeed when every required field has a value
    Form { success_url: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
enum ElementAction {
    Default,
    Navigate(String),
    Submit,
}

/// One element of a scripted page.
#[derive(Debug, Clone)]
pub struct MockElement {
    tag: String,
    id: Option<String>,
    name: Option<String>,
    test_id: Option<String>,
    aria_label: Option<String>,
    placeholder: Option<String>,
    input_type: Option<String>,
    text: Option<String>,
    href: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, String)>,
    form_index: Option<usize>,
    required: bool,
    visible: bool,
    options: Vec<String>,
    action: ElementAction,
}

impl MockElement {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_lowercase(),
            id: None,
            name: None,
            test_id: None,
            aria_label: None,
            placeholder: None,
            input_type: None,
            text: None,
            href: None,
            classes: Vec::new(),
            attrs: Vec::new(),
            form_index: None,
            required: false,
            visible: true,
            options: Vec::new(),
            action: ElementAction::Default,
        }
    }

    pub fn input(name: &str, input_type: &str) -> Self {
        Self::new("input").name(name).input_type(input_type)
    }

    pub fn button(text: &str) -> Self {
        Self::new("button").text(text)
    }

    pub fn link(text: &str, href: &str) -> Self {
        let mut el = Self::new("a").text(text);
        el.href = Some(href.to_string());
        el
    }

    /// A `<form>` element with the given document index.
    pub fn form(index: usize) -> Self {
        Self::new("form").in_form(index)
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    pub fn test_id(mut self, test_id: &str) -> Self {
        self.test_id = Some(test_id.to_string());
        self
    }

    pub fn aria_label(mut self, label: &str) -> Self {
        self.aria_label = Some(label.to_string());
        self
    }

    pub fn placeholder(mut self, placeholder: &str) -> Self {
        self.placeholder = Some(placeholder.to_string());
        self
    }

    pub fn input_type(mut self, input_type: &str) -> Self {
        self.input_type = Some(input_type.to_lowercase());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn attr(mut self, key: &str, value: &str) -> Self {
        self.attrs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn in_form(mut self, index: usize) -> Self {
        self.form_index = Some(index);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    pub fn navigates_to(mut self, url: &str) -> Self {
        self.action = ElementAction::Navigate(url.to_string());
        self
    }

    pub fn submits(mut self) -> Self {
        self.action = ElementAction::Submit;
        self
    }

    fn attr_value(&self, key: &str) -> Option<String> {
        match key {
            "id" => self.id.clone(),
            "name" => self.name.clone(),
            "data-testid" | "data-test" | "data-cy" => self.test_id.clone(),
            "aria-label" => self.aria_label.clone(),
            "placeholder" => self.placeholder.clone(),
            "type" => self.input_type.clone(),
            "href" => self.href.clone(),
            "class" if !self.classes.is_empty() => Some(self.classes.join(" ")),
            _ => self
                .attrs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone()),
        }
    }

    fn is_text_entry(&self) -> bool {
        match self.tag.as_str() {
            "textarea" => true,
            "input" => !matches!(
                self.input_type.as_deref(),
                Some("submit" | "button" | "checkbox" | "radio" | "reset" | "image")
            ),
            _ => false,
        }
    }

    fn is_toggle(&self) -> bool {
        self.tag == "input" && matches!(self.input_type.as_deref(), Some("checkbox" | "radio"))
    }

    fn is_submit_control(&self) -> bool {
        let submit_type = match self.tag.as_str() {
            "button" => matches!(self.input_type.as_deref(), None | Some("submit")),
            "input" => matches!(self.input_type.as_deref(), Some("submit" | "image")),
            _ => false,
        };
        submit_type && self.form_index.is_some()
    }
}

/// A scripted page.
#[derive(Debug, Clone)]
pub struct MockPage {
    path: String,
    title: String,
    status: u16,
    elements: Vec<MockElement>,
    text: String,
    access: Access,
    on_submit: SubmitBehavior,
    requests: Vec<ObservedRequest>,
}

impl MockPage {
    pub fn new(path: &str, title: &str) -> Self {
        Self {
            path: path.to_string(),
            title: title.to_string(),
            status: 200,
            elements: Vec::new(),
            text: String::new(),
            access: Access::Public,
            on_submit: SubmitBehavior::Nothing,
            requests: Vec::new(),
        }
    }

    pub fn element(mut self, element: MockElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn on_submit(mut self, behavior: SubmitBehavior) -> Self {
        self.on_submit = behavior;
        self
    }

    /// A request the page issues while loading (XHR unless it looks like a document).
    pub fn request(mut self, method: &str, url: &str) -> Self {
        self.requests.push(ObservedRequest {
            method: method.to_uppercase(),
            url: url.to_string(),
            resource_type: "xhr".to_string(),
            post_data: None,
        });
        self
    }

    fn synthetic(path: &str, title: &str, status: u16, text: &str) -> Self {
        Self::new(path, title).status(status).text(text)
    }
}

#[derive(Debug, Clone)]
struct MockAccount {
    password: String,
    role: String,
}

/// A complete scripted application.
#[derive(Debug)]
pub struct MockSite {
    origin: String,
    pages: HashMap<String, MockPage>,
    login_path: Option<String>,
    logout_path: Option<String>,
    accounts: Mutex<HashMap<String, MockAccount>>,
    failing: HashSet<String>,
}

impl MockSite {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: origin.trim_end_matches('/').to_string(),
            pages: HashMap::new(),
            login_path: None,
            logout_path: None,
            accounts: Mutex::new(HashMap::new()),
            failing: HashSet::new(),
        }
    }

    pub fn page(mut self, page: MockPage) -> Self {
        let key = normalize_path(&page.path);
        self.pages.insert(key, page);
        self
    }

    /// Where protected pages redirect anonymous visitors.
    pub fn login_page(mut self, path: &str) -> Self {
        self.login_path = Some(normalize_path(path));
        self
    }

    /// Opening this path ends the session.
    pub fn logout_page(mut self, path: &str) -> Self {
        let key = normalize_path(path);
        self.pages
            .entry(key.clone())
            .or_insert_with(|| MockPage::new(path, "Signed out").text("You have been signed out"));
        self.logout_path = Some(key);
        self
    }

    pub fn account(self, username: &str, password: &str, role: &str) -> Self {
        self.accounts.lock().insert(
            username.to_string(),
            MockAccount {
                password: password.to_string(),
                role: role.to_string(),
            },
        );
        self
    }

    /// Navigations to this path time out.
    pub fn failing(mut self, path: &str) -> Self {
        self.failing.insert(normalize_path(path));
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Absolute URL for a site path.
    pub fn url(&self, path: &str) -> String {
        if path == "/" {
            format!("{}/", self.origin)
        } else {
            format!("{}{}", self.origin, path)
        }
    }

    pub fn has_account(&self, username: &str) -> bool {
        self.accounts.lock().contains_key(username)
    }

    fn key(&self, url: &str) -> Option<String> {
        let base = Url::parse(&self.origin).ok()?;
        let parsed = base.join(url).ok()?;
        if parsed.origin() != base.origin() {
            return None;
        }
        Some(normalize_path(parsed.path()))
    }

    fn role_of(&self, username: &str) -> Option<String> {
        self.accounts.lock().get(username).map(|a| a.role.clone())
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

// =============================================================================
// SELECTOR MATCHING
// =============================================================================

#[derive(Debug, Default)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
    nth: Option<usize>,
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none()
            && self.id.is_none()
            && self.classes.is_empty()
            && self.attrs.is_empty()
            && self.nth.is_none()
    }

    fn matches(&self, el: &MockElement, nth: usize) -> bool {
        if self.is_empty() {
            return false;
        }
        if let Some(tag) = &self.tag {
            if tag != &el.tag {
                return false;
            }
        }
        if self.id.is_some() && self.id != el.id {
            return false;
        }
        if !self.classes.iter().all(|c| el.classes.contains(c)) {
            return false;
        }
        for (key, value) in &self.attrs {
            let actual = el.attr_value(key);
            let ok = match value {
                Some(v) => actual.as_deref() == Some(v.as_str()),
                None => actual.is_some(),
            };
            if !ok {
                return false;
            }
        }
        self.nth.map_or(true, |n| n == nth)
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split at top-level occurrences of `sep`, ignoring brackets and quotes.
fn split_top_level(selector: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in selector.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '[' | '(') => depth += 1,
            (None, ']' | ')') => depth = depth.saturating_sub(1),
            (None, c) if c == sep && depth == 0 => {
                parts.push(&selector[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&selector[start..]);
    parts
}

/// The right-most compound of a complex selector.
fn last_compound(selector: &str) -> &str {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in selector.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '[' | '(') => depth += 1,
            (None, ']' | ')') => depth = depth.saturating_sub(1),
            (None, c) if depth == 0 && (c.is_whitespace() || matches!(c, '>' | '+' | '~')) => {
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    selector[start..].trim()
}

fn parse_compound(s: &str) -> Option<Compound> {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    let read_ident = |i: &mut usize| -> String {
        let start = *i;
        while *i < len && (chars[*i].is_alphanumeric() || chars[*i] == '-' || chars[*i] == '_') {
            *i += 1;
        }
        chars[start..*i].iter().collect()
    };

    let mut compound = Compound::default();
    let mut i = 0;

    if i < len && chars[i] == '*' {
        i += 1;
    } else if i < len && chars[i].is_alphabetic() {
        compound.tag = Some(read_ident(&mut i).to_lowercase());
    }

    while i < len {
        match chars[i] {
            '#' => {
                i += 1;
                let id = read_ident(&mut i);
                if id.is_empty() {
                    return None;
                }
                compound.id = Some(id);
            }
            '.' => {
                i += 1;
                let class = read_ident(&mut i);
                if class.is_empty() {
                    return None;
                }
                compound.classes.push(class);
            }
            '[' => {
                i += 1;
                let start = i;
                let mut quote: Option<char> = None;
                while i < len {
                    let ch = chars[i];
                    match quote {
                        Some(q) if ch == q => quote = None,
                        Some(_) => {}
                        None if ch == '"' || ch == '\'' => quote = Some(ch),
                        None if ch == ']' => break,
                        None => {}
                    }
                    i += 1;
                }
                if i >= len {
                    return None;
                }
                let inner: String = chars[start..i].iter().collect();
                i += 1;
                compound.attrs.push(parse_attribute(&inner));
            }
            ':' => {
                i += 1;
                let name = read_ident(&mut i);
                let mut arg = None;
                if i < len && chars[i] == '(' {
                    let start = i + 1;
                    while i < len && chars[i] != ')' {
                        i += 1;
                    }
                    if i >= len {
                        return None;
                    }
                    arg = Some(chars[start..i].iter().collect::<String>());
                    i += 1;
                }
                if name == "nth-of-type" {
                    compound.nth = arg.and_then(|a| a.trim().parse().ok());
                }
            }
            _ => return None,
        }
    }
    Some(compound)
}

fn parse_attribute(inner: &str) -> (String, Option<String>) {
    match inner.split_once('=') {
        Some((key, value)) => {
            let value = value.trim();
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            (key.trim().to_string(), Some(unquoted.to_string()))
        }
        None => (inner.trim().to_string(), None),
    }
}

fn matches_locator(el: &MockElement, nth: usize, locator: &str) -> bool {
    let locator = locator.trim();
    if let Some(text) = locator.strip_prefix("text=") {
        let want = collapse_whitespace(text);
        return el
            .text
            .as_deref()
            .map(collapse_whitespace)
            .is_some_and(|t| !want.is_empty() && t == want);
    }
    if locator.starts_with("xpath=") || locator.starts_with("//") {
        return false;
    }
    split_top_level(locator, ',').into_iter().any(|selector| {
        parse_compound(last_compound(selector.trim()))
            .map(|c| c.matches(el, nth))
            .unwrap_or(false)
    })
}

/// 1-based position of each element among siblings with the same tag.
fn nth_of_type(elements: &[MockElement]) -> Vec<usize> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    elements
        .iter()
        .map(|el| {
            let n = counts.entry(el.tag.as_str()).or_insert(0);
            *n += 1;
            *n
        })
        .collect()
}

// =============================================================================
// SESSION STATE
// =============================================================================

#[derive(Debug, Default)]
struct SessionState {
    path: Option<String>,
    page: Option<MockPage>,
    cookies: Vec<SerializableCookie>,
    storage: HashMap<String, String>,
    values: HashMap<usize, String>,
    checked: HashMap<usize, bool>,
    active_form: Option<usize>,
    error: Option<String>,
    notice: Option<String>,
    requests: Vec<ObservedRequest>,
}

impl SessionState {
    fn user(&self) -> Option<String> {
        self.cookies
            .iter()
            .find(|c| c.name == SESSION_COOKIE)
            .map(|c| c.value.clone())
    }

    fn page(&self) -> Result<&MockPage> {
        self.page.as_ref().ok_or_else(|| anyhow!("No page loaded"))
    }

    fn navigate(&mut self, site: &MockSite, url: &str) -> Result<NavigationResult> {
        let key = site
            .key(url)
            .ok_or_else(|| anyhow!("net::ERR_NAME_NOT_RESOLVED at {}", url))?;
        if site.failing.contains(&key) {
            bail!("Navigation to {} timed out: net::ERR_TIMED_OUT", url);
        }
        if site.logout_path.as_ref() == Some(&key) {
            self.cookies.retain(|c| c.name != SESSION_COOKIE);
        }

        let role = self.user().and_then(|u| site.role_of(&u));
        let (path, page) = match site.pages.get(&key) {
            None => (
                key.clone(),
                MockPage::synthetic(&key, "Not Found", 404, "Page not found"),
            ),
            Some(page) => {
                let allowed = match (&page.access, &role) {
                    (Access::Public, _) => Some(true),
                    (_, None) => None,
                    (Access::Authenticated, Some(_)) => Some(true),
                    (Access::Role(required), Some(actual)) => {
                        Some(actual == required || actual == "admin")
                    }
                };
                match allowed {
                    Some(true) => (key.clone(), page.clone()),
                    Some(false) => (
                        key.clone(),
                        MockPage::synthetic(&key, "Forbidden", 403, "403 Forbidden"),
                    ),
                    None => match site
                        .login_path
                        .as_ref()
                        .and_then(|lp| site.pages.get(lp).map(|p| (lp.clone(), p.clone())))
                    {
                        Some(login) => login,
                        None => (
                            key.clone(),
                            MockPage::synthetic(&key, "Unauthorized", 401, "401 Unauthorized"),
                        ),
                    },
                }
            }
        };

        let final_url = site.url(&path);
        self.requests.push(ObservedRequest {
            method: "GET".to_string(),
            url: final_url.clone(),
            resource_type: "document".to_string(),
            post_data: None,
        });
        for request in &page.requests {
            let mut request = request.clone();
            if let Ok(absolute) = Url::parse(&final_url).and_then(|u| u.join(&request.url)) {
                request.url = absolute.to_string();
            }
            self.requests.push(request);
        }

        let result = NavigationResult {
            url: final_url,
            title: page.title.clone(),
            status: Some(page.status),
        };
        self.path = Some(path);
        self.page = Some(page);
        self.values.clear();
        self.checked.clear();
        self.active_form = None;
        self.error = None;
        self.notice = None;
        Ok(result)
    }

    /// Index of the first element matching `locator`, which must be visible.
    fn find(&self, locator: &str) -> Result<usize> {
        let page = self.page()?;
        let nth = nth_of_type(&page.elements);
        let mut hidden = false;
        for (idx, el) in page.elements.iter().enumerate() {
            if matches_locator(el, nth[idx], locator) {
                if el.visible {
                    return Ok(idx);
                }
                hidden = true;
            }
        }
        if hidden {
            bail!("Element not visible: {}", locator);
        }
        bail!("Element not found: {}", locator)
    }

    fn is_visible(&self, locator: &str) -> bool {
        if self.find(locator).is_ok() {
            return true;
        }
        // Inline error banner rendered after a rejected submit
        if let Some(message) = &self.error {
            let banner = MockElement::new("div")
                .class("error")
                .attr("role", "alert")
                .text(message);
            return matches_locator(&banner, 1, locator);
        }
        false
    }

    fn click(&mut self, site: &MockSite, locator: &str) -> Result<()> {
        let idx = self.find(locator)?;
        let el = self.page()?.elements[idx].clone();
        match &el.action {
            ElementAction::Navigate(url) => {
                let target = self.resolve(site, url);
                self.navigate(site, &target).map(|_| ())
            }
            ElementAction::Submit => self.submit(site, el.form_index),
            ElementAction::Default => {
                if el.is_submit_control() {
                    self.submit(site, el.form_index)
                } else if el.is_toggle() {
                    let current = self.checked.get(&idx).copied().unwrap_or(false);
                    self.checked.insert(idx, !current);
                    Ok(())
                } else if let Some(href) = &el.href {
                    let target = self.resolve(site, href);
                    self.navigate(site, &target).map(|_| ())
                } else {
                    Ok(())
                }
            }
        }
    }

    fn fill(&mut self, locator: &str, value: &str) -> Result<()> {
        let idx = self.find(locator)?;
        let el = &self.page()?.elements[idx];
        if !el.is_text_entry() {
            bail!("Element is not an <input> or <textarea>: {}", locator);
        }
        self.active_form = el.form_index.or(self.active_form);
        self.values.insert(idx, value.to_string());
        Ok(())
    }

    fn select(&mut self, locator: &str, value: &str) -> Result<()> {
        let idx = self.find(locator)?;
        let el = &self.page()?.elements[idx];
        if el.tag != "select" {
            bail!("Element is not a <select>: {}", locator);
        }
        if !el.options.iter().any(|o| o == value) {
            bail!("Option '{}' not found in {}", value, locator);
        }
        self.values.insert(idx, value.to_string());
        Ok(())
    }

    fn set_checked(&mut self, locator: &str, checked: bool) -> Result<()> {
        let idx = self.find(locator)?;
        if !self.page()?.elements[idx].is_toggle() {
            bail!("Element is not a checkbox or radio: {}", locator);
        }
        self.checked.insert(idx, checked);
        Ok(())
    }

    fn press(&mut self, site: &MockSite, key: &str) -> Result<()> {
        if key == "Enter" && self.active_form.is_some() {
            return self.submit(site, self.active_form);
        }
        Ok(())
    }

    fn resolve(&self, site: &MockSite, href: &str) -> String {
        let base = self
            .path
            .as_deref()
            .map(|p| site.url(p))
            .unwrap_or_else(|| site.url("/"));
        Url::parse(&base)
            .and_then(|u| u.join(href))
            .map(|u| u.to_string())
            .unwrap_or_else(|_| href.to_string())
    }

    fn form_values(&self, form: Option<usize>) -> Result<Vec<(MockElement, Option<String>)>> {
        let page = self.page()?;
        Ok(page
            .elements
            .iter()
            .enumerate()
            .filter(|(_, el)| el.tag != "form" && (form.is_none() || el.form_index == form))
            .map(|(idx, el)| (el.clone(), self.values.get(&idx).cloned()))
            .collect())
    }

    fn sign_in(&mut self, site: &MockSite, username: &str) {
        self.cookies.retain(|c| c.name != SESSION_COOKIE);
        self.cookies.push(SerializableCookie {
            name: SESSION_COOKIE.to_string(),
            value: username.to_string(),
            domain: Url::parse(&site.origin)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_default(),
            path: "/".to_string(),
            expires: None,
            secure: false,
            http_only: true,
            same_site: None,
        });
        self.storage
            .insert("currentUser".to_string(), username.to_string());
    }

    fn submit(&mut self, site: &MockSite, form: Option<usize>) -> Result<()> {
        let behavior = self.page()?.on_submit.clone();
        let fields = self.form_values(form)?;

        let password = fields
            .iter()
            .find(|(el, _)| el.input_type.as_deref() == Some("password"))
            .and_then(|(_, v)| v.clone())
            .unwrap_or_default();
        let entries: Vec<&(MockElement, Option<String>)> = fields
            .iter()
            .filter(|(el, v)| {
                el.is_text_entry()
                    && el.input_type.as_deref() != Some("password")
                    && v.as_deref().is_some_and(|v| !v.is_empty())
            })
            .collect();
        let looks_like_email = |el: &MockElement| {
            el.input_type.as_deref() == Some("email")
                || el.name.as_deref().is_some_and(|n| n.contains("email"))
        };
        let identity = entries
            .iter()
            .find(|(el, _)| looks_like_email(el))
            .or_else(|| entries.first())
            .and_then(|(_, v)| v.clone())
            .unwrap_or_default();

        match behavior {
            SubmitBehavior::Nothing => Ok(()),
            SubmitBehavior::Login { redirect } => {
                let valid = site
                    .accounts
                    .lock()
                    .get(&identity)
                    .is_some_and(|a| !password.is_empty() && a.password == password);
                if valid {
                    self.sign_in(site, &identity);
                    let target = self.resolve(site, &redirect);
                    self.navigate(site, &target)?;
                } else {
                    self.error = Some("Invalid username or password".to_string());
                }
                Ok(())
            }
            SubmitBehavior::Register { redirect } => {
                let created = !identity.is_empty() && !password.is_empty() && {
                    let mut accounts = site.accounts.lock();
                    if accounts.contains_key(&identity) {
                        false
                    } else {
                        accounts.insert(
                            identity.clone(),
                            MockAccount {
                                password: password.clone(),
                                role: "user".to_string(),
                            },
                        );
                        true
                    }
                };
                if created {
                    self.sign_in(site, &identity);
                    let target = self.resolve(site, &redirect);
                    self.navigate(site, &target)?;
                } else {
                    self.error = Some("Registration failed: please check the form".to_string());
                }
                Ok(())
            }
            SubmitBehavior::Form { success_url } => {
                let missing = fields
                    .iter()
                    .any(|(el, v)| el.required && v.as_deref().map_or(true, str::is_empty));
                if missing {
                    self.error = Some("Please fill out this field: this field is required".into());
                    return Ok(());
                }
                match success_url {
                    Some(url) => {
                        let target = self.resolve(site, &url);
                        self.navigate(site, &target)?;
                        self.notice = Some("Saved successfully".to_string());
                    }
                    None => self.notice = Some("Saved successfully".to_string()),
                }
                Ok(())
            }
        }
    }

    fn raw_elements(&self, site: &MockSite) -> Result<Vec<RawElement>> {
        let page = self.page()?;
        let nth = nth_of_type(&page.elements);
        Ok(page
            .elements
            .iter()
            .enumerate()
            .map(|(idx, el)| {
                let input_type = match el.tag.as_str() {
                    "input" => Some(el.input_type.clone().unwrap_or_else(|| "text".into())),
                    "button" => Some(el.input_type.clone().unwrap_or_else(|| "submit".into())),
                    _ => None,
                };
                RawElement {
                    tag: el.tag.clone(),
                    id: el.id.clone(),
                    name: el.name.clone(),
                    test_id: el.test_id.clone(),
                    test_attr: el.test_id.as_ref().map(|_| "data-testid".to_string()),
                    aria_label: el.aria_label.clone(),
                    placeholder: el.placeholder.clone(),
                    input_type,
                    text: el.text.clone(),
                    href: el.href.as_deref().map(|h| self.resolve(site, h)),
                    classes: el.classes.clone(),
                    css_path: format!("body > {}:nth-of-type({})", el.tag, nth[idx]),
                    form_index: el.form_index,
                    required: el.required,
                    visible: el.visible,
                    options: el.options.clone(),
                }
            })
            .collect())
    }

    fn text(&self) -> Result<String> {
        let page = self.page()?;
        let mut parts = vec![page.title.clone(), page.text.clone()];
        parts.extend(
            page.elements
                .iter()
                .filter(|e| e.visible)
                .filter_map(|e| e.text.clone()),
        );
        parts.extend(self.error.clone());
        parts.extend(self.notice.clone());
        Ok(parts
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

// =============================================================================
// BROWSER / SESSION
// =============================================================================

/// In-memory browser serving one [`MockSite`].
pub struct MockBrowser {
    site: Arc<MockSite>,
    closed: Arc<AtomicBool>,
    close_calls: AtomicUsize,
    sessions: AtomicUsize,
    sessions_closed: Arc<AtomicUsize>,
}

impl MockBrowser {
    pub fn new(site: Arc<MockSite>) -> Self {
        Self {
            site,
            closed: Arc::new(AtomicBool::new(false)),
            close_calls: AtomicUsize::new(0),
            sessions: AtomicUsize::new(0),
            sessions_closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many times `close` was called.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed.
    pub fn sessions_open(&self) -> usize {
        self.sessions_opened() - self.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn site(&self) -> &MockSite {
        &self.site
    }
}

#[async_trait]
impl Browser for MockBrowser {
    async fn new_session(&self, options: SessionOptions) -> Result<Arc<dyn PageSession>> {
        if self.is_closed() {
            bail!("Browser is closed");
        }
        let number = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("mock-session-{}", number);
        let video = options.record_video_dir.map(|dir| dir.join(&id));
        Ok(Arc::new(MockSession {
            id,
            site: Arc::clone(&self.site),
            browser_closed: Arc::clone(&self.closed),
            closed: AtomicBool::new(false),
            closed_count: Arc::clone(&self.sessions_closed),
            state: Mutex::new(SessionState::default()),
            video,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockSession {
    id: String,
    site: Arc<MockSite>,
    browser_closed: Arc<AtomicBool>,
    closed: AtomicBool,
    closed_count: Arc<AtomicUsize>,
    state: Mutex<SessionState>,
    video: Option<PathBuf>,
}

impl MockSession {
    fn live(&self) -> Result<()> {
        if self.browser_closed.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            bail!("Target closed");
        }
        Ok(())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SessionState, &MockSite) -> Result<T>) -> Result<T> {
        self.live()?;
        let mut state = self.state.lock();
        f(&mut state, &self.site)
    }
}

#[async_trait]
impl PageSession for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str) -> Result<NavigationResult> {
        self.with_state(|s, site| s.navigate(site, url))
    }

    async fn reload(&self) -> Result<NavigationResult> {
        self.with_state(|s, site| {
            let path = s.path.clone().unwrap_or_else(|| "/".to_string());
            s.navigate(site, &site.url(&path))
        })
    }

    async fn current_url(&self) -> Result<String> {
        self.with_state(|s, site| {
            Ok(s.path
                .as_deref()
                .map(|p| site.url(p))
                .unwrap_or_else(|| "about:blank".to_string()))
        })
    }

    async fn title(&self) -> Result<String> {
        self.with_state(|s, _| Ok(s.page.as_ref().map(|p| p.title.clone()).unwrap_or_default()))
    }

    async fn extract_elements(&self) -> Result<Vec<RawElement>> {
        self.with_state(|s, site| s.raw_elements(site))
    }

    async fn extract_links(&self) -> Result<Vec<String>> {
        let elements = self.extract_elements().await?;
        Ok(elements.into_iter().filter_map(|e| e.href).collect())
    }

    async fn page_text(&self) -> Result<String> {
        self.with_state(|s, _| s.text())
    }

    async fn is_visible(&self, locator: &str) -> Result<bool> {
        self.with_state(|s, _| Ok(s.is_visible(locator)))
    }

    async fn wait_for(&self, locator: &str, timeout: Duration) -> Result<()> {
        self.with_state(|s, _| {
            if s.is_visible(locator) {
                Ok(())
            } else {
                Err(anyhow!("Timed out after {:?} waiting for {}", timeout, locator))
            }
        })
    }

    async fn wait_idle(&self, _timeout: Duration) -> Result<()> {
        self.live()
    }

    async fn click(&self, locator: &str) -> Result<()> {
        self.with_state(|s, site| s.click(site, locator))
    }

    async fn fill(&self, locator: &str, value: &str) -> Result<()> {
        self.with_state(|s, _| s.fill(locator, value))
    }

    async fn select(&self, locator: &str, value: &str) -> Result<()> {
        self.with_state(|s, _| s.select(locator, value))
    }

    async fn set_checked(&self, locator: &str, checked: bool) -> Result<()> {
        self.with_state(|s, _| s.set_checked(locator, checked))
    }

    async fn press(&self, key: &str) -> Result<()> {
        self.with_state(|s, site| s.press(site, key))
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        self.live()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, b"mock-screenshot").await?;
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<SerializableCookie>> {
        self.with_state(|s, _| Ok(s.cookies.clone()))
    }

    async fn set_cookies(&self, cookies: &[SerializableCookie]) -> Result<()> {
        self.with_state(|s, _| {
            for cookie in cookies {
                s.cookies.retain(|c| c.name != cookie.name);
                s.cookies.push(cookie.clone());
            }
            Ok(())
        })
    }

    async fn local_storage(&self) -> Result<LocalStorageState> {
        self.with_state(|s, site| {
            Ok(LocalStorageState {
                origin: site.origin().to_string(),
                items: s.storage.clone(),
            })
        })
    }

    async fn set_local_storage(&self, state: &LocalStorageState) -> Result<()> {
        self.with_state(|s, _| {
            s.storage = state.items.clone();
            Ok(())
        })
    }

    async fn observed_requests(&self) -> Result<Vec<ObservedRequest>> {
        self.with_state(|s, _| Ok(s.requests.drain(..).collect()))
    }

    fn video_path(&self) -> Option<PathBuf> {
        self.video.clone()
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closed_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Launcher handing out [`MockBrowser`]s over a shared site.
pub struct MockLauncher {
    site: Arc<MockSite>,
    fail: bool,
    launched: Mutex<Vec<Arc<MockBrowser>>>,
}

impl MockLauncher {
    pub fn new(site: MockSite) -> Self {
        Self {
            site: Arc::new(site),
            fail: false,
            launched: Mutex::new(Vec::new()),
        }
    }

    /// A launcher whose every launch fails, as when Chrome is missing.
    pub fn failing(site: MockSite) -> Self {
        Self {
            fail: true,
            ..Self::new(site)
        }
    }

    /// Browsers launched so far.
    pub fn browsers(&self) -> Vec<Arc<MockBrowser>> {
        self.launched.lock().clone()
    }

    pub fn site(&self) -> &MockSite {
        &self.site
    }
}

#[async_trait]
impl BrowserLauncher for MockLauncher {
    async fn launch(&self, _options: &LaunchOptions) -> Result<Arc<dyn Browser>> {
        if self.fail {
            bail!("Chrome/Chromium not found");
        }
        let browser = Arc::new(MockBrowser::new(Arc::clone(&self.site)));
        self.launched.lock().push(Arc::clone(&browser));
        Ok(browser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> MockSite {
        MockSite::new("https://app.test")
            .page(
                MockPage::new("/", "Home")
                    .element(MockElement::link("About", "/about"))
                    .element(MockElement::button("Go").id("go").class("btn").navigates_to("/about")),
            )
            .page(MockPage::new("/about", "About"))
            .page(
                MockPage::new("/login", "Login")
                    .element(MockElement::form(0))
                    .element(MockElement::input("username", "text").id("username").in_form(0))
                    .element(MockElement::input("password", "password").id("password").in_form(0))
                    .element(MockElement::button("Sign in").in_form(0))
                    .on_submit(SubmitBehavior::Login {
                        redirect: "/dashboard".into(),
                    }),
            )
            .page(MockPage::new("/dashboard", "Dashboard").access(Access::Authenticated))
            .page(MockPage::new("/admin", "Admin").access(Access::Role("admin".into())))
            .login_page("/login")
            .account("alice", "secret", "user")
    }

    async fn session() -> Arc<dyn PageSession> {
        let browser = MockBrowser::new(Arc::new(site()));
        browser.new_session(SessionOptions::default()).await.unwrap()
    }

    #[test]
    fn test_compound_selector_matching() {
        let el = MockElement::button("Submit")
            .id("submit-btn")
            .class("primary")
            .test_id("submit");
        assert!(matches_locator(&el, 1, "#submit-btn"));
        assert!(matches_locator(&el, 1, "button.primary"));
        assert!(matches_locator(&el, 1, r#"[data-testid="submit"]"#));
        assert!(matches_locator(&el, 1, "form > button:nth-of-type(1)"));
        assert!(matches_locator(&el, 1, "text=  Submit "));
        assert!(!matches_locator(&el, 2, "button:nth-of-type(1)"));
        assert!(!matches_locator(&el, 1, "[name='submit-btn']"));
        assert!(!matches_locator(&el, 1, "xpath=//button"));
    }

    #[test]
    fn test_selector_list_and_quoted_spaces() {
        let el = MockElement::input("q", "text").placeholder("Search the site");
        assert!(matches_locator(&el, 1, r#"#nope, input[placeholder="Search the site"]"#));
    }

    #[tokio::test]
    async fn test_protected_page_redirects_to_login() {
        let s = session().await;
        let nav = s.navigate("https://app.test/dashboard").await.unwrap();
        assert_eq!(nav.url, "https://app.test/login");
        assert_eq!(nav.title, "Login");
    }

    #[tokio::test]
    async fn test_login_sets_cookie_and_redirects() {
        let s = session().await;
        s.navigate("https://app.test/login").await.unwrap();
        s.fill("#username", "alice").await.unwrap();
        s.fill("#password", "secret").await.unwrap();
        s.click("text=Sign in").await.unwrap();
        assert_eq!(s.current_url().await.unwrap(), "https://app.test/dashboard");
        assert_eq!(s.cookies().await.unwrap()[0].value, "alice");

        let nav = s.navigate("https://app.test/admin").await.unwrap();
        assert_eq!(nav.status, Some(403));
    }

    #[tokio::test]
    async fn test_wrong_password_shows_error() {
        let s = session().await;
        s.navigate("https://app.test/login").await.unwrap();
        s.fill("#username", "alice").await.unwrap();
        s.fill("#password", "nope").await.unwrap();
        s.press("Enter").await.unwrap();
        assert_eq!(s.current_url().await.unwrap(), "https://app.test/login");
        assert!(s.page_text().await.unwrap().contains("Invalid"));
        assert!(s.is_visible("[role=alert]").await.unwrap());
    }

    #[tokio::test]
    async fn test_links_are_absolute() {
        let s = session().await;
        s.navigate("https://app.test/").await.unwrap();
        let links = s.extract_links().await.unwrap();
        assert_eq!(links, vec!["https://app.test/about".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_browser_fails_sessions() {
        let browser = MockBrowser::new(Arc::new(site()));
        let s = browser.new_session(SessionOptions::default()).await.unwrap();
        browser.close().await.unwrap();
        assert!(s.navigate("https://app.test/").await.is_err());
        assert!(browser.new_session(SessionOptions::default()).await.is_err());
        assert_eq!(browser.close_calls(), 1);
    }
}
