//! Data models shared by discovery, generation and execution.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use chromiumoxide::cdp::browser_protocol::network::CookieSameSite;

// =============================================================================
// PAGE MODEL
// =============================================================================

/// Kind of interactive element found on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Input,
    Button,
    Link,
    Form,
    Textarea,
    Select,
}

impl ElementKind {
    /// Map a lower-case HTML tag (plus input type) to an element kind.
    pub fn from_tag(tag: &str, input_type: Option<&str>) -> Option<Self> {
        match tag {
            "input" => match input_type {
                Some("submit") | Some("button") | Some("reset") | Some("image") => {
                    Some(ElementKind::Button)
                }
                Some("hidden") => None,
                _ => Some(ElementKind::Input),
            },
            "button" => Some(ElementKind::Button),
            "a" => Some(ElementKind::Link),
            "form" => Some(ElementKind::Form),
            "textarea" => Some(ElementKind::Textarea),
            "select" => Some(ElementKind::Select),
            _ => None,
        }
    }

    /// Whether values can be typed or chosen into this element.
    pub fn is_field(&self) -> bool {
        matches!(
            self,
            ElementKind::Input | ElementKind::Textarea | ElementKind::Select
        )
    }

    /// Whether the element is something a user clicks.
    pub fn is_clickable(&self) -> bool {
        matches!(self, ElementKind::Button | ElementKind::Link)
    }
}

/// An interactive element discovered on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementInfo {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    /// Stable locator derived at crawl time
    pub locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    /// Index of the owning `<form>` on the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_index: Option<usize>,
    #[serde(default)]
    pub required: bool,
    /// Option values for `<select>` elements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl ElementInfo {
    pub fn new(kind: ElementKind, locator: impl Into<String>) -> Self {
        Self {
            kind,
            locator: locator.into(),
            id: None,
            name: None,
            placeholder: None,
            text: None,
            input_type: None,
            href: None,
            form_index: None,
            required: false,
            options: Vec::new(),
        }
    }

    /// Lower-cased concatenation of the identifying attributes, used by
    /// keyword heuristics.
    pub fn descriptor(&self) -> String {
        [
            self.id.as_deref(),
            self.name.as_deref(),
            self.placeholder.as_deref(),
            self.text.as_deref(),
        ]
        .iter()
        .flatten()
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
    }

    pub fn is_password(&self) -> bool {
        self.input_type.as_deref() == Some("password")
    }

    /// Submit-like control: submit inputs and buttons inside a form.
    pub fn is_submit(&self) -> bool {
        match self.kind {
            ElementKind::Button => {
                matches!(self.input_type.as_deref(), Some("submit") | None)
                    && self.form_index.is_some()
            }
            _ => false,
        }
    }
}

/// A single crawled page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// Normalized URL (page identity)
    pub url: String,
    pub title: String,
    pub elements: Vec<ElementInfo>,
    /// Link hops from the crawl start
    #[serde(default)]
    pub depth: usize,
    /// HTTP status of the document, when the browser reported one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl PageInfo {
    pub fn has_form(&self) -> bool {
        self.elements.iter().any(|e| e.kind == ElementKind::Form)
            || self.elements.iter().any(|e| e.form_index.is_some())
    }

    pub fn fields(&self) -> impl Iterator<Item = &ElementInfo> {
        self.elements.iter().filter(|e| e.kind.is_field())
    }

    pub fn has_password_field(&self) -> bool {
        self.elements.iter().any(|e| e.is_password())
    }

    /// Distinct form indexes in document order.
    pub fn form_indexes(&self) -> Vec<usize> {
        let mut indexes: Vec<usize> = Vec::new();
        for idx in self.elements.iter().filter_map(|e| e.form_index) {
            if !indexes.contains(&idx) {
                indexes.push(idx);
            }
        }
        indexes
    }
}

/// Classification of a heuristically detected user flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Login,
    Registration,
    Checkout,
    Search,
    Contact,
    MultiStepForm,
}

/// A multi-page interaction sequence worth testing as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFlow {
    pub name: String,
    pub kind: FlowKind,
    /// Page URLs in the order a user visits them
    pub pages: Vec<String>,
}

/// How an interaction changes the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Navigate,
    Click,
    Submit,
}

/// An observed or inferred interaction between a page element and a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub page_url: String,
    pub locator: String,
    pub kind: InteractionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

/// Everything the website crawler discovered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteMap {
    pub pages: Vec<PageInfo>,
    pub user_flows: Vec<UserFlow>,
    pub interactions: Vec<Interaction>,
}

impl WebsiteMap {
    pub fn page(&self, url: &str) -> Option<&PageInfo> {
        self.pages.iter().find(|p| p.url == url)
    }

    pub fn has_page(&self, url: &str) -> bool {
        self.page(url).is_some()
    }

    /// Add pages, flows and interactions from `other` that are not already present.
    pub fn merge(&mut self, other: WebsiteMap) {
        for page in other.pages {
            if !self.has_page(&page.url) {
                self.pages.push(page);
            }
        }
        for flow in other.user_flows {
            if !self.user_flows.contains(&flow) {
                self.user_flows.push(flow);
            }
        }
        for interaction in other.interactions {
            if !self.interactions.contains(&interaction) {
                self.interactions.push(interaction);
            }
        }
    }
}

// =============================================================================
// API MODEL
// =============================================================================

/// Where an endpoint was first learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointSource {
    Specification,
    Observed,
    Guessed,
}

/// A parameter accepted by an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiParameter {
    pub name: String,
    /// path / query / header / body
    pub location: String,
    #[serde(default)]
    pub required: bool,
}

/// A discovered HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    pub path: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ApiParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
    pub source: EndpointSource,
}

impl ApiEndpoint {
    pub fn new(method: &str, path: &str, source: EndpointSource) -> Self {
        Self {
            path: path.to_string(),
            method: method.to_uppercase(),
            parameters: Vec::new(),
            request_body: None,
            response_schema: None,
            source,
        }
    }

    /// Deduplication key: `METHOD:path`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.method.to_uppercase(), self.path)
    }
}

/// Authentication scheme inferred for an API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    Bearer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMap {
    pub base_url: String,
    pub endpoints: Vec<ApiEndpoint>,
    pub authentication: AuthType,
}

/// Combined discovery output handed to test generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<WebsiteMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiMap>,
}

// =============================================================================
// BROWSER STATE
// =============================================================================

/// Raw element as extracted from the live DOM, before locator derivation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawElement {
    /// Lower-case tag name
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub test_id: Option<String>,
    /// Which attribute carried `test_id` (`data-testid`, `data-test`, `data-cy`)
    #[serde(default)]
    pub test_attr: Option<String>,
    #[serde(default)]
    pub aria_label: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    /// Structural `tag:nth-of-type(n)` path from `body`
    #[serde(default)]
    pub css_path: String,
    #[serde(default)]
    pub form_index: Option<usize>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Navigation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationResult {
    /// Final URL after navigation
    pub url: String,
    /// Page title
    pub title: String,
    /// HTTP status code
    #[serde(default)]
    pub status: Option<u16>,
}

/// A request the page issued while it was observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedRequest {
    pub method: String,
    pub url: String,
    /// xhr / fetch / document / script ...
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub post_data: Option<String>,
}

/// Serializable cookie for auth state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub same_site: Option<CookieSameSite>,
}

/// Local storage snapshot for a single origin.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LocalStorageState {
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub items: HashMap<String, String>,
}

/// Auth state snapshot with cookies and localStorage.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AuthState {
    #[serde(default)]
    pub cookies: Vec<SerializableCookie>,
    #[serde(default)]
    pub local_storage: LocalStorageState,
    #[serde(default)]
    pub saved_at: String,
}

impl AuthState {
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.local_storage.items.is_empty()
    }
}
