//! HTTP API surface discovery.
//!
//! Three sources, merged by `METHOD:path` in this order: published OpenAPI /
//! Swagger documents, requests observed while pages load, and conventional
//! CRUD guesses. A later source only fills gaps of an endpoint already known.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::browser::PageSession;
use crate::models::{ApiEndpoint, ApiMap, ApiParameter, AuthType, EndpointSource, ObservedRequest};

/// Where API descriptions are conventionally published.
pub const SPEC_PATHS: &[&str] = &[
    "/swagger.json",
    "/openapi.json",
    "/api-docs",
    "/v2/api-docs",
    "/v3/api-docs",
    "/swagger/v1/swagger.json",
    "/api/swagger.json",
    "/api/openapi.json",
    "/docs/openapi.json",
];

const RESOURCE_NOUNS: &[&str] = &[
    "users",
    "products",
    "orders",
    "items",
    "posts",
    "comments",
    "categories",
    "customers",
];

const HTTP_METHODS: &[&str] = &["get", "post", "put", "patch", "delete", "head", "options"];

const AUTH_MARKERS: &[&str] = &["login", "auth", "token", "session", "oauth"];

/// Discovers endpoints of an HTTP API.
pub struct ApiCrawler {
    client: reqwest::Client,
}

impl ApiCrawler {
    pub fn new(probe_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Run all three techniques against `base_url`.
    ///
    /// `observed` are requests captured while pages of the website loaded.
    pub async fn discover(&self, base_url: &str, observed: &[ObservedRequest]) -> ApiMap {
        let base = base_url.trim_end_matches('/').to_string();

        let mut endpoints = Vec::new();
        match self.probe_specification(&base).await {
            Some((path, found)) => {
                tracing::info!("Found API description at {}{} ({} operations)", base, path, found.len());
                merge_endpoints(&mut endpoints, found);
            }
            None => tracing::debug!("No API description published under {}", base),
        }

        let passive = endpoints_from_requests(observed);
        tracing::debug!("Observed {} API requests", passive.len());
        merge_endpoints(&mut endpoints, passive);
        merge_endpoints(&mut endpoints, crud_guesses());

        let authentication = infer_auth(&endpoints);
        tracing::info!(
            "API discovery: {} endpoints, authentication {:?}",
            endpoints.len(),
            authentication
        );

        ApiMap {
            base_url: base,
            endpoints,
            authentication,
        }
    }

    /// Try each conventional path until one returns an OpenAPI/Swagger document.
    async fn probe_specification(&self, base: &str) -> Option<(&'static str, Vec<ApiEndpoint>)> {
        for path in SPEC_PATHS {
            let url = format!("{}{}", base, path);
            let response = match self.client.get(&url).send().await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    tracing::debug!("{} -> {}", url, r.status());
                    continue;
                }
                Err(e) => {
                    tracing::debug!("{} unreachable: {}", url, e);
                    continue;
                }
            };
            let Ok(doc) = response.json::<Value>().await else {
                continue;
            };
            let endpoints = parse_openapi(&doc);
            if !endpoints.is_empty() {
                return Some((*path, endpoints));
            }
        }
        None
    }
}

/// Load `url` in `session` and return the requests it issued.
pub async fn observe_page(
    session: &dyn PageSession,
    url: &str,
    idle_wait: Duration,
) -> anyhow::Result<Vec<ObservedRequest>> {
    let _ = session.observed_requests().await?;
    session.navigate(url).await?;
    let _ = session.wait_idle(idle_wait).await;
    session.observed_requests().await
}

/// Operations of an OpenAPI 3 or Swagger 2 document.
pub fn parse_openapi(doc: &Value) -> Vec<ApiEndpoint> {
    let Some(paths) = doc.get("paths").and_then(Value::as_object) else {
        return Vec::new();
    };
    let base_path = doc
        .get("basePath")
        .and_then(Value::as_str)
        .map(|p| p.trim_end_matches('/'))
        .unwrap_or("");

    let mut endpoints = Vec::new();
    for (path, item) in paths {
        let shared = item.get("parameters");
        for method in HTTP_METHODS {
            let Some(op) = item.get(*method) else {
                continue;
            };
            let full_path = format!("{}{}", base_path, path);
            let mut endpoint =
                ApiEndpoint::new(method, &full_path, EndpointSource::Specification);

            let mut body_schema = None;
            for param in shared
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .chain(op.get("parameters").and_then(Value::as_array).into_iter().flatten())
            {
                let Some(name) = param.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let location = param.get("in").and_then(Value::as_str).unwrap_or("query");
                if location == "body" {
                    body_schema = param.get("schema").cloned();
                }
                endpoint.parameters.push(ApiParameter {
                    name: name.to_string(),
                    location: location.to_string(),
                    required: param.get("required").and_then(Value::as_bool).unwrap_or(false),
                });
            }

            endpoint.request_body = op
                .get("requestBody")
                .and_then(|rb| rb.get("content"))
                .and_then(content_schema)
                .or(body_schema);
            endpoint.response_schema = success_response_schema(op);
            endpoints.push(endpoint);
        }
    }
    endpoints
}

/// Schema of the JSON media type, or of the first media type listed.
fn content_schema(content: &Value) -> Option<Value> {
    let content = content.as_object()?;
    content
        .get("application/json")
        .or_else(|| content.values().next())
        .and_then(|media| media.get("schema"))
        .cloned()
}

fn success_response_schema(op: &Value) -> Option<Value> {
    let responses = op.get("responses")?.as_object()?;
    let mut codes: Vec<&String> = responses.keys().filter(|k| k.starts_with('2')).collect();
    codes.sort();
    let response = responses.get(codes.first()?.as_str())?;
    response
        .get("content")
        .and_then(content_schema)
        .or_else(|| response.get("schema").cloned())
}

/// Endpoints from XHR/fetch traffic, with id-like path segments templated.
pub fn endpoints_from_requests(requests: &[ObservedRequest]) -> Vec<ApiEndpoint> {
    let mut endpoints: Vec<ApiEndpoint> = Vec::new();
    for request in requests {
        if !matches!(request.resource_type.as_str(), "xhr" | "fetch") {
            continue;
        }
        let Ok(url) = url::Url::parse(&request.url) else {
            continue;
        };
        let path = template_path(url.path());
        let mut endpoint = ApiEndpoint::new(&request.method, &path, EndpointSource::Observed);
        if path.contains("{id}") {
            endpoint.parameters.push(ApiParameter {
                name: "id".to_string(),
                location: "path".to_string(),
                required: true,
            });
        }
        for (name, _) in url.query_pairs() {
            endpoint.parameters.push(ApiParameter {
                name: name.into_owned(),
                location: "query".to_string(),
                required: false,
            });
        }
        endpoint.request_body = request
            .post_data
            .as_deref()
            .and_then(|body| serde_json::from_str::<Value>(body).ok());
        merge_endpoints(&mut endpoints, vec![endpoint]);
    }
    endpoints
}

/// Replace numeric and uuid-like segments with `{id}`.
fn template_path(path: &str) -> String {
    let segments: Vec<String> = path
        .split('/')
        .map(|seg| {
            let numeric = !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit());
            let uuid_like = seg.len() == 36 && uuid::Uuid::parse_str(seg).is_ok();
            if numeric || uuid_like {
                "{id}".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect();
    let joined = segments.join("/");
    if joined.len() > 1 {
        joined.trim_end_matches('/').to_string()
    } else {
        joined
    }
}

/// Conventional CRUD routes for common resources plus auth routes.
pub fn crud_guesses() -> Vec<ApiEndpoint> {
    let mut guesses = Vec::new();
    for noun in RESOURCE_NOUNS {
        let collection = format!("/api/{}", noun);
        let member = format!("/api/{}/{{id}}", noun);
        guesses.push(ApiEndpoint::new("GET", &collection, EndpointSource::Guessed));
        guesses.push(ApiEndpoint::new("POST", &collection, EndpointSource::Guessed));
        for method in ["GET", "PUT", "DELETE"] {
            let mut endpoint = ApiEndpoint::new(method, &member, EndpointSource::Guessed);
            endpoint.parameters.push(ApiParameter {
                name: "id".to_string(),
                location: "path".to_string(),
                required: true,
            });
            guesses.push(endpoint);
        }
    }
    for (method, path) in [
        ("POST", "/api/auth/login"),
        ("POST", "/api/auth/register"),
        ("POST", "/api/auth/logout"),
        ("GET", "/api/auth/me"),
    ] {
        guesses.push(ApiEndpoint::new(method, path, EndpointSource::Guessed));
    }
    guesses
}

/// Merge `incoming` into `endpoints` by `METHOD:path`.
///
/// Known endpoints keep their source; missing bodies, schemas and parameters
/// are filled from the incoming duplicate.
pub fn merge_endpoints(endpoints: &mut Vec<ApiEndpoint>, incoming: Vec<ApiEndpoint>) {
    let mut index: HashMap<String, usize> = endpoints
        .iter()
        .enumerate()
        .map(|(i, e)| (e.key(), i))
        .collect();

    for endpoint in incoming {
        match index.get(&endpoint.key()) {
            Some(&i) => {
                let existing = &mut endpoints[i];
                if existing.request_body.is_none() {
                    existing.request_body = endpoint.request_body;
                }
                if existing.response_schema.is_none() {
                    existing.response_schema = endpoint.response_schema;
                }
                for param in endpoint.parameters {
                    if !existing.parameters.iter().any(|p| p.name == param.name && p.location == param.location) {
                        existing.parameters.push(param);
                    }
                }
            }
            None => {
                index.insert(endpoint.key(), endpoints.len());
                endpoints.push(endpoint);
            }
        }
    }
}

/// Bearer when a published or observed endpoint looks auth-related.
///
/// This is narrower than "any discovered auth-like endpoint": the guess set
/// always contains `/api/auth/*`, so counting guesses would make every API
/// Bearer. Guessed routes are therefore ignored here.
pub fn infer_auth(endpoints: &[ApiEndpoint]) -> AuthType {
    let found = endpoints
        .iter()
        .filter(|e| e.source != EndpointSource::Guessed)
        .any(|e| {
            let path = e.path.to_lowercase();
            AUTH_MARKERS.iter().any(|m| path.contains(m))
        });
    if found {
        AuthType::Bearer
    } else {
        AuthType::None
    }
}
