//! Turns an application map into executable test cases.

pub mod test_case;
pub mod values;

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::config::GenerationLimits;
use crate::discovery::post_auth::ClassifiedPages;
use crate::discovery::url::{ends_session, path_of};
use crate::error::AutotestError;
use crate::llm::{extract_json, CompletionOptions, LlmProvider};
use crate::models::{
    ApiEndpoint, ApiMap, ApplicationMap, ElementInfo, ElementKind, EndpointSource, FlowKind,
    PageInfo, UserFlow, WebsiteMap,
};

pub use test_case::{Assertion, GeneratedTest, Priority, TestKind, TestStep};
use values::{body_from_schema, sample_value, FieldValue, ERROR_INDICATORS};

/// Idle pause inserted after a form submit.
const SUBMIT_SETTLE_MS: u64 = 1_000;

/// Logical element id used by the alternate-locator registry.
pub fn object_id(page_url: &str, el: &ElementInfo) -> String {
    format!("{}::{}", page_url, el.locator)
}

/// Expected status of a successful call, by method.
pub fn expected_status(method: &str) -> u16 {
    match method.to_uppercase().as_str() {
        "POST" => 201,
        "DELETE" => 204,
        _ => 200,
    }
}

/// Replace `{param}` path segments with a sample id.
fn concrete_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if seg.starts_with('{') && seg.ends_with('}') {
                "1"
            } else {
                seg
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn signs_out(el: &ElementInfo) -> bool {
    el.href.as_deref().is_some_and(ends_session)
        || el.text.as_deref().is_some_and(ends_session)
        || ends_session(&el.locator)
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn submit_control<'a>(page: &'a PageInfo, form: Option<usize>) -> Option<&'a ElementInfo> {
    page.elements
        .iter()
        .find(|e| e.kind == ElementKind::Button && e.is_submit() && e.form_index == form)
}

/// Click the submit control, or press Enter inside the form.
fn submit_steps(page: &PageInfo, form: Option<usize>, steps: &mut Vec<TestStep>) {
    match submit_control(page, form) {
        Some(button) => steps.push(TestStep::Click {
            locator: button.locator.clone(),
            object_id: Some(object_id(&page.url, button)),
        }),
        None => steps.push(TestStep::Press {
            key: "Enter".to_string(),
        }),
    }
    steps.push(TestStep::Wait {
        duration_ms: SUBMIT_SETTLE_MS,
    });
}

fn fill_step(page: &PageInfo, el: &ElementInfo, value: FieldValue) -> Option<TestStep> {
    let step = match value {
        FieldValue::Text(value) => TestStep::Fill {
            locator: el.locator.clone(),
            value,
            object_id: Some(object_id(&page.url, el)),
        },
        FieldValue::Choice(value) => TestStep::Select {
            locator: el.locator.clone(),
            value,
        },
        FieldValue::Check => TestStep::Check {
            locator: el.locator.clone(),
        },
        FieldValue::Skip => return None,
    };
    Some(step)
}

/// Generates tests from discovery output.
///
/// Generation never fails: the LLM collaborator is optional and every use of
/// it has a deterministic fallback.
pub struct TestGenerator {
    limits: GenerationLimits,
    llm: Option<Arc<dyn LlmProvider>>,
    focus: ClassifiedPages,
}

impl TestGenerator {
    pub fn new(limits: GenerationLimits) -> Self {
        Self {
            limits,
            llm: None,
            focus: ClassifiedPages::default(),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Raise priority of forms on state-changing pages.
    pub fn with_focus(mut self, focus: ClassifiedPages) -> Self {
        self.focus = focus;
        self
    }

    pub async fn generate(&self, map: &ApplicationMap) -> Vec<GeneratedTest> {
        let mut tests = Vec::new();
        if let Some(website) = &map.website {
            tests.extend(self.navigation_tests(website));
            tests.extend(self.form_tests(website));
            tests.extend(self.interaction_tests(website));
            tests.extend(self.user_flow_tests(website).await);
        }
        if let Some(api) = &map.api {
            tests.extend(self.api_tests(api));
        }
        if let (Some(website), Some(api)) = (&map.website, &map.api) {
            tests.extend(self.end_to_end_tests(website, api));
        }
        tracing::info!("Generated {} tests", tests.len());
        tests
    }

    /// Load-and-title smoke test per page, bounded.
    pub fn navigation_tests(&self, website: &WebsiteMap) -> Vec<GeneratedTest> {
        website
            .pages
            .iter()
            .filter(|p| p.status.map_or(true, |s| s < 400))
            .take(self.limits.max_navigation_tests)
            .map(|page| {
                let mut steps = vec![
                    TestStep::Navigate {
                        url: page.url.clone(),
                    },
                    TestStep::Assert {
                        assertion: Assertion::PageLoaded,
                    },
                ];
                if !page.title.trim().is_empty() {
                    steps.push(TestStep::Assert {
                        assertion: Assertion::TitleContains {
                            expected: page.title.trim().to_string(),
                        },
                    });
                }
                let priority = if page.depth == 0 {
                    Priority::Critical
                } else {
                    Priority::Medium
                };
                GeneratedTest::new(
                    format!("Navigate to {}", path_of(&page.url)),
                    TestKind::Navigation,
                    priority,
                    steps,
                )
            })
            .collect()
    }

    /// Positive and negative test per form.
    pub fn form_tests(&self, website: &WebsiteMap) -> Vec<GeneratedTest> {
        let focus: HashSet<&String> = self.focus.state_changing().collect();
        let mut tests = Vec::new();
        for page in website.pages.iter().filter(|p| p.has_form()) {
            let forms = page.form_indexes();
            let forms: Vec<Option<usize>> = if forms.is_empty() {
                vec![None]
            } else {
                forms.into_iter().map(Some).collect()
            };
            let path = path_of(&page.url);
            let positive_priority = if focus.contains(&page.url) {
                Priority::Critical
            } else {
                Priority::High
            };

            for form in forms {
                let fields: Vec<&ElementInfo> = page
                    .fields()
                    .filter(|e| form.is_none() || e.form_index == form)
                    .collect();
                if fields.is_empty() {
                    continue;
                }
                let suffix = match form {
                    Some(idx) if idx > 0 => format!(" (form {})", idx + 1),
                    _ => String::new(),
                };

                let mut steps = vec![TestStep::Navigate {
                    url: page.url.clone(),
                }];
                steps.extend(
                    fields
                        .iter()
                        .filter_map(|el| fill_step(page, el, sample_value(el))),
                );
                submit_steps(page, form, &mut steps);
                steps.push(TestStep::Assert {
                    assertion: Assertion::PageLoaded,
                });
                tests.push(GeneratedTest::new(
                    format!("Submit form on {}{} with valid data", path, suffix),
                    TestKind::FormPositive,
                    positive_priority,
                    steps,
                ));

                let mut steps = vec![TestStep::Navigate {
                    url: page.url.clone(),
                }];
                if submit_control(page, form).is_none() {
                    // Enter only submits from inside the form
                    if let Some(first) = fields.iter().find(|e| e.kind != ElementKind::Select) {
                        steps.push(TestStep::Fill {
                            locator: first.locator.clone(),
                            value: String::new(),
                            object_id: Some(object_id(&page.url, first)),
                        });
                    }
                }
                submit_steps(page, form, &mut steps);
                steps.push(TestStep::Assert {
                    assertion: Assertion::AnyVisible {
                        locators: ERROR_INDICATORS.iter().map(|s| s.to_string()).collect(),
                    },
                });
                tests.push(GeneratedTest::new(
                    format!("Submit empty form on {}{} shows validation", path, suffix),
                    TestKind::FormNegative,
                    Priority::Medium,
                    steps,
                ));
            }
        }
        tests
    }

    /// Click tests for links and non-submit buttons, bounded and deduplicated.
    /// Logout controls are left out: they would sign out the rest of the batch.
    pub fn interaction_tests(&self, website: &WebsiteMap) -> Vec<GeneratedTest> {
        let mut seen = HashSet::new();
        let mut tests = Vec::new();
        for page in &website.pages {
            for el in page
                .elements
                .iter()
                .filter(|e| e.kind.is_clickable() && !e.is_submit() && !signs_out(e))
            {
                if tests.len() >= self.limits.max_interaction_tests {
                    return tests;
                }
                let key = (el.locator.clone(), el.href.clone());
                if !seen.insert(key) {
                    continue;
                }
                let label = el
                    .text
                    .as_deref()
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or(&el.locator);
                let mut steps = vec![
                    TestStep::Navigate {
                        url: page.url.clone(),
                    },
                    TestStep::Click {
                        locator: el.locator.clone(),
                        object_id: Some(object_id(&page.url, el)),
                    },
                    TestStep::Assert {
                        assertion: Assertion::PageLoaded,
                    },
                ];
                if let Some(href) = el.href.as_deref().filter(|h| website.has_page(h)) {
                    steps.push(TestStep::Assert {
                        assertion: Assertion::UrlContains {
                            expected: path_of(href),
                        },
                    });
                }
                tests.push(GeneratedTest::new(
                    format!("Click '{}' on {}", label.trim(), path_of(&page.url)),
                    TestKind::Interaction,
                    Priority::Low,
                    steps,
                ));
            }
        }
        tests
    }

    /// One request per endpoint. Specified endpoints go first, guesses last.
    pub fn api_tests(&self, api: &ApiMap) -> Vec<GeneratedTest> {
        let rank = |ep: &ApiEndpoint| match ep.source {
            EndpointSource::Specification => 0,
            EndpointSource::Observed => 1,
            EndpointSource::Guessed => 2,
        };
        let mut endpoints: Vec<&ApiEndpoint> = api.endpoints.iter().collect();
        endpoints.sort_by_key(|ep| rank(ep));

        endpoints
            .into_iter()
            .take(self.limits.max_api_tests)
            .map(|ep| {
                let method = ep.method.to_uppercase();
                let body = matches!(method.as_str(), "POST" | "PUT" | "PATCH")
                    .then(|| body_from_schema(ep.request_body.as_ref()));
                let priority = match (ep.source, method.as_str()) {
                    (EndpointSource::Guessed, _) => Priority::Low,
                    (_, "GET") => Priority::High,
                    _ => Priority::Medium,
                };
                GeneratedTest::new(
                    format!("{} {}", method, ep.path),
                    TestKind::Api,
                    priority,
                    vec![TestStep::ApiRequest {
                        url: join_url(&api.base_url, &concrete_path(&ep.path)),
                        expected_status: expected_status(&method),
                        method,
                        body,
                    }],
                )
            })
            .collect()
    }

    /// Submit a form, then read back the API collection it names.
    pub fn end_to_end_tests(&self, website: &WebsiteMap, api: &ApiMap) -> Vec<GeneratedTest> {
        let mut tests = Vec::new();
        for page in website.pages.iter().filter(|p| p.has_form()) {
            let path = path_of(&page.url).to_lowercase();
            let Some(endpoint) = api.endpoints.iter().find(|ep| {
                ep.method == "POST"
                    && ep.source != EndpointSource::Guessed
                    && resource_of(&ep.path).is_some_and(|r| path.contains(&r))
            }) else {
                continue;
            };

            let form = page.form_indexes().first().copied();
            let mut steps = vec![TestStep::Navigate {
                url: page.url.clone(),
            }];
            steps.extend(
                page.fields()
                    .filter(|e| form.is_none() || e.form_index == form)
                    .filter_map(|el| fill_step(page, el, sample_value(el))),
            );
            submit_steps(page, form, &mut steps);
            steps.push(TestStep::ApiRequest {
                method: "GET".to_string(),
                url: join_url(&api.base_url, &endpoint.path),
                body: None,
                expected_status: 200,
            });
            tests.push(GeneratedTest::new(
                format!("Form on {} persists via {}", path_of(&page.url), endpoint.path),
                TestKind::EndToEnd,
                Priority::High,
                steps,
            ));
        }
        tests
    }

    /// Flow tests from the LLM, or comment-only templates.
    pub async fn user_flow_tests(&self, website: &WebsiteMap) -> Vec<GeneratedTest> {
        let mut tests = Vec::new();
        for flow in website.user_flows.iter().take(self.limits.max_flow_tests) {
            let steps = match self.llm_flow_steps(flow, website).await {
                Ok(steps) => steps,
                Err(e) => {
                    if self.llm.is_some() {
                        tracing::warn!("Falling back to template for '{}': {}", flow.name, e);
                    }
                    template_flow_steps(flow)
                }
            };
            let priority = match flow.kind {
                FlowKind::Login | FlowKind::Checkout | FlowKind::Registration => Priority::Critical,
                _ => Priority::High,
            };
            tests.push(GeneratedTest::new(
                format!("User flow: {}", flow.name),
                TestKind::UserFlow,
                priority,
                steps,
            ));
        }
        tests
    }

    async fn llm_flow_steps(
        &self,
        flow: &UserFlow,
        website: &WebsiteMap,
    ) -> Result<Vec<TestStep>, AutotestError> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| AutotestError::Generation("no LLM configured".into()))?;
        let prompt = flow_prompt(flow, website);
        let reply = llm
            .complete(&prompt, &CompletionOptions::default())
            .await
            .map_err(|e| AutotestError::Generation(e.to_string()))?;
        parse_flow_steps(&reply)
    }
}

/// Resource noun of an API path: `/api/v1/products/{id}` -> `product`.
fn resource_of(path: &str) -> Option<String> {
    path.split('/')
        .filter(|s| !s.is_empty() && !s.starts_with('{'))
        .filter(|s| !matches!(*s, "api" | "v1" | "v2" | "v3"))
        .last()
        .map(|s| s.trim_end_matches('s').to_lowercase())
        .filter(|s| s.len() > 2)
}

fn template_flow_steps(flow: &UserFlow) -> Vec<TestStep> {
    let mut steps = vec![TestStep::Comment {
        text: format!("{} ({:?})", flow.name, flow.kind),
    }];
    steps.extend(flow.pages.iter().enumerate().map(|(i, url)| TestStep::Comment {
        text: format!("Step {}: visit {}", i + 1, url),
    }));
    steps
}

fn flow_prompt(flow: &UserFlow, website: &WebsiteMap) -> String {
    let mut pages = String::new();
    for url in &flow.pages {
        let Some(page) = website.page(url) else {
            continue;
        };
        pages.push_str(&format!("- {} \"{}\"\n", page.url, page.title));
        for el in page.elements.iter().filter(|e| e.kind != ElementKind::Form) {
            pages.push_str(&format!(
                "    {:?} locator={} {}\n",
                el.kind,
                el.locator,
                el.descriptor()
            ));
        }
    }
    format!(
        r#"You write end-to-end browser tests.

Flow: {} ({:?})
Pages and their elements:
{}
Write the steps a user takes to complete this flow. Use only the locators listed.
Each step is one JSON object with an "action" field:
  {{"action":"navigate","url":"..."}}
  {{"action":"click","locator":"..."}}
  {{"action":"fill","locator":"...","value":"..."}}
  {{"action":"select","locator":"...","value":"..."}}
  {{"action":"wait","durationMs":1000}}
  {{"action":"assert","assertion":{{"type":"url_contains","expected":"..."}}}}

Respond with ONLY a JSON array of steps, no explanation."#,
        flow.name, flow.kind, pages
    )
}

/// Parse an LLM reply into steps. Empty or malformed output is an error.
pub fn parse_flow_steps(reply: &str) -> Result<Vec<TestStep>, AutotestError> {
    let json = extract_json(reply)
        .ok_or_else(|| AutotestError::Generation("no JSON in reply".into()))?;
    let value: Value = serde_json::from_str(json)
        .map_err(|e| AutotestError::Generation(format!("unparsable reply: {}", e)))?;
    // Accept a bare array or {"steps": [...]}
    let array = match value {
        Value::Array(_) => value,
        Value::Object(mut obj) => obj
            .remove("steps")
            .ok_or_else(|| AutotestError::Generation("reply has no steps".into()))?,
        _ => return Err(AutotestError::Generation("reply is not a step list".into())),
    };
    let steps: Vec<TestStep> = serde_json::from_value(array)
        .map_err(|e| AutotestError::Generation(format!("invalid steps: {}", e)))?;
    if steps.is_empty() {
        return Err(AutotestError::Generation("reply has no steps".into()));
    }
    Ok(steps)
}
