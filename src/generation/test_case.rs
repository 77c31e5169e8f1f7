//! Generated test cases.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a generated test exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Navigation,
    FormPositive,
    FormNegative,
    Interaction,
    Api,
    EndToEnd,
    UserFlow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

/// A check evaluated against the current page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Assertion {
    /// Document loaded with a non-error status
    PageLoaded,
    TitleContains { expected: String },
    UrlContains { expected: String },
    ElementVisible { locator: String },
    TextVisible { expected: String },
    /// At least one of the locators is visible
    AnyVisible { locators: Vec<String> },
}

/// One action of a test. Each variant carries exactly what it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum TestStep {
    Navigate {
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    Click {
        locator: String,
        /// Logical element id for the alternate-locator registry
        #[serde(default, skip_serializing_if = "Option::is_none")]
        object_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Fill {
        locator: String,
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        object_id: Option<String>,
    },
    Select {
        locator: String,
        value: String,
    },
    Check {
        locator: String,
    },
    Uncheck {
        locator: String,
    },
    Press {
        key: String,
    },
    #[serde(rename_all = "camelCase")]
    Wait {
        duration_ms: u64,
    },
    WaitFor {
        locator: String,
    },
    Assert {
        assertion: Assertion,
    },
    #[serde(rename_all = "camelCase")]
    ApiRequest {
        method: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        expected_status: u16,
    },
    Comment {
        text: String,
    },
}

impl TestStep {
    /// Locator the step acts on, for steps that can be healed.
    pub fn healable_locator(&self) -> Option<&str> {
        match self {
            TestStep::Click { locator, .. }
            | TestStep::Fill { locator, .. }
            | TestStep::Select { locator, .. }
            | TestStep::Check { locator }
            | TestStep::Uncheck { locator } => Some(locator),
            _ => None,
        }
    }

    pub fn object_id(&self) -> Option<&str> {
        match self {
            TestStep::Click { object_id, .. } | TestStep::Fill { object_id, .. } => {
                object_id.as_deref()
            }
            _ => None,
        }
    }

    /// Same step acting on `locator` instead.
    pub fn with_locator(&self, new_locator: &str) -> TestStep {
        let mut step = self.clone();
        match &mut step {
            TestStep::Click { locator, .. }
            | TestStep::Fill { locator, .. }
            | TestStep::Select { locator, .. }
            | TestStep::Check { locator }
            | TestStep::Uncheck { locator } => *locator = new_locator.to_string(),
            _ => {}
        }
        step
    }

    /// Rough wall-clock cost, for duration estimates.
    pub fn estimated_ms(&self) -> u64 {
        match self {
            TestStep::Navigate { .. } => 1_500,
            TestStep::Wait { duration_ms } => *duration_ms,
            TestStep::WaitFor { .. } => 1_000,
            TestStep::ApiRequest { .. } => 500,
            TestStep::Comment { .. } => 0,
            _ => 300,
        }
    }
}

/// A generated test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedTest {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TestKind,
    pub priority: Priority,
    pub steps: Vec<TestStep>,
    pub estimated_duration_ms: u64,
}

impl GeneratedTest {
    pub fn new(name: impl Into<String>, kind: TestKind, priority: Priority, steps: Vec<TestStep>) -> Self {
        let estimated_duration_ms = steps.iter().map(TestStep::estimated_ms).sum();
        Self {
            id: format!("test-{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            kind,
            priority,
            steps,
            estimated_duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_wire_format() {
        let step = TestStep::Click {
            locator: "#go".into(),
            object_id: None,
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json, serde_json::json!({"action": "click", "locator": "#go"}));

        let step: TestStep = serde_json::from_str(
            r#"{"action": "apiRequest", "method": "POST", "url": "/api/users", "expectedStatus": 201}"#,
        )
        .unwrap();
        assert!(matches!(step, TestStep::ApiRequest { expected_status: 201, .. }));

        let step: TestStep = serde_json::from_str(
            r#"{"action": "assert", "assertion": {"type": "title_contains", "expected": "Home"}}"#,
        )
        .unwrap();
        assert!(matches!(step, TestStep::Assert { .. }));
    }

    #[test]
    fn test_with_locator_only_touches_element_steps() {
        let fill = TestStep::Fill {
            locator: "#a".into(),
            value: "x".into(),
            object_id: Some("email".into()),
        };
        assert_eq!(fill.with_locator("#b").healable_locator(), Some("#b"));
        assert_eq!(fill.object_id(), Some("email"));
        let nav = TestStep::Navigate { url: "/".into() };
        assert_eq!(nav.with_locator("#b"), nav);
        assert_eq!(nav.healable_locator(), None);
    }

    #[test]
    fn test_estimated_duration_sums_steps() {
        let test = GeneratedTest::new(
            "t",
            TestKind::Navigation,
            Priority::High,
            vec![
                TestStep::Navigate { url: "/".into() },
                TestStep::Wait { duration_ms: 200 },
            ],
        );
        assert_eq!(test.estimated_duration_ms, 1_700);
        assert!(test.id.starts_with("test-"));
    }
}
