//! Alternate-locator fallback.

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};

use crate::browser::PageSession;
use crate::discovery::locator::attribute_selector;

use super::registry::{LocatorRegistry, RegisteredLocator};
use super::{HealingContext, HealingResult, HealingStrategy};

/// Confidence of an alternate derived from the locator's shape.
pub const DERIVED_CONFIDENCE: f64 = 0.75;

const REGISTRY_FLOOR: f64 = 0.7;
const REGISTRY_CEILING: f64 = 0.99;

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#([A-Za-z_][\w-]*)$").expect("invalid id regex"));
static CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\.([A-Za-z_][\w-]*)$").expect("invalid class regex"));
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\[(name|data-testid)\s*=\s*["']?([^"'\]]+)["']?\]$"#)
        .expect("invalid attribute regex")
});

/// Alternates implied by the shape of `locator`, in trial order.
///
/// `#x`, `.x`, `[name="x"]` and `[data-testid="x"]` map onto each other;
/// `text=X` yields whitespace and case variants.
pub fn shape_alternatives(locator: &str) -> Vec<String> {
    let locator = locator.trim();
    let id = |v: &str| format!("#{}", v);
    let class = |v: &str| format!(".{}", v);
    let name = |v: &str| attribute_selector("name", v);
    let test_id = |v: &str| attribute_selector("data-testid", v);

    let mut alternatives = if let Some(caps) = ID_RE.captures(locator) {
        let v = &caps[1];
        vec![name(v), class(v), test_id(v)]
    } else if let Some(caps) = CLASS_RE.captures(locator) {
        let v = &caps[1];
        vec![id(v), name(v), test_id(v)]
    } else if let Some(caps) = ATTR_RE.captures(locator) {
        let v = caps[2].trim();
        let simple = ID_RE.is_match(&id(v));
        match &caps[1] {
            "name" if simple => vec![id(v), class(v), test_id(v)],
            "name" => vec![test_id(v)],
            _ if simple => vec![id(v), name(v), class(v)],
            _ => vec![name(v)],
        }
    } else if let Some(text) = locator.strip_prefix("text=") {
        text_variants(text)
            .into_iter()
            .map(|t| format!("text={}", t))
            .collect()
    } else {
        Vec::new()
    };

    let mut seen = Vec::new();
    alternatives.retain(|a| {
        let keep = a != locator && !seen.contains(a);
        seen.push(a.clone());
        keep
    });
    alternatives
}

fn text_variants(text: &str) -> Vec<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let title = collapsed
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ");
    vec![
        collapsed.clone(),
        collapsed.to_lowercase(),
        collapsed.to_uppercase(),
        title,
    ]
    .into_iter()
    .filter(|v| !v.is_empty())
    .collect()
}

/// Confidence of a registry alternate from its priority and track record.
pub fn registry_confidence(entry: &RegisteredLocator) -> f64 {
    let base = (0.9 - 0.05 * f64::from(entry.priority.saturating_sub(1))).max(0.0);
    (base * 0.6 + entry.success_rate() * 0.4).clamp(REGISTRY_FLOOR, REGISTRY_CEILING)
}

/// Tries registered alternates for the element, then shape-derived ones.
pub struct FallbackStrategy {
    registry: Arc<LocatorRegistry>,
}

impl FallbackStrategy {
    pub fn new(registry: Arc<LocatorRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl HealingStrategy for FallbackStrategy {
    fn name(&self) -> &str {
        "fallback"
    }

    fn priority(&self) -> u32 {
        1
    }

    fn is_applicable(&self, ctx: &HealingContext) -> bool {
        !ctx.failed_locator.trim().is_empty()
    }

    async fn heal(&self, ctx: &HealingContext, session: &dyn PageSession) -> Option<HealingResult> {
        if let Some(object_id) = ctx.object_id.as_deref() {
            for entry in self.registry.alternates(object_id, &ctx.failed_locator) {
                if session.is_visible(&entry.locator).await.unwrap_or(false) {
                    return Some(
                        HealingResult::new(self.name(), &entry.locator, registry_confidence(&entry))
                            .with_meta("source", "registry")
                            .with_meta("priority", entry.priority.to_string()),
                    );
                }
                self.registry.record_outcome(object_id, &entry.locator, false);
            }
        }

        for candidate in shape_alternatives(&ctx.failed_locator) {
            tracing::debug!("Fallback trying {}", candidate);
            if session.is_visible(&candidate).await.unwrap_or(false) {
                return Some(
                    HealingResult::new(self.name(), candidate, DERIVED_CONFIDENCE)
                        .with_meta("source", "derived"),
                );
            }
        }
        None
    }

    fn record_success(&self, ctx: &HealingContext, result: &HealingResult) {
        let Some(object_id) = ctx.object_id.as_deref() else {
            return;
        };
        // A derived alternate that worked becomes a known one
        if result.metadata.get("source").map(String::as_str) == Some("derived") {
            self.registry.register(object_id, &result.new_locator, 5);
        }
        self.registry.record_outcome(object_id, &result.new_locator, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::{MockBrowser, MockElement, MockPage, MockSite};
    use crate::browser::{Browser, SessionOptions};

    fn ctx(locator: &str, object_id: Option<&str>) -> HealingContext {
        HealingContext {
            failed_locator: locator.into(),
            object_id: object_id.map(str::to_string),
            step_index: 0,
            test_case_id: "t1".into(),
            error_message: "Element not found".into(),
        }
    }

    #[test]
    fn test_shape_alternatives() {
        assert_eq!(
            shape_alternatives("#submit-btn"),
            vec!["[name=\"submit-btn\"]", ".submit-btn", "[data-testid=\"submit-btn\"]"]
        );
        assert_eq!(
            shape_alternatives("[name=\"email\"]"),
            vec!["#email", ".email", "[data-testid=\"email\"]"]
        );
        assert_eq!(
            shape_alternatives(".card"),
            vec!["#card", "[name=\"card\"]", "[data-testid=\"card\"]"]
        );
        assert_eq!(
            shape_alternatives("[data-testid='save']"),
            vec!["#save", "[name=\"save\"]", ".save"]
        );
        assert_eq!(
            shape_alternatives("text=  sign   IN "),
            vec!["text=sign IN", "text=sign in", "text=SIGN IN", "text=Sign In"]
        );
        assert!(shape_alternatives("body > div:nth-of-type(2)").is_empty());
    }

    #[test]
    fn test_registry_confidence_floor() {
        let entry = |priority, successes, attempts| RegisteredLocator {
            locator: "#x".into(),
            priority,
            successes,
            attempts,
        };
        assert!((registry_confidence(&entry(1, 0, 0)) - 0.94).abs() < 1e-9);
        assert_eq!(registry_confidence(&entry(9, 0, 5)), 0.7);
        assert!(registry_confidence(&entry(1, 5, 5)) <= 0.99);
    }

    async fn session_for(page: MockPage) -> std::sync::Arc<dyn PageSession> {
        let site = MockSite::new("https://app.test").page(page);
        let browser = MockBrowser::new(std::sync::Arc::new(site));
        let session = browser.new_session(SessionOptions::default()).await.unwrap();
        session.navigate("https://app.test/").await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_first_visible_derived_alternative_wins() {
        let session = session_for(
            MockPage::new("/", "Home")
                .element(MockElement::button("Go").class("submit-btn"))
                .element(MockElement::button("Go").test_id("submit-btn")),
        )
        .await;
        let strategy = FallbackStrategy::new(Arc::new(LocatorRegistry::new()));
        let result = strategy
            .heal(&ctx("#submit-btn", None), session.as_ref())
            .await
            .unwrap();
        assert_eq!(result.new_locator, ".submit-btn");
        assert_eq!(result.confidence, DERIVED_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_no_alternative_returns_none() {
        let session = session_for(MockPage::new("/", "Home").element(MockElement::button("Go"))).await;
        let strategy = FallbackStrategy::new(Arc::new(LocatorRegistry::new()));
        assert!(strategy
            .heal(&ctx("#missing", None), session.as_ref())
            .await
            .is_none());
        assert!(strategy
            .heal(&ctx("body > p", None), session.as_ref())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_registry_alternate_preferred_and_learned() {
        let session = session_for(
            MockPage::new("/", "Home")
                .element(MockElement::input("email", "email").id("login-email")),
        )
        .await;
        let registry = Arc::new(LocatorRegistry::new());
        registry.register("login-email", "#old-email", 1);
        registry.register("login-email", "#login-email", 2);
        let strategy = FallbackStrategy::new(Arc::clone(&registry));

        let context = ctx("#old-email", Some("login-email"));
        let result = strategy.heal(&context, session.as_ref()).await.unwrap();
        assert_eq!(result.new_locator, "#login-email");
        assert!(result.confidence >= 0.7);
        assert_eq!(result.metadata["source"], "registry");

        strategy.record_success(&context, &result);
        let entry = registry
            .alternates("login-email", "#old-email")
            .into_iter()
            .next()
            .unwrap();
        assert_eq!(entry.successes, 1);
    }
}
