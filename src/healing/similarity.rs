//! Token-overlap matching against the live DOM.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::browser::PageSession;
use crate::discovery::locator::derive_locator;
use crate::models::RawElement;

use super::{HealingContext, HealingResult, HealingStrategy};

/// Candidates scoring below this are ignored.
pub const MIN_SCORE: f64 = 0.5;
const CONFIDENCE_SCALE: f64 = 0.85;

/// Selector syntax that says nothing about the element.
const NOISE: &[&str] = &[
    "text", "name", "data", "testid", "test", "id", "nth", "of", "type", "cy", "aria", "label",
    "placeholder", "body", "div", "span",
];

fn tokens(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.len() >= 2 && !NOISE.contains(&t.as_str()))
        .collect()
}

fn element_tokens(el: &RawElement) -> HashSet<String> {
    let mut out = HashSet::new();
    for part in [
        el.id.as_deref(),
        el.name.as_deref(),
        el.test_id.as_deref(),
        el.aria_label.as_deref(),
        el.placeholder.as_deref(),
        el.text.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        out.extend(tokens(part));
    }
    for class in &el.classes {
        out.extend(tokens(class));
    }
    out
}

/// Share of the wanted tokens the element carries, with Jaccard as tiebreak.
pub fn score(wanted: &HashSet<String>, el: &RawElement) -> (f64, f64) {
    if wanted.is_empty() {
        return (0.0, 0.0);
    }
    let have = element_tokens(el);
    let overlap = wanted.intersection(&have).count() as f64;
    let union = wanted.union(&have).count().max(1) as f64;
    (overlap / wanted.len() as f64, overlap / union)
}

/// Finds the visible element most similar to what the failed locator named.
#[derive(Default)]
pub struct SimilarityStrategy;

impl SimilarityStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HealingStrategy for SimilarityStrategy {
    fn name(&self) -> &str {
        "similarity"
    }

    fn priority(&self) -> u32 {
        2
    }

    fn is_applicable(&self, ctx: &HealingContext) -> bool {
        !tokens(&ctx.failed_locator).is_empty()
    }

    async fn heal(&self, ctx: &HealingContext, session: &dyn PageSession) -> Option<HealingResult> {
        let wanted = tokens(&ctx.failed_locator);
        let elements = match session.extract_elements().await {
            Ok(elements) => elements,
            Err(e) => {
                tracing::debug!("Similarity could not read the page: {}", e);
                return None;
            }
        };

        let (best, (best_score, _)) = elements
            .iter()
            .filter(|el| el.visible)
            .map(|el| (el, score(&wanted, el)))
            .filter(|(el, _)| derive_locator(el) != ctx.failed_locator)
            .max_by(|(_, a), (_, b)| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)))?;
        if best_score < MIN_SCORE {
            return None;
        }

        let locator = derive_locator(best);
        if !session.is_visible(&locator).await.unwrap_or(false) {
            return None;
        }
        Some(
            HealingResult::new(self.name(), locator, best_score * CONFIDENCE_SCALE)
                .with_meta("score", format!("{:.2}", best_score)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::{MockBrowser, MockElement, MockPage, MockSite};
    use crate::browser::{Browser, SessionOptions};
    use std::sync::Arc;

    fn ctx(locator: &str) -> HealingContext {
        HealingContext {
            failed_locator: locator.into(),
            object_id: None,
            step_index: 1,
            test_case_id: "t".into(),
            error_message: "Element not found".into(),
        }
    }

    #[test]
    fn test_tokens_skip_selector_noise() {
        let t = tokens("[data-testid=\"checkout-button\"]");
        assert_eq!(t, ["checkout", "button"].iter().map(|s| s.to_string()).collect());
    }

    #[test]
    fn test_score() {
        let wanted = tokens("#submit-btn");
        let el = RawElement {
            tag: "button".into(),
            classes: vec!["btn".into(), "submit-primary".into()],
            ..RawElement::default()
        };
        assert_eq!(score(&wanted, &el).0, 1.0);
        let other = RawElement {
            tag: "button".into(),
            text: Some("Cancel".into()),
            ..RawElement::default()
        };
        assert_eq!(score(&wanted, &other).0, 0.0);
    }

    #[tokio::test]
    async fn test_heals_to_best_match() {
        let site = MockSite::new("https://app.test").page(
            MockPage::new("/", "Home")
                .element(MockElement::button("Cancel").id("cancel"))
                .element(MockElement::button("Submit order").id("order-submit-button")),
        );
        let browser = MockBrowser::new(Arc::new(site));
        let session = browser.new_session(SessionOptions::default()).await.unwrap();
        session.navigate("https://app.test/").await.unwrap();

        let strategy = SimilarityStrategy::new();
        let result = strategy
            .heal(&ctx("#submit-button"), session.as_ref())
            .await
            .unwrap();
        assert_eq!(result.new_locator, "#order-submit-button");
        assert!((result.confidence - 0.85).abs() < 1e-9);

        assert!(strategy.heal(&ctx("#delete-account"), session.as_ref()).await.is_none());
    }
}
