//! Known alternate locators per logical element.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::auth::login::field_locators;
use crate::generation::object_id;
use crate::models::WebsiteMap;

/// One alternate locator and how it has fared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredLocator {
    pub locator: String,
    /// 1 is most preferred
    pub priority: u32,
    pub successes: u32,
    pub attempts: u32,
}

impl RegisteredLocator {
    /// Unknown locators count as fully successful until tried.
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            1.0
        } else {
            f64::from(self.successes) / f64::from(self.attempts)
        }
    }
}

/// Alternate locators keyed by object id, shared across batches.
#[derive(Default)]
pub struct LocatorRegistry {
    entries: RwLock<HashMap<String, Vec<RegisteredLocator>>>,
}

impl LocatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an alternate. Re-registering keeps the stats and the best priority.
    pub fn register(&self, object_id: &str, locator: &str, priority: u32) {
        let mut entries = self.entries.write();
        let list = entries.entry(object_id.to_string()).or_default();
        match list.iter_mut().find(|l| l.locator == locator) {
            Some(existing) => existing.priority = existing.priority.min(priority),
            None => list.push(RegisteredLocator {
                locator: locator.to_string(),
                priority,
                successes: 0,
                attempts: 0,
            }),
        }
    }

    /// Register every element of every page under its generated object id.
    pub fn register_map(&self, map: &WebsiteMap) {
        let mut count = 0;
        for page in &map.pages {
            for el in &page.elements {
                let id = object_id(&page.url, el);
                for (i, locator) in field_locators(el).iter().enumerate() {
                    self.register(&id, locator, i as u32 + 1);
                    count += 1;
                }
            }
        }
        tracing::debug!("Registered {} alternate locators", count);
    }

    /// Alternates for `object_id` other than `excluding`, best first:
    /// ascending priority, then descending success rate.
    pub fn alternates(&self, object_id: &str, excluding: &str) -> Vec<RegisteredLocator> {
        let entries = self.entries.read();
        let mut list: Vec<RegisteredLocator> = entries
            .get(object_id)
            .map(|l| l.iter().filter(|l| l.locator != excluding).cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.success_rate().total_cmp(&a.success_rate()))
        });
        list
    }

    pub fn record_outcome(&self, object_id: &str, locator: &str, success: bool) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries
            .get_mut(object_id)
            .and_then(|l| l.iter_mut().find(|l| l.locator == locator))
        {
            entry.attempts += 1;
            if success {
                entry.successes += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ElementInfo, ElementKind, PageInfo};

    #[test]
    fn test_alternates_sorted_by_priority_then_success() {
        let registry = LocatorRegistry::new();
        registry.register("email", "#email", 1);
        registry.register("email", "[name=\"email\"]", 2);
        registry.register("email", ".email-a", 3);
        registry.register("email", ".email-b", 3);
        registry.record_outcome("email", ".email-a", false);
        registry.record_outcome("email", ".email-b", true);

        let alternates: Vec<String> = registry
            .alternates("email", "#email")
            .into_iter()
            .map(|l| l.locator)
            .collect();
        assert_eq!(alternates, vec!["[name=\"email\"]", ".email-b", ".email-a"]);
    }

    #[test]
    fn test_reregister_keeps_stats() {
        let registry = LocatorRegistry::new();
        registry.register("x", "#x", 3);
        registry.record_outcome("x", "#x", true);
        registry.register("x", "#x", 1);
        let list = registry.alternates("x", "");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].priority, 1);
        assert_eq!(list[0].successes, 1);
    }

    #[test]
    fn test_register_map_uses_field_locators() {
        let mut el = ElementInfo::new(ElementKind::Input, "#email");
        el.id = Some("email".into());
        el.name = Some("user_email".into());
        let map = WebsiteMap {
            pages: vec![PageInfo {
                url: "https://app.test/login".into(),
                title: "Login".into(),
                elements: vec![el],
                depth: 0,
                status: Some(200),
            }],
            ..WebsiteMap::default()
        };
        let registry = LocatorRegistry::new();
        registry.register_map(&map);
        let alternates = registry.alternates("https://app.test/login::#email", "#email");
        assert_eq!(alternates.len(), 1);
        assert_eq!(alternates[0].locator, "[name=\"user_email\"]");
        assert!(registry.alternates("unknown", "#email").is_empty());
    }
}
