//! Heuristic user-flow tagging over crawled pages.

use std::collections::{HashMap, HashSet};

use crate::models::{ElementKind, FlowKind, Interaction, InteractionKind, PageInfo, UserFlow};

/// URL/title keywords per flow kind.
const FLOW_KEYWORDS: &[(FlowKind, &[&str])] = &[
    (
        FlowKind::Login,
        &["login", "signin", "sign-in", "sign_in", "log-in", "logon"],
    ),
    (
        FlowKind::Registration,
        &["register", "signup", "sign-up", "sign_up", "create-account", "join"],
    ),
    (
        FlowKind::Checkout,
        &["checkout", "cart", "basket", "payment", "billing"],
    ),
    (FlowKind::Search, &["search"]),
    (FlowKind::Contact, &["contact", "support", "feedback"]),
];

/// Detect keyword flows and chains of consecutive form pages.
pub fn detect_flows(pages: &[PageInfo], interactions: &[Interaction]) -> Vec<UserFlow> {
    let mut flows = keyword_flows(pages);
    flows.extend(form_chains(pages, interactions));
    flows
}

fn keyword_flows(pages: &[PageInfo]) -> Vec<UserFlow> {
    let mut flows = Vec::new();
    for page in pages {
        let haystack = format!("{} {}", page.url, page.title).to_lowercase();
        for (kind, keywords) in FLOW_KEYWORDS {
            if !keywords.iter().any(|k| haystack.contains(k)) {
                continue;
            }
            let needs_form = matches!(
                kind,
                FlowKind::Login | FlowKind::Registration | FlowKind::Contact
            );
            if needs_form && !page.has_form() {
                continue;
            }
            flows.push(UserFlow {
                name: format!("{:?} ({})", kind, page.title),
                kind: *kind,
                pages: vec![page.url.clone()],
            });
        }
        let has_search_box = page.elements.iter().any(|e| {
            e.input_type.as_deref() == Some("search") || e.name.as_deref() == Some("q")
        });
        if has_search_box && !flows.iter().any(|f| f.kind == FlowKind::Search) {
            flows.push(UserFlow {
                name: format!("Search ({})", page.title),
                kind: FlowKind::Search,
                pages: vec![page.url.clone()],
            });
        }
    }
    flows
}

/// Chains of form-bearing pages where each links or submits to the next.
///
/// Walks start only from pages that no other form page leads to.
fn form_chains(pages: &[PageInfo], interactions: &[Interaction]) -> Vec<UserFlow> {
    let form_pages: HashMap<&str, &PageInfo> = pages
        .iter()
        .filter(|p| p.has_form())
        .map(|p| (p.url.as_str(), p))
        .collect();

    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for interaction in interactions {
        let Some(target) = interaction.target_url.as_deref() else {
            continue;
        };
        if target == interaction.page_url {
            continue;
        }
        if form_pages.contains_key(interaction.page_url.as_str()) && form_pages.contains_key(target)
        {
            let next = edges.entry(interaction.page_url.as_str()).or_default();
            if !next.contains(&target) {
                next.push(target);
            }
        }
    }

    let targets: HashSet<&str> = edges.values().flatten().copied().collect();
    let mut starts: Vec<&str> = edges
        .keys()
        .copied()
        .filter(|url| !targets.contains(url))
        .collect();
    starts.sort();

    let mut flows = Vec::new();
    for start in starts {
        let mut chain = vec![start];
        let mut visited: HashSet<&str> = HashSet::from([start]);
        let mut current = start;
        while let Some(next) = edges
            .get(current)
            .and_then(|n| n.iter().find(|u| !visited.contains(*u)))
        {
            chain.push(next);
            visited.insert(next);
            current = next;
        }
        if chain.len() < 2 {
            continue;
        }
        let titles: Vec<&str> = chain
            .iter()
            .filter_map(|u| form_pages.get(u).map(|p| p.title.as_str()))
            .collect();
        flows.push(UserFlow {
            name: format!("Multi-step form: {}", titles.join(" -> ")),
            kind: FlowKind::MultiStepForm,
            pages: chain.into_iter().map(str::to_string).collect(),
        });
    }
    flows
}

/// Link and submit interactions visible on a page.
pub fn page_interactions(page: &PageInfo) -> Vec<Interaction> {
    page.elements
        .iter()
        .filter_map(|el| match el.kind {
            ElementKind::Link => el.href.as_ref().map(|href| Interaction {
                page_url: page.url.clone(),
                locator: el.locator.clone(),
                kind: InteractionKind::Navigate,
                target_url: super::url::normalize_url(href),
            }),
            ElementKind::Button if el.is_submit() => Some(Interaction {
                page_url: page.url.clone(),
                locator: el.locator.clone(),
                kind: InteractionKind::Submit,
                target_url: None,
            }),
            ElementKind::Button => Some(Interaction {
                page_url: page.url.clone(),
                locator: el.locator.clone(),
                kind: InteractionKind::Click,
                target_url: None,
            }),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ElementInfo;

    fn page(url: &str, title: &str, form: bool) -> PageInfo {
        let mut elements = Vec::new();
        if form {
            let mut input = ElementInfo::new(ElementKind::Input, "#field");
            input.form_index = Some(0);
            elements.push(input);
        }
        PageInfo {
            url: url.into(),
            title: title.into(),
            elements,
            depth: 0,
            status: Some(200),
        }
    }

    fn link(from: &str, to: &str) -> Interaction {
        Interaction {
            page_url: from.into(),
            locator: "a".into(),
            kind: InteractionKind::Navigate,
            target_url: Some(to.into()),
        }
    }

    #[test]
    fn test_keyword_flows_need_forms_for_login() {
        let pages = vec![
            page("https://app.test/login", "Sign in", true),
            page("https://app.test/signup-info", "About signing up", false),
            page("https://app.test/cart", "Your cart", false),
        ];
        let flows = detect_flows(&pages, &[]);
        assert!(flows.iter().any(|f| f.kind == FlowKind::Login));
        assert!(!flows.iter().any(|f| f.kind == FlowKind::Registration));
        assert!(flows.iter().any(|f| f.kind == FlowKind::Checkout));
    }

    #[test]
    fn test_form_chain_walks_from_origin() {
        let pages = vec![
            page("https://app.test/step1", "Step 1", true),
            page("https://app.test/step2", "Step 2", true),
            page("https://app.test/step3", "Step 3", true),
            page("https://app.test/about", "About", false),
        ];
        let interactions = vec![
            link("https://app.test/step1", "https://app.test/step2"),
            link("https://app.test/step2", "https://app.test/step3"),
            link("https://app.test/step3", "https://app.test/about"),
        ];
        let flows = detect_flows(&pages, &interactions);
        let chain = flows
            .iter()
            .find(|f| f.kind == FlowKind::MultiStepForm)
            .unwrap();
        assert_eq!(chain.pages.len(), 3);
        assert_eq!(chain.pages[0], "https://app.test/step1");
        assert_eq!(chain.name, "Multi-step form: Step 1 -> Step 2 -> Step 3");
    }
}
