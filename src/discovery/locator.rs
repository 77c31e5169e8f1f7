//! Stable locator derivation for crawled elements.

use crate::models::{ElementInfo, ElementKind, RawElement};

/// Longest visible text used for a `text=` locator.
const MAX_TEXT_LOCATOR_LEN: usize = 50;

/// Whether `s` can be used after `#` or `.` without escaping.
pub fn is_css_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `[attr="value"]` with the value quoted.
pub fn attribute_selector(attr: &str, value: &str) -> String {
    format!("[{}=\"{}\"]", attr, value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub fn id_selector(id: &str) -> String {
    if is_css_ident(id) {
        format!("#{}", id)
    } else {
        attribute_selector("id", id)
    }
}

/// Derive the most stable locator for an element.
///
/// Priority: `#id`, `[name]`, test attribute, `[aria-label]`, `text=` for
/// clickable controls, then the structural path.
pub fn derive_locator(raw: &RawElement) -> String {
    if let Some(id) = non_empty(&raw.id) {
        return id_selector(id);
    }
    if let Some(name) = non_empty(&raw.name) {
        return attribute_selector("name", name);
    }
    if let Some(test_id) = non_empty(&raw.test_id) {
        let attr = raw.test_attr.as_deref().unwrap_or("data-testid");
        return attribute_selector(attr, test_id);
    }
    if let Some(label) = non_empty(&raw.aria_label) {
        return attribute_selector("aria-label", label);
    }
    let clickable = matches!(raw.tag.as_str(), "button" | "a")
        || (raw.tag == "input"
            && matches!(raw.input_type.as_deref(), Some("submit" | "button")));
    if clickable {
        if let Some(text) = non_empty(&raw.text) {
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if text.len() <= MAX_TEXT_LOCATOR_LEN {
                return format!("text={}", text);
            }
        }
    }
    raw.css_path.clone()
}

/// Convert an extracted element into the page model, or `None` for tags the
/// model does not track.
pub fn to_element_info(raw: &RawElement) -> Option<ElementInfo> {
    let kind = ElementKind::from_tag(&raw.tag, raw.input_type.as_deref())?;
    let mut info = ElementInfo::new(kind, derive_locator(raw));
    info.id = raw.id.clone();
    info.name = raw.name.clone();
    info.placeholder = raw.placeholder.clone();
    info.text = raw.text.clone();
    info.input_type = raw.input_type.clone();
    info.href = raw.href.clone();
    info.form_index = raw.form_index;
    info.required = raw.required;
    info.options = raw.options.clone();
    Some(info)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(tag: &str) -> RawElement {
        RawElement {
            tag: tag.into(),
            css_path: format!("body > {}:nth-of-type(2)", tag),
            visible: true,
            ..RawElement::default()
        }
    }

    #[test]
    fn test_locator_priority() {
        let mut el = raw("button");
        el.text = Some("  Save   changes ".into());
        assert_eq!(derive_locator(&el), "text=Save changes");

        el.aria_label = Some("save".into());
        assert_eq!(derive_locator(&el), r#"[aria-label="save"]"#);

        el.test_id = Some("save-btn".into());
        el.test_attr = Some("data-cy".into());
        assert_eq!(derive_locator(&el), r#"[data-cy="save-btn"]"#);

        el.name = Some("save".into());
        assert_eq!(derive_locator(&el), r#"[name="save"]"#);

        el.id = Some("save".into());
        assert_eq!(derive_locator(&el), "#save");
    }

    #[test]
    fn test_structural_fallback_for_plain_inputs() {
        let mut el = raw("input");
        el.input_type = Some("text".into());
        el.text = Some("typed".into());
        assert_eq!(derive_locator(&el), "body > input:nth-of-type(2)");
    }

    #[test]
    fn test_awkward_ids_use_attribute_form() {
        let mut el = raw("input");
        el.id = Some("user.email".into());
        assert_eq!(derive_locator(&el), r#"[id="user.email"]"#);
        assert!(!is_css_ident("1abc"));
        assert!(is_css_ident("submit-btn"));
    }

    #[test]
    fn test_to_element_info_skips_untracked_tags() {
        assert!(to_element_info(&raw("div")).is_none());
        let mut el = raw("input");
        el.input_type = Some("submit".into());
        el.form_index = Some(0);
        let info = to_element_info(&el).unwrap();
        assert_eq!(info.kind, ElementKind::Button);
        assert!(info.is_submit());
    }
}
