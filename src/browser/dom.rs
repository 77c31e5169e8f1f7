//! In-page scripts for element extraction and locator resolution.
//!
//! Locators are CSS selectors, `xpath=`/`//` expressions, or `text=` pseudo
//! selectors matched against normalized visible text. Scripts resolve a
//! locator in the page and tag the element with a `data-autotest-ref`
//! attribute so it can be addressed with a plain CSS selector afterwards.

use anyhow::Result;

/// Attribute used to address a resolved element.
pub const REF_ATTRIBUTE: &str = "data-autotest-ref";

/// Shared resolver, prepended to every locator script.
const RESOLVER: &str = r#"
const __norm = (s) => (s || '').replace(/\s+/g, ' ').trim();
const __visible = (el) => {
    if (!el) return false;
    const style = window.getComputedStyle(el);
    if (style.visibility === 'hidden' || style.display === 'none') return false;
    return !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);
};
const __candidates = (loc) => {
    if (loc.startsWith('text=')) {
        const want = __norm(loc.slice(5));
        const groups = [
            'button, a, [role=button], [role=link], input[type=submit], input[type=button]',
            'label, li, td, th, span, p, h1, h2, h3, h4, h5, h6',
            'div',
        ];
        const out = [];
        for (const group of groups) {
            for (const el of document.querySelectorAll(group)) {
                if (__norm(el.innerText || el.value || '') === want) out.push(el);
            }
        }
        return out;
    }
    if (loc.startsWith('xpath=') || loc.startsWith('//')) {
        const expr = loc.startsWith('xpath=') ? loc.slice(6) : loc;
        const snap = document.evaluate(expr, document, null,
            XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
        const out = [];
        for (let i = 0; i < snap.snapshotLength; i++) out.push(snap.snapshotItem(i));
        return out;
    }
    return Array.from(document.querySelectorAll(loc));
};
// First visible match; a hidden match only when nothing matching is visible
const __resolve = (loc) => {
    const all = __candidates(loc);
    return all.find(__visible) || all[0] || null;
};
"#;

/// Extract interactive elements with the attributes locator derivation needs.
pub const EXTRACT_ELEMENTS: &str = r#"(() => {
    const visible = (el) => {
        const style = window.getComputedStyle(el);
        if (style.visibility === 'hidden' || style.display === 'none') return false;
        return !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);
    };
    const cssPath = (el) => {
        const parts = [];
        let node = el;
        while (node && node.nodeType === 1 && node !== document.body) {
            const tag = node.tagName.toLowerCase();
            let idx = 1;
            let sib = node.previousElementSibling;
            while (sib) {
                if (sib.tagName === node.tagName) idx++;
                sib = sib.previousElementSibling;
            }
            parts.unshift(tag + ':nth-of-type(' + idx + ')');
            node = node.parentElement;
        }
        parts.unshift('body');
        return parts.join(' > ');
    };
    const forms = Array.from(document.forms);
    const attr = (el, name) => {
        const v = el.getAttribute(name);
        return v && v.trim().length ? v.trim() : null;
    };
    const testAttr = (el) => ['data-testid', 'data-test', 'data-cy'].find(a => attr(el, a)) || null;
    const out = [];
    for (const el of document.querySelectorAll('input, button, a[href], form, textarea, select')) {
        const tag = el.tagName.toLowerCase();
        const type = tag === 'input' ? (el.getAttribute('type') || 'text').toLowerCase()
            : (tag === 'button' ? (el.getAttribute('type') || 'submit').toLowerCase() : null);
        if (type === 'hidden') continue;
        const owner = tag === 'form' ? el : (el.form || el.closest('form'));
        const formIndex = owner ? forms.indexOf(owner) : -1;
        let text = tag === 'input' ? (el.value || null) : (el.innerText || '').replace(/\s+/g, ' ').trim();
        if (text && text.length > 80) text = text.slice(0, 80);
        out.push({
            tag,
            id: attr(el, 'id'),
            name: attr(el, 'name'),
            testId: attr(el, testAttr(el) || 'data-testid'),
            testAttr: testAttr(el),
            ariaLabel: attr(el, 'aria-label'),
            placeholder: attr(el, 'placeholder'),
            inputType: type,
            text: text && text.length ? text : null,
            href: tag === 'a' ? el.href : null,
            classes: Array.from(el.classList || []),
            cssPath: cssPath(el),
            formIndex: formIndex >= 0 ? formIndex : null,
            required: !!el.required,
            visible: tag === 'form' ? true : visible(el),
            options: tag === 'select' ? Array.from(el.options).map(o => o.value) : [],
        });
    }
    return out;
})()"#;

/// Absolute hrefs of every anchor.
pub const EXTRACT_LINKS: &str =
    "Array.from(document.querySelectorAll('a[href]')).map(a => a.href)";

/// Visible text of the body.
pub const PAGE_TEXT: &str = "document.body ? document.body.innerText : ''";

/// HTTP status of the current document (Navigation Timing Level 2).
pub const DOCUMENT_STATUS: &str = r#"(() => {
    const entry = performance.getEntriesByType('navigation')[0];
    return entry && entry.responseStatus ? entry.responseStatus : null;
})()"#;

/// Wraps a locator-taking body in the resolver prelude.
fn with_resolver(locator: &str, body: &str) -> Result<String> {
    let locator_json = serde_json::to_string(locator)?;
    Ok(format!(
        "(() => {{ {resolver}\nconst loc = {loc};\n{body}\n}})()",
        resolver = RESOLVER,
        loc = locator_json,
        body = body
    ))
}

/// Script returning whether the locator resolves to a visible element.
pub fn visible_script(locator: &str) -> Result<String> {
    with_resolver(locator, "return __visible(__resolve(loc));")
}

/// Script tagging the resolved element with `ref_id`.
///
/// Returns `true` when a visible element was found and tagged.
pub fn tag_script(locator: &str, ref_id: &str) -> Result<String> {
    let ref_json = serde_json::to_string(ref_id)?;
    with_resolver(
        locator,
        &format!(
            "const el = __resolve(loc);
            if (!el || !__visible(el)) return false;
            el.setAttribute('{attr}', {ref_id});
            return true;",
            attr = REF_ATTRIBUTE,
            ref_id = ref_json
        ),
    )
}

/// Script clearing a text field before typing.
pub fn clear_script(locator: &str) -> Result<String> {
    with_resolver(
        locator,
        "const el = __resolve(loc);
        if (!el) throw new Error('Element not found: ' + loc);
        el.focus();
        if ('value' in el) el.value = '';
        return true;",
    )
}

/// Script firing input/change events after typing.
pub fn commit_script(locator: &str) -> Result<String> {
    with_resolver(
        locator,
        "const el = __resolve(loc);
        if (!el) return false;
        el.dispatchEvent(new Event('input', { bubbles: true }));
        el.dispatchEvent(new Event('change', { bubbles: true }));
        return true;",
    )
}

/// Script choosing an option of a `<select>`.
pub fn select_script(locator: &str, value: &str) -> Result<String> {
    let value_json = serde_json::to_string(value)?;
    with_resolver(
        locator,
        &format!(
            "const el = __resolve(loc);
            if (!el) throw new Error('Element not found: ' + loc);
            el.value = {};
            el.dispatchEvent(new Event('change', {{ bubbles: true }}));
            return true;",
            value_json
        ),
    )
}

/// Script setting checkbox/radio state.
pub fn check_script(locator: &str, checked: bool) -> Result<String> {
    with_resolver(
        locator,
        &format!(
            "const el = __resolve(loc);
            if (!el) throw new Error('Element not found: ' + loc);
            if (el.checked !== {checked}) el.click();
            return el.checked;",
            checked = checked
        ),
    )
}

/// Script restoring localStorage items.
pub fn set_local_storage_script(items: &std::collections::HashMap<String, String>) -> Result<String> {
    let payload = serde_json::to_string(items)?;
    Ok(format!(
        r#"(function() {{
            const items = {};
            try {{ localStorage.clear(); }} catch (_) {{}}
            for (const [k, v] of Object.entries(items)) {{
                try {{ localStorage.setItem(k, v); }} catch (_) {{}}
            }}
        }})()"#,
        payload
    ))
}

/// CSS selector addressing an element tagged by [`tag_script`].
pub fn ref_selector(ref_id: &str) -> String {
    format!("[{}='{}']", REF_ATTRIBUTE, ref_id)
}
