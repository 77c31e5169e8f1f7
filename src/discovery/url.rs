//! URL normalization and link filtering.

use url::Url;

/// Link schemes that never lead to a document.
const SKIPPED_SCHEMES: &[&str] = &["mailto:", "javascript:", "tel:", "data:", "blob:", "ftp:"];

/// Extensions of binary or static assets the crawler never visits.
const ASSET_EXTENSIONS: &[&str] = &[
    "pdf", "zip", "gz", "tar", "rar", "7z", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico",
    "bmp", "css", "js", "mjs", "map", "woff", "woff2", "ttf", "eot", "otf", "mp3", "mp4", "webm",
    "avi", "mov", "wav", "ogg", "exe", "dmg", "apk", "doc", "docx", "xls", "xlsx", "ppt", "pptx",
    "csv", "xml", "json",
];

/// Path or label fragments of links that end the current session.
const SESSION_ENDING_HINTS: &[&str] = &[
    "logout", "log-out", "log_out", "log out", "signout", "sign-out", "sign_out", "sign out",
    "logoff", "log-off",
];

/// Normalize an absolute http(s) URL into a page identity.
///
/// Scheme and host are lower-cased and default ports dropped (the `url` crate
/// does both on parse), the fragment is removed, a trailing slash is trimmed
/// from every path except the root and query pairs are sorted.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Some(url.to_string())
}

/// Resolve `href` against `base` and normalize the result.
pub fn resolve(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    let joined = base.join(href.trim()).ok()?;
    normalize_url(joined.as_str())
}

/// Whether a link can lead to an HTML document worth crawling.
pub fn is_document_link(href: &str) -> bool {
    let lower = href.trim().to_lowercase();
    if lower.is_empty() || lower.starts_with('#') {
        return false;
    }
    if SKIPPED_SCHEMES.iter().any(|s| lower.starts_with(s)) {
        return false;
    }

    let path = match Url::parse(&lower) {
        Ok(url) => url.path().to_string(),
        Err(_) => lower
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    match path.rsplit('/').next().and_then(|seg| seg.rsplit_once('.')) {
        Some((_, ext)) => !ASSET_EXTENSIONS.contains(&ext),
        None => true,
    }
}

/// `scheme://host[:port]` of an absolute URL.
pub fn origin_of(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    match url.origin() {
        url::Origin::Tuple(..) => Some(url.origin().ascii_serialization()),
        url::Origin::Opaque(_) => None,
    }
}

pub fn same_origin(a: &str, b: &str) -> bool {
    match (origin_of(a), origin_of(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Path component of a URL, or the input itself when it is not absolute.
pub fn path_of(raw: &str) -> String {
    Url::parse(raw)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// Whether following `href` (or activating a control labelled with it) signs
/// the user out. Only the path of an absolute URL is inspected.
pub fn ends_session(href: &str) -> bool {
    let target = match Url::parse(href.trim()) {
        Ok(url) => url.path().to_lowercase(),
        Err(_) => href.trim().to_lowercase(),
    };
    SESSION_ENDING_HINTS.iter().any(|h| target.contains(h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ending_links() {
        assert!(ends_session("https://app.test/logout"));
        assert!(ends_session("/account/sign-out?next=/"));
        assert!(ends_session("Log out"));
        assert!(!ends_session("https://app.test/blog/logs"));
        assert!(!ends_session("https://logout.example/home"));
    }

    #[test]
    fn test_normalize_drops_fragment_port_and_trailing_slash() {
        assert_eq!(
            normalize_url("HTTPS://App.Test:443/About/#team").as_deref(),
            Some("https://app.test/About")
        );
        assert_eq!(
            normalize_url("https://app.test").as_deref(),
            Some("https://app.test/")
        );
        assert_eq!(
            normalize_url("https://app.test/").as_deref(),
            Some("https://app.test/")
        );
    }

    #[test]
    fn test_normalize_sorts_query() {
        assert_eq!(
            normalize_url("https://app.test/search?q=x&a=1").as_deref(),
            Some("https://app.test/search?a=1&q=x")
        );
        assert_eq!(
            normalize_url("https://app.test/search?").as_deref(),
            Some("https://app.test/search")
        );
    }

    #[test]
    fn test_normalize_rejects_non_http() {
        assert_eq!(normalize_url("mailto:a@b.c"), None);
        assert_eq!(normalize_url("not a url"), None);
    }

    #[test]
    fn test_document_links() {
        assert!(is_document_link("/products"));
        assert!(is_document_link("https://app.test/a.b/page"));
        assert!(!is_document_link("mailto:team@app.test"));
        assert!(!is_document_link("javascript:void(0)"));
        assert!(!is_document_link("tel:+123"));
        assert!(!is_document_link("/files/report.PDF"));
        assert!(!is_document_link("#top"));
    }

    #[test]
    fn test_resolve_and_origin() {
        assert_eq!(
            resolve("https://app.test/a/b", "../c/").as_deref(),
            Some("https://app.test/c")
        );
        assert!(same_origin("https://app.test/x", "https://app.test:443/y"));
        assert!(!same_origin("https://app.test/x", "http://app.test/x"));
        assert_eq!(path_of("https://app.test/users/1?x=1"), "/users/1");
    }
}
