//! Login and registration detection over crawled pages.
//!
//! Everything here is pure: it only looks at [`PageInfo`] values the crawler
//! already produced.

use serde::{Deserialize, Serialize};

use crate::models::{ElementInfo, ElementKind, PageInfo};

const LOGIN_KEYWORDS: &[&str] = &[
    "login", "signin", "sign-in", "sign_in", "sign in", "log-in", "log in", "logon", "auth",
];

const REGISTER_KEYWORDS: &[&str] = &[
    "register",
    "signup",
    "sign-up",
    "sign_up",
    "sign up",
    "create-account",
    "create account",
    "join",
];

const USERNAME_HINTS: &[&str] = &["user", "email", "login", "account", "phone"];

const LOGIN_SUBMIT_WORDS: &[&str] = &["login", "log in", "sign in", "signin", "submit", "continue", "enter"];

const REGISTER_SUBMIT_WORDS: &[&str] = &[
    "register", "sign up", "signup", "create", "join", "submit", "continue",
];

/// Fields of a detected login form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginForm {
    pub page_url: String,
    pub username: ElementInfo,
    pub password: ElementInfo,
    /// Absent when the form is submitted with Enter
    pub submit: Option<ElementInfo>,
}

/// Fields of a detected registration form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationForm {
    pub page_url: String,
    pub fields: Vec<ElementInfo>,
    pub submit: Option<ElementInfo>,
}

/// Login and registration forms found across a site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetection {
    pub login: Option<LoginForm>,
    pub registration: Option<RegistrationForm>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategy {
    Login,
    Register,
    RegisterThenLogin,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthDecision {
    pub strategy: AuthStrategy,
    pub reason: String,
}

fn haystack(page: &PageInfo) -> String {
    format!("{} {}", page.url, page.title).to_lowercase()
}

pub fn is_registration_page(page: &PageInfo) -> bool {
    let text = haystack(page);
    REGISTER_KEYWORDS.iter().any(|k| text.contains(k)) && page.fields().next().is_some()
}

/// Keyword match, a password field, and not a registration page.
pub fn is_login_page(page: &PageInfo) -> bool {
    let text = haystack(page);
    LOGIN_KEYWORDS.iter().any(|k| text.contains(k))
        && page.has_password_field()
        && !is_registration_page(page)
}

fn matches_any(el: &ElementInfo, words: &[&str]) -> bool {
    let d = el.descriptor();
    words.iter().any(|w| d.contains(w))
}

fn find_submit(page: &PageInfo, words: &[&str]) -> Option<ElementInfo> {
    let buttons: Vec<&ElementInfo> = page
        .elements
        .iter()
        .filter(|e| e.kind == ElementKind::Button)
        .collect();
    buttons
        .iter()
        .find(|b| matches_any(b, words))
        .or_else(|| buttons.iter().find(|b| b.is_submit()))
        .map(|b| (*b).clone())
}

/// Username, password and submit control of a login page.
pub fn find_login_form(page: &PageInfo) -> Option<LoginForm> {
    if !is_login_page(page) {
        return None;
    }
    let password = page.elements.iter().find(|e| e.is_password())?.clone();

    let text_inputs: Vec<&ElementInfo> = page
        .elements
        .iter()
        .filter(|e| e.kind == ElementKind::Input && !e.is_password())
        .filter(|e| !matches!(e.input_type.as_deref(), Some("checkbox" | "radio")))
        .collect();
    let username = text_inputs
        .iter()
        .find(|e| e.input_type.as_deref() == Some("email") || matches_any(e, USERNAME_HINTS))
        .or_else(|| {
            text_inputs
                .iter()
                .find(|e| matches!(e.input_type.as_deref(), None | Some("text")))
        })?;

    Some(LoginForm {
        page_url: page.url.clone(),
        username: (*username).clone(),
        password,
        submit: find_submit(page, LOGIN_SUBMIT_WORDS),
    })
}

/// Every field of a registration page.
pub fn find_registration_form(page: &PageInfo) -> Option<RegistrationForm> {
    if !is_registration_page(page) {
        return None;
    }
    Some(RegistrationForm {
        page_url: page.url.clone(),
        fields: page.fields().cloned().collect(),
        submit: find_submit(page, REGISTER_SUBMIT_WORDS),
    })
}

/// First login and registration forms among `pages`.
pub fn detect(pages: &[PageInfo]) -> AuthDetection {
    AuthDetection {
        login: pages.iter().find_map(find_login_form),
        registration: pages.iter().find_map(find_registration_form),
    }
}

/// Pick how to authenticate.
///
/// | login | register | credentials | strategy |
/// |-------|----------|-------------|----------|
/// | yes   | any      | yes         | login |
/// | no    | yes      | no          | register |
/// | yes   | yes      | no          | register, then login |
/// | otherwise                      || none |
///
/// "register" only applies when there is no login page. With both pages and
/// no credentials the fresh account has to be logged in through the login
/// page afterwards, so that case is register-then-login rather than a bare
/// register.
pub fn determine_auth_strategy(
    has_login: bool,
    has_register: bool,
    has_credentials: bool,
) -> AuthDecision {
    let (strategy, reason) = match (has_login, has_register, has_credentials) {
        (true, _, true) => (AuthStrategy::Login, "login page found and credentials supplied"),
        (false, true, false) => (
            AuthStrategy::Register,
            "registration page found without credentials: creating a fresh account",
        ),
        (true, true, false) => (
            AuthStrategy::RegisterThenLogin,
            "login and registration pages found without credentials: registering, then logging in",
        ),
        _ => (AuthStrategy::None, "no authentication possible"),
    };
    AuthDecision {
        strategy,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, input_type: &str) -> ElementInfo {
        let mut el = ElementInfo::new(ElementKind::Input, format!("[name=\"{}\"]", name));
        el.name = Some(name.into());
        el.input_type = Some(input_type.into());
        el.form_index = Some(0);
        el
    }

    fn button(text: &str) -> ElementInfo {
        let mut el = ElementInfo::new(ElementKind::Button, format!("text={}", text));
        el.text = Some(text.into());
        el.input_type = Some("submit".into());
        el.form_index = Some(0);
        el
    }

    fn page(url: &str, title: &str, elements: Vec<ElementInfo>) -> PageInfo {
        PageInfo {
            url: url.into(),
            title: title.into(),
            elements,
            depth: 0,
            status: Some(200),
        }
    }

    fn login_page() -> PageInfo {
        page(
            "https://app.test/login",
            "Welcome back",
            vec![
                input("remember", "checkbox"),
                input("nickname", "text"),
                input("email", "email"),
                input("password", "password"),
                button("Sign in"),
            ],
        )
    }

    #[test]
    fn test_login_form_fields() {
        let form = find_login_form(&login_page()).unwrap();
        assert_eq!(form.username.name.as_deref(), Some("email"));
        assert_eq!(form.password.name.as_deref(), Some("password"));
        assert_eq!(form.submit.unwrap().text.as_deref(), Some("Sign in"));
    }

    #[test]
    fn test_username_falls_back_to_first_text_input() {
        let p = page(
            "https://app.test/signin",
            "Sign in",
            vec![input("handle", "text"), input("pw", "password")],
        );
        let form = find_login_form(&p).unwrap();
        assert_eq!(form.username.name.as_deref(), Some("handle"));
        assert!(form.submit.is_none());
    }

    #[test]
    fn test_login_requires_password_and_excludes_registration() {
        let no_password = page("https://app.test/login", "Login", vec![input("email", "email")]);
        assert!(!is_login_page(&no_password));

        let register = page(
            "https://app.test/auth/register",
            "Create account",
            vec![input("email", "email"), input("password", "password"), button("Sign up")],
        );
        assert!(!is_login_page(&register));
        let form = find_registration_form(&register).unwrap();
        assert_eq!(form.fields.len(), 2);
        assert_eq!(form.submit.unwrap().text.as_deref(), Some("Sign up"));
    }

    #[test]
    fn test_detect_across_pages() {
        let pages = vec![
            page("https://app.test/", "Home", vec![]),
            login_page(),
        ];
        let detection = detect(&pages);
        assert!(detection.login.is_some());
        assert!(detection.registration.is_none());
    }

    #[test]
    fn test_strategy_table() {
        assert_eq!(determine_auth_strategy(true, false, true).strategy, AuthStrategy::Login);
        assert_eq!(determine_auth_strategy(true, true, true).strategy, AuthStrategy::Login);
        assert_eq!(determine_auth_strategy(false, true, false).strategy, AuthStrategy::Register);
        assert_eq!(
            determine_auth_strategy(true, true, false).strategy,
            AuthStrategy::RegisterThenLogin
        );

        for (login, register, creds) in [
            (true, false, false),
            (false, false, false),
            (false, false, true),
            (false, true, true),
        ] {
            let decision = determine_auth_strategy(login, register, creds);
            assert_eq!(decision.strategy, AuthStrategy::None);
            assert_eq!(decision.reason, "no authentication possible");
        }
    }
}
