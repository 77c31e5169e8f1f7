//! Login and registration execution with verification.

use std::time::Duration;

use crate::browser::{capture_auth_state, PageSession};
use crate::config::Credentials;
use crate::discovery::locator::{attribute_selector, id_selector};
use crate::discovery::url::normalize_url;
use crate::error::{AutotestError, Result};
use crate::generation::values::{FieldValue, GeneratedIdentity};
use crate::models::{AuthState, ElementInfo};

use super::detector::{AuthDecision, AuthDetection, AuthStrategy, LoginForm, RegistrationForm};

const SUCCESS_KEYWORDS: &[&str] = &[
    "welcome",
    "dashboard",
    "logout",
    "log out",
    "sign out",
    "signed in",
    "my account",
];

const ERROR_KEYWORDS: &[&str] = &[
    "invalid",
    "incorrect",
    "wrong password",
    "failed",
    "try again",
    "not recognized",
    "error",
];

/// Locators to try for a field, most specific first.
pub fn field_locators(el: &ElementInfo) -> Vec<String> {
    let mut locators = Vec::new();
    if let Some(id) = el.id.as_deref().filter(|s| !s.is_empty()) {
        locators.push(id_selector(id));
    }
    if let Some(name) = el.name.as_deref().filter(|s| !s.is_empty()) {
        locators.push(attribute_selector("name", name));
    }
    if let Some(placeholder) = el.placeholder.as_deref().filter(|s| !s.is_empty()) {
        locators.push(attribute_selector("placeholder", placeholder));
    }
    if let Some(text) = el.text.as_deref().filter(|s| !s.trim().is_empty()) {
        if el.kind.is_clickable() {
            locators.push(format!("text={}", text.trim()));
        }
    }
    if !locators.contains(&el.locator) {
        locators.push(el.locator.clone());
    }
    locators
}

/// Fill `value` trying each locator until one works.
pub async fn fill_field(
    session: &dyn PageSession,
    el: &ElementInfo,
    value: &FieldValue,
) -> anyhow::Result<String> {
    let mut last_error = None;
    for locator in field_locators(el) {
        let attempt = match value {
            FieldValue::Text(text) => session.fill(&locator, text).await,
            FieldValue::Choice(option) => session.select(&locator, option).await,
            FieldValue::Check => session.set_checked(&locator, true).await,
            FieldValue::Skip => return Ok(locator),
        };
        match attempt {
            Ok(()) => return Ok(locator),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no locator for field {}", el.locator)))
}

/// Click the submit control, or press Enter when there is none or it fails.
pub async fn submit_form(session: &dyn PageSession, submit: Option<&ElementInfo>) -> anyhow::Result<()> {
    if let Some(button) = submit {
        for locator in field_locators(button) {
            if session.click(&locator).await.is_ok() {
                return Ok(());
            }
        }
        tracing::debug!("Submit control not clickable, pressing Enter");
    }
    session.press("Enter").await
}

fn same_page(a: &str, b: &str) -> bool {
    match (normalize_url(a), normalize_url(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

/// Executes and verifies login and registration.
#[derive(Debug, Clone)]
pub struct LoginFlow {
    /// Extra wait before concluding a submit did not navigate
    settle_delay: Duration,
    idle_wait: Duration,
}

impl Default for LoginFlow {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            idle_wait: Duration::from_secs(5),
        }
    }
}

impl LoginFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Log in with `credentials` and capture the resulting session state.
    pub async fn login(
        &self,
        session: &dyn PageSession,
        form: &LoginForm,
        credentials: &Credentials,
    ) -> Result<AuthState> {
        tracing::info!("Logging in as {} at {}", credentials.username, form.page_url);
        session
            .navigate(&form.page_url)
            .await
            .map_err(|e| AutotestError::Authentication(format!("login page unreachable: {}", e)))?;

        let fields = [
            (&form.username, FieldValue::Text(credentials.username.clone())),
            (&form.password, FieldValue::Text(credentials.password.clone())),
        ];
        for (el, value) in &fields {
            fill_field(session, el, value).await.map_err(|e| {
                AutotestError::Authentication(format!("could not fill {}: {}", el.locator, e))
            })?;
        }
        submit_form(session, form.submit.as_ref())
            .await
            .map_err(|e| AutotestError::Authentication(format!("could not submit login: {}", e)))?;

        self.verify(session, &form.page_url).await?;
        capture_auth_state(session)
            .await
            .map_err(|e| AutotestError::Authentication(format!("could not capture session: {}", e)))
    }

    /// Register a fresh account; returns its credentials and session state.
    pub async fn register(
        &self,
        session: &dyn PageSession,
        form: &RegistrationForm,
    ) -> Result<(Credentials, AuthState)> {
        let identity = GeneratedIdentity::fresh();
        tracing::info!("Registering {} at {}", identity.email, form.page_url);
        session.navigate(&form.page_url).await.map_err(|e| {
            AutotestError::Authentication(format!("registration page unreachable: {}", e))
        })?;

        let mut used_email = false;
        for el in &form.fields {
            let value = identity.value_for(el);
            if value == FieldValue::Text(identity.email.clone()) {
                used_email = true;
            }
            if let Err(e) = fill_field(session, el, &value).await {
                // Optional fields may be hidden until earlier ones are filled
                tracing::debug!("Skipping registration field {}: {}", el.locator, e);
            }
        }
        submit_form(session, form.submit.as_ref()).await.map_err(|e| {
            AutotestError::Authentication(format!("could not submit registration: {}", e))
        })?;

        self.verify(session, &form.page_url).await?;
        let state = capture_auth_state(session)
            .await
            .map_err(|e| AutotestError::Authentication(format!("could not capture session: {}", e)))?;

        let credentials = Credentials {
            username: if used_email {
                identity.email
            } else {
                identity.username
            },
            password: identity.password,
        };
        Ok((credentials, state))
    }

    /// Register, then log in with the generated identity.
    pub async fn register_then_login(
        &self,
        session: &dyn PageSession,
        registration: &RegistrationForm,
        login: &LoginForm,
    ) -> Result<(Credentials, AuthState)> {
        let (credentials, _) = self.register(session, registration).await?;
        let state = self.login(session, login, &credentials).await?;
        Ok((credentials, state))
    }

    /// Carry out `decision`. `Ok(None)` when the strategy is `None`.
    pub async fn authenticate(
        &self,
        session: &dyn PageSession,
        detection: &AuthDetection,
        decision: &AuthDecision,
        credentials: Option<&Credentials>,
    ) -> Result<Option<AuthState>> {
        let missing = |what: &str| AutotestError::Authentication(format!("no {} detected", what));
        match decision.strategy {
            AuthStrategy::None => Ok(None),
            AuthStrategy::Login => {
                let form = detection.login.as_ref().ok_or_else(|| missing("login form"))?;
                let credentials =
                    credentials.ok_or_else(|| AutotestError::Authentication("no credentials".into()))?;
                self.login(session, form, credentials).await.map(Some)
            }
            AuthStrategy::Register => {
                let form = detection
                    .registration
                    .as_ref()
                    .ok_or_else(|| missing("registration form"))?;
                self.register(session, form).await.map(|(_, state)| Some(state))
            }
            AuthStrategy::RegisterThenLogin => {
                let registration = detection
                    .registration
                    .as_ref()
                    .ok_or_else(|| missing("registration form"))?;
                let login = detection.login.as_ref().ok_or_else(|| missing("login form"))?;
                self.register_then_login(session, registration, login)
                    .await
                    .map(|(_, state)| Some(state))
            }
        }
    }

    /// Success iff we left the auth page (or see a success keyword) and no
    /// error keyword is visible. Still on the auth page after the settle
    /// delay means failure.
    async fn verify(&self, session: &dyn PageSession, auth_url: &str) -> Result<()> {
        let _ = session.wait_idle(self.idle_wait).await;
        let read_url = || async {
            session
                .current_url()
                .await
                .map_err(|e| AutotestError::Authentication(e.to_string()))
        };

        let mut url = read_url().await?;
        if same_page(&url, auth_url) {
            tokio::time::sleep(self.settle_delay).await;
            url = read_url().await?;
            if same_page(&url, auth_url) {
                return Err(AutotestError::Authentication(format!(
                    "still on {} after submitting",
                    auth_url
                )));
            }
        }

        let text = session.page_text().await.unwrap_or_default().to_lowercase();
        let url_changed = !same_page(&url, auth_url);
        let success_visible = SUCCESS_KEYWORDS.iter().any(|k| text.contains(k));
        let error_visible = ERROR_KEYWORDS.iter().find(|k| text.contains(*k));

        match error_visible {
            Some(keyword) => Err(AutotestError::Authentication(format!(
                "error indicator '{}' visible after submit",
                keyword
            ))),
            None if url_changed || success_visible => {
                tracing::info!("Authentication verified (now at {})", url);
                Ok(())
            }
            None => Err(AutotestError::Authentication(
                "no sign of a successful login".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::detector::detect;
    use crate::browser::mock::{Access, MockBrowser, MockElement, MockPage, MockSite, SubmitBehavior};
    use crate::browser::{Browser, SessionOptions};
    use crate::discovery::crawler::{CrawlOptions, WebsiteCrawler};
    use crate::models::ElementKind;
    use std::sync::Arc;

    fn site() -> MockSite {
        MockSite::new("https://app.test")
            .page(
                MockPage::new("/", "Home")
                    .element(MockElement::link("Log in", "/login"))
                    .element(MockElement::link("Sign up", "/register")),
            )
            .page(
                MockPage::new("/login", "Login")
                    .element(MockElement::form(0))
                    .element(MockElement::input("email", "email").id("email").in_form(0))
                    .element(MockElement::input("password", "password").id("password").in_form(0))
                    .element(MockElement::button("Sign in").in_form(0))
                    .on_submit(SubmitBehavior::Login {
                        redirect: "/dashboard".into(),
                    }),
            )
            .page(
                MockPage::new("/register", "Create account")
                    .element(MockElement::form(0))
                    .element(MockElement::input("email", "email").in_form(0))
                    .element(MockElement::input("password", "password").in_form(0))
                    .element(MockElement::input("terms", "checkbox").in_form(0))
                    .element(MockElement::button("Sign up").in_form(0))
                    .on_submit(SubmitBehavior::Register {
                        redirect: "/dashboard".into(),
                    }),
            )
            .page(
                MockPage::new("/dashboard", "Dashboard")
                    .text("Welcome back")
                    .access(Access::Authenticated),
            )
            .login_page("/login")
            .account("alice@app.test", "secret", "user")
    }

    async fn setup() -> (Arc<MockBrowser>, AuthDetection) {
        let browser = Arc::new(MockBrowser::new(Arc::new(site())));
        let crawler = WebsiteCrawler::new(
            browser.clone(),
            SessionOptions::default(),
            CrawlOptions {
                max_pages: 10,
                max_depth: 2,
                idle_wait: Duration::ZERO,
            },
        );
        let map = crawler.crawl("https://app.test/").await.unwrap();
        (browser, detect(&map.pages))
    }

    fn flow() -> LoginFlow {
        LoginFlow::new().with_settle_delay(Duration::from_millis(10))
    }

    #[test]
    fn test_field_locator_order() {
        let mut el = ElementInfo::new(ElementKind::Input, "body > input:nth-of-type(1)");
        el.id = Some("user".into());
        el.name = Some("username".into());
        el.placeholder = Some("Your name".into());
        assert_eq!(
            field_locators(&el),
            vec![
                "#user".to_string(),
                r#"[name="username"]"#.to_string(),
                r#"[placeholder="Your name"]"#.to_string(),
                "body > input:nth-of-type(1)".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_login_success_captures_state() {
        let (browser, detection) = setup().await;
        let session = browser.new_session(SessionOptions::default()).await.unwrap();
        let creds = Credentials {
            username: "alice@app.test".into(),
            password: "secret".into(),
        };
        let state = flow()
            .login(session.as_ref(), detection.login.as_ref().unwrap(), &creds)
            .await
            .unwrap();
        assert_eq!(state.cookies[0].value, "alice@app.test");
        assert_eq!(
            state.local_storage.items.get("currentUser").map(String::as_str),
            Some("alice@app.test")
        );
    }

    #[tokio::test]
    async fn test_wrong_password_is_an_authentication_error() {
        let (browser, detection) = setup().await;
        let session = browser.new_session(SessionOptions::default()).await.unwrap();
        let creds = Credentials {
            username: "alice@app.test".into(),
            password: "nope".into(),
        };
        let err = flow()
            .login(session.as_ref(), detection.login.as_ref().unwrap(), &creds)
            .await
            .unwrap_err();
        assert!(matches!(err, AutotestError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_register_then_login_uses_generated_identity() {
        let (browser, detection) = setup().await;
        let session = browser.new_session(SessionOptions::default()).await.unwrap();
        let (creds, state) = flow()
            .register_then_login(
                session.as_ref(),
                detection.registration.as_ref().unwrap(),
                detection.login.as_ref().unwrap(),
            )
            .await
            .unwrap();
        assert!(creds.username.starts_with("autotest_"));
        assert!(creds.username.ends_with("@example.com"));
        assert!(browser.site().has_account(&creds.username));
        assert!(!state.is_empty());
    }
}
