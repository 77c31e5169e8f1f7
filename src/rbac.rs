//! Role-based access control checks.
//!
//! Each role gets its own authenticated session. A bounded sample of
//! elevated-only URLs is visited from both the elevated and the restricted
//! session; a restricted role that can open one of them is a critical finding.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{LoginFlow, LoginForm};
use crate::browser::{Browser, PageSession, SessionOptions};
use crate::config::Credentials;
use crate::discovery::url::path_of;
use crate::error::{AutotestError, Result};

/// URLs visited per role.
pub const DEFAULT_SAMPLE: usize = 10;

const BLOCKED_PATH_HINTS: &[&str] = &[
    "login",
    "signin",
    "sign-in",
    "auth",
    "forbidden",
    "unauthorized",
    "denied",
    "403",
    "401",
];

/// A role and how to sign in as it. No credentials means anonymous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAccount {
    pub role: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl RoleAccount {
    pub fn new(role: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            role: role.into(),
            credentials: Some(credentials),
        }
    }

    pub fn anonymous(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            credentials: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Info,
}

/// One URL opened as one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RbacProbe {
    pub role: String,
    pub url: String,
    pub expected_access: bool,
    pub actual_access: bool,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RbacFinding {
    pub severity: Severity,
    pub role: String,
    pub url: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RbacReport {
    pub probes: Vec<RbacProbe>,
    pub findings: Vec<RbacFinding>,
}

impl RbacReport {
    pub fn passed(&self) -> usize {
        self.probes.iter().filter(|p| p.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.probes.len() - self.passed()
    }

    pub fn critical(&self) -> impl Iterator<Item = &RbacFinding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
    }
}

/// What a single navigation told us about access.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessObservation {
    pub status: Option<u16>,
    pub final_url: Option<String>,
    pub error: Option<String>,
}

impl AccessObservation {
    fn redirected_away(&self, requested: &str) -> bool {
        let Some(final_url) = &self.final_url else {
            return false;
        };
        let final_path = path_of(final_url).to_lowercase();
        final_path != path_of(requested).to_lowercase()
            && BLOCKED_PATH_HINTS.iter().any(|h| final_path.contains(h))
    }

    /// Blocked: 401/403/404, a login/forbidden redirect, or no navigation at all.
    pub fn is_blocked(&self, requested: &str) -> bool {
        self.error.is_some()
            || matches!(self.status, Some(401 | 403 | 404))
            || self.redirected_away(requested)
    }

    /// Granted: 2xx or unknown status, and not bounced to a login page.
    pub fn is_granted(&self, requested: &str) -> bool {
        self.error.is_none()
            && self.status.map_or(true, |s| (200..300).contains(&s))
            && !self.redirected_away(requested)
    }
}

pub struct RbacTester {
    browser: Arc<dyn Browser>,
    session_options: SessionOptions,
    login_flow: LoginFlow,
    sample: usize,
}

impl RbacTester {
    pub fn new(browser: Arc<dyn Browser>, session_options: SessionOptions) -> Self {
        Self {
            browser,
            session_options,
            login_flow: LoginFlow::new(),
            sample: DEFAULT_SAMPLE,
        }
    }

    pub fn with_login_flow(mut self, flow: LoginFlow) -> Self {
        self.login_flow = flow;
        self
    }

    pub fn with_sample(mut self, sample: usize) -> Self {
        self.sample = sample.max(1);
        self
    }

    /// Visit `elevated_urls` once as the elevated role, then as each
    /// restricted role.
    ///
    /// A role that cannot sign in is reported as a `High` finding and its
    /// visits are skipped; the other roles are still checked. Only fatal
    /// browser errors are returned.
    pub async fn run(
        &self,
        login: Option<&LoginForm>,
        elevated: &RoleAccount,
        restricted: &[RoleAccount],
        elevated_urls: &[String],
    ) -> Result<RbacReport> {
        let urls: Vec<&String> = elevated_urls.iter().take(self.sample).collect();
        tracing::info!(
            "RBAC: probing {} URLs as '{}' and {} restricted roles",
            urls.len(),
            elevated.role,
            restricted.len()
        );
        let mut report = RbacReport::default();
        if urls.is_empty() {
            return Ok(report);
        }

        if let Some(session) = self.sign_in_or_record(login, elevated, &mut report).await? {
            for url in &urls {
                let probe = self.probe(session.as_ref(), &elevated.role, url, true).await;
                if !probe.passed {
                    report.findings.push(RbacFinding {
                        severity: Severity::High,
                        role: elevated.role.clone(),
                        url: url.to_string(),
                        message: format!("'{}' could not open a page it should reach", elevated.role),
                    });
                }
                report.probes.push(probe);
            }
            close_quietly(session.as_ref()).await;
        }

        for account in restricted {
            let Some(session) = self.sign_in_or_record(login, account, &mut report).await? else {
                continue;
            };
            for url in &urls {
                let probe = self.probe(session.as_ref(), &account.role, url, false).await;
                if probe.actual_access {
                    tracing::warn!("RBAC violation: '{}' can open {}", account.role, url);
                    report.findings.push(RbacFinding {
                        severity: Severity::Critical,
                        role: account.role.clone(),
                        url: url.to_string(),
                        message: format!(
                            "'{}' has access to a page reserved for '{}'",
                            account.role, elevated.role
                        ),
                    });
                }
                report.probes.push(probe);
            }
            close_quietly(session.as_ref()).await;
        }

        tracing::info!(
            "RBAC: {} probes passed, {} failed, {} critical",
            report.passed(),
            report.failed(),
            report.critical().count()
        );
        Ok(report)
    }

    /// Sign in, turning a non-fatal failure into a finding.
    async fn sign_in_or_record(
        &self,
        login: Option<&LoginForm>,
        account: &RoleAccount,
        report: &mut RbacReport,
    ) -> Result<Option<Arc<dyn PageSession>>> {
        match self.sign_in(login, account).await {
            Ok(session) => Ok(Some(session)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!("RBAC: could not sign in as '{}': {}", account.role, e);
                report.findings.push(RbacFinding {
                    severity: Severity::High,
                    role: account.role.clone(),
                    url: login.map(|f| f.page_url.clone()).unwrap_or_default(),
                    message: format!("could not sign in as '{}', access not verified: {}", account.role, e),
                });
                Ok(None)
            }
        }
    }

    async fn sign_in(
        &self,
        login: Option<&LoginForm>,
        account: &RoleAccount,
    ) -> Result<Arc<dyn PageSession>> {
        let session = self
            .browser
            .new_session(self.session_options.clone())
            .await
            .map_err(|e| AutotestError::Fatal(format!("could not open session: {}", e)))?;
        let Some(credentials) = &account.credentials else {
            return Ok(session);
        };
        let outcome = match login {
            Some(form) => self
                .login_flow
                .login(session.as_ref(), form, credentials)
                .await
                .map(|_| ()),
            None => Err(AutotestError::Authentication(format!(
                "no login form to sign in as '{}'",
                account.role
            ))),
        };
        match outcome {
            Ok(()) => Ok(session),
            Err(e) => {
                close_quietly(session.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn probe(
        &self,
        session: &dyn PageSession,
        role: &str,
        url: &str,
        expected_access: bool,
    ) -> RbacProbe {
        let observation = observe(session, url, self.session_options.timeouts.navigation()).await;
        let actual_access = observation.is_granted(url);
        let passed = if expected_access {
            actual_access
        } else {
            observation.is_blocked(url)
        };
        tracing::debug!(
            "RBAC {} {} status={:?} access={} passed={}",
            role,
            url,
            observation.status,
            actual_access,
            passed
        );
        RbacProbe {
            role: role.to_string(),
            url: url.to_string(),
            expected_access,
            actual_access,
            passed,
            status: observation.status,
            final_url: observation.final_url,
            error: observation.error,
        }
    }
}

async fn observe(session: &dyn PageSession, url: &str, timeout: Duration) -> AccessObservation {
    match tokio::time::timeout(timeout, session.navigate(url)).await {
        Ok(Ok(nav)) => AccessObservation {
            status: nav.status,
            final_url: Some(nav.url),
            error: None,
        },
        Ok(Err(e)) => AccessObservation {
            status: None,
            final_url: None,
            error: Some(e.to_string()),
        },
        Err(_) => AccessObservation {
            status: None,
            final_url: None,
            error: Some(format!("navigation timed out after {:?}", timeout)),
        },
    }
}

async fn close_quietly(session: &dyn PageSession) {
    if let Err(e) = session.close().await {
        tracing::debug!("Closing RBAC session failed: {}", e);
    }
}
