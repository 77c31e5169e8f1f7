//! Full pipeline runs against the scripted browser.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use autotest::auth::{AuthStrategy, LoginFlow};
use autotest::browser::mock::{Access, MockElement, MockLauncher, MockPage, MockSite, SubmitBehavior};
use autotest::config::{CrawlDepth, Credentials, PanelConfig, PanelRole};
use autotest::execution::TestStatus;
use autotest::sink::{CoreEvent, MemorySink, ResultSink};
use autotest::{
    AutonomousTestingOrchestrator, Collaborators, MultiPanelConfig, MultiPanelOrchestrator, Phase,
    RunConfig,
};

fn login_page() -> MockPage {
    MockPage::new("/login", "Login")
        .element(MockElement::form(0))
        .element(MockElement::input("username", "text").id("username").in_form(0))
        .element(MockElement::input("password", "password").id("password").in_form(0))
        .element(MockElement::button("Sign in").in_form(0))
        .on_submit(SubmitBehavior::Login {
            redirect: "/home".into(),
        })
}

/// Five public pages, one of them a login page.
fn brochure_site() -> MockSite {
    MockSite::new("https://app.test")
        .page(
            MockPage::new("/", "Acme")
                .element(MockElement::link("About", "/about"))
                .element(MockElement::link("Pricing", "/pricing"))
                .element(MockElement::link("Contact", "/contact"))
                .element(MockElement::link("Log in", "/login")),
        )
        .page(MockPage::new("/about", "About Acme"))
        .page(MockPage::new("/pricing", "Pricing"))
        .page(MockPage::new("/contact", "Contact us"))
        .page(login_page())
        .login_page("/login")
        .account("alice", "secret", "user")
}

fn members_site() -> MockSite {
    brochure_site()
        .page(
            MockPage::new("/", "Acme")
                .element(MockElement::link("About", "/about"))
                .element(MockElement::link("Log in", "/login"))
                .element(MockElement::link("Members", "/home")),
        )
        .page(
            MockPage::new("/home", "Members area")
                .access(Access::Authenticated)
                .element(MockElement::link("Projects", "/projects")),
        )
        .page(MockPage::new("/projects", "Projects").access(Access::Authenticated))
}

fn orchestrator(launcher: Arc<MockLauncher>) -> AutonomousTestingOrchestrator {
    AutonomousTestingOrchestrator::new(launcher)
        .with_login_flow(LoginFlow::new().with_settle_delay(Duration::ZERO))
        .with_crawl_idle_wait(Duration::ZERO)
}

fn config(dir: &Path) -> RunConfig {
    RunConfig {
        output_dir: Some(dir.to_path_buf()),
        parallel_workers: 3,
        ..RunConfig::for_website("https://app.test/")
    }
}

#[tokio::test]
async fn test_login_only_site_without_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(MockLauncher::new(brochure_site()));
    let orchestrator = orchestrator(launcher.clone());

    let result = orchestrator.run("brochure", &config(dir.path())).await.unwrap();

    let auth = result.report.auth.as_ref().unwrap();
    assert_eq!(auth.decision.strategy, AuthStrategy::None);
    assert_eq!(auth.decision.reason, "no authentication possible");
    assert!(!auth.authenticated);

    let website = result.application_map.website.as_ref().unwrap();
    assert_eq!(website.pages.len(), 5);
    let navigation = result
        .report
        .results
        .iter()
        .filter(|r| r.name.starts_with("Navigate to"))
        .count();
    assert!(navigation >= 5);

    assert!(result.success);
    assert_eq!(
        result.tests_passed + result.tests_failed + result.tests_healed,
        result.tests_generated
    );
    assert_eq!(result.report.results.len(), result.tests_generated);
    assert_eq!(launcher.browsers()[0].close_calls(), 1);
}

#[tokio::test]
async fn test_navigation_tests_pass_on_healthy_site() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(MockLauncher::new(brochure_site()));
    let result = orchestrator(launcher)
        .run("healthy", &config(dir.path()))
        .await
        .unwrap();

    for r in result.report.results.iter().filter(|r| r.name.starts_with("Navigate to")) {
        assert_eq!(r.status, TestStatus::Passed, "{} failed: {:?}", r.name, r.error);
    }
    assert!(dir.path().join("healthy").join("report.json").exists());
    assert!(dir.path().join("healthy").join("junit.xml").exists());
}

#[tokio::test]
async fn test_credentials_unlock_authenticated_pages() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(MockLauncher::new(members_site()));
    let mut config = config(dir.path());
    config.authentication = Some(Credentials {
        username: "alice".into(),
        password: "secret".into(),
    });

    let result = orchestrator(launcher).run("members", &config).await.unwrap();

    let auth = result.report.auth.as_ref().unwrap();
    assert_eq!(auth.decision.strategy, AuthStrategy::Login);
    assert!(auth.authenticated);

    let website = result.application_map.website.as_ref().unwrap();
    assert!(website.has_page("https://app.test/projects"));

    // Executor sessions carry the captured login
    let projects = result
        .report
        .results
        .iter()
        .find(|r| r.name == "Navigate to /projects")
        .unwrap();
    assert_eq!(projects.status, TestStatus::Passed, "{:?}", projects.error);
}

#[tokio::test]
async fn test_wrong_credentials_continue_unauthenticated() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(MockLauncher::new(members_site()));
    let mut config = config(dir.path());
    config.authentication = Some(Credentials {
        username: "alice".into(),
        password: "wrong".into(),
    });

    let result = orchestrator(launcher).run("wrong", &config).await.unwrap();
    let auth = result.report.auth.as_ref().unwrap();
    assert_eq!(auth.decision.strategy, AuthStrategy::Login);
    assert!(!auth.authenticated);
    assert!(auth.error.is_some());
    assert!(!result
        .application_map
        .website
        .as_ref()
        .unwrap()
        .has_page("https://app.test/projects"));
}

#[tokio::test]
async fn test_progress_phases_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(MockLauncher::new(brochure_site()));
    let orchestrator = orchestrator(launcher);
    let mut rx = orchestrator.progress().subscribe();

    orchestrator.run("progress", &config(dir.path())).await.unwrap();

    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    assert!(updates.windows(2).all(|w| w[0].progress <= w[1].progress));
    let phases: Vec<Phase> = updates.iter().map(|u| u.phase).collect();
    for phase in [
        Phase::Discovery,
        Phase::Authentication,
        Phase::Generation,
        Phase::Execution,
        Phase::Analysis,
        Phase::Report,
    ] {
        assert!(phases.contains(&phase), "missing {:?}", phase);
    }
    assert!(!phases.contains(&Phase::AuthenticatedDiscovery));
    assert_eq!(updates.last().unwrap().phase, Phase::Completed);
    assert_eq!(updates.last().unwrap().progress, 100.0);
}

#[tokio::test]
async fn test_sink_receives_every_result() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(MockLauncher::new(brochure_site()));
    let sink = Arc::new(MemorySink::new());
    let orchestrator = orchestrator(launcher).with_collaborators(Collaborators {
        sink: Some(sink.clone() as Arc<dyn ResultSink>),
        ..Collaborators::default()
    });

    let result = orchestrator.run("sink", &config(dir.path())).await.unwrap();

    let events = sink.events();
    let completed = events
        .iter()
        .filter(|e| matches!(e, CoreEvent::TestCompleted(_)))
        .count();
    let analyses = events
        .iter()
        .filter(|e| matches!(e, CoreEvent::Analysis(_)))
        .count();
    assert_eq!(completed, result.tests_generated);
    assert_eq!(analyses, result.tests_failed);
}

fn panel_site() -> MockSite {
    MockSite::new("https://app.test")
        .page(
            MockPage::new("/", "Acme")
                .element(MockElement::link("Log in", "/login"))
                .element(MockElement::link("Home", "/home")),
        )
        .page(login_page())
        .page(
            MockPage::new("/home", "Home")
                .access(Access::Authenticated)
                .element(MockElement::link("Admin", "/admin")),
        )
        .page(
            MockPage::new("/admin", "Admin")
                .access(Access::Role("admin".into()))
                .element(MockElement::link("Users", "/admin/users"))
                .element(MockElement::link("Reports", "/admin/reports")),
        )
        .page(MockPage::new("/admin/users", "Users").access(Access::Role("admin".into())))
        // Any signed-in user gets in
        .page(MockPage::new("/admin/reports", "Reports").access(Access::Authenticated))
        .login_page("/login")
        .account("bob", "pw-user", "user")
        .account("root", "pw-admin", "admin")
}

#[tokio::test]
async fn test_multi_panel_finds_leaky_admin_page() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(MockLauncher::new(panel_site()));
    let mut base = config(dir.path());
    base.depth = CrawlDepth::Deep;
    let panel = |role, credentials: Option<(&str, &str)>| PanelConfig {
        role,
        url: None,
        credentials: credentials.map(|(u, p)| Credentials {
            username: u.into(),
            password: p.into(),
        }),
    };
    let config = MultiPanelConfig {
        base,
        panels: vec![
            panel(PanelRole::Public, None),
            panel(PanelRole::User, Some(("bob", "pw-user"))),
            panel(PanelRole::Admin, Some(("root", "pw-admin"))),
        ],
    };

    let orchestrator = MultiPanelOrchestrator::new(orchestrator(launcher.clone()));
    let report = orchestrator.run("panels", &config).await.unwrap();

    assert_eq!(report.panels.len(), 3);
    assert_eq!(launcher.browsers().len(), 1);
    assert_eq!(launcher.browsers()[0].close_calls(), 1);

    let admin_only = &report.coverage.admin_only_pages;
    assert!(admin_only.contains(&"/admin".to_string()));
    assert!(admin_only.contains(&"/admin/reports".to_string()));
    assert!(!admin_only.contains(&"/home".to_string()));

    let rbac = report.rbac.as_ref().unwrap();
    let critical: Vec<_> = rbac.critical().collect();
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].role, "user");
    assert_eq!(critical[0].url, "https://app.test/admin/reports");

    let admin_urls: Vec<&str> = rbac
        .probes
        .iter()
        .filter(|p| p.role == "admin")
        .map(|p| p.url.as_str())
        .collect();
    let distinct: std::collections::BTreeSet<&str> = admin_urls.iter().copied().collect();
    assert_eq!(admin_urls.len(), distinct.len());
    assert_eq!(admin_urls.len(), admin_only.len());

    let public_admin = rbac
        .probes
        .iter()
        .find(|p| p.role == "public" && p.url == "https://app.test/admin")
        .unwrap();
    assert!(public_admin.passed);
    assert!(!public_admin.actual_access);

    assert!(dir.path().join("panels").join("composite.json").exists());
    assert!(report.to_console().contains("[CRITICAL] https://app.test/admin/reports"));
}
