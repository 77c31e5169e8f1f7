//! CLI smoke tests.
//!
//! Runs that need Chrome are not exercised here; see `e2e.rs` for the full
//! pipeline against the scripted browser.

use std::process::Command;

fn autotest() -> Command {
    Command::new(env!("CARGO_BIN_EXE_autotest"))
}

#[test]
fn test_help_command() {
    let output = autotest().arg("--help").output().expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    for subcommand in ["run", "panels", "crawl"] {
        assert!(stdout.contains(subcommand), "help should list '{}'", subcommand);
    }
}

#[test]
fn test_version_command() {
    let output = autotest().arg("--version").output().expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("autotest"), "version should name the binary");
}

#[test]
fn test_run_without_target_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = autotest()
        .args(["run", "--output"])
        .arg(dir.path())
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("websiteUrl or apiUrl"), "stderr was: {}", stderr);
}

#[test]
fn test_username_requires_password() {
    let output = autotest()
        .args(["run", "--url", "https://app.test", "--username", "alice"])
        .output()
        .expect("Failed to execute command");
    assert!(!output.status.success());
}
