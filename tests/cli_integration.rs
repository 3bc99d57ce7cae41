//! Integration tests for the oss-dev CLI

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

/// Get a Command for the oss-dev binary, isolated from the user's settings
/// and environment.
fn oss_dev(home: &Path) -> Command {
    let mut cmd = Command::new(cargo::cargo_bin!("oss-dev"));
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env_remove("GEMINI_API_KEY")
        .env_remove("GITHUB_TOKEN")
        .env_remove("OSS_DEV_MAX_COST")
        .env_remove("OSS_DEV_LOG_LEVEL")
        .env_remove("OSS_DEV_MAX_ATTEMPTS")
        .env_remove("OSS_DEV_SANDBOX")
        .env_remove("OSS_DEV_MODEL");
    cmd
}

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

#[test]
fn test_help() {
    let home = TempDir::new().unwrap();
    oss_dev(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Fix a GitHub issue"))
        .stdout(predicate::str::contains("detect"));
}

#[test]
fn test_version() {
    let home = TempDir::new().unwrap();
    oss_dev(home.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_fix_help_lists_options() {
    let home = TempDir::new().unwrap();
    oss_dev(home.path())
        .args(["fix", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--max-attempts"))
        .stdout(predicate::str::contains("--sandbox"));
}

// ============================================================================
// detect
// ============================================================================

#[test]
fn test_detect_node_project() {
    let home = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    write(project.path(), "package.json", "{}");

    oss_dev(home.path())
        .arg("detect")
        .arg(project.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("javascript"))
        .stdout(predicate::str::contains("npm test"));
}

#[test]
fn test_detect_json_for_subdirectory_project() {
    let home = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    write(project.path(), "backend/go.mod", "module example.com/api\n");

    let output = oss_dev(home.path())
        .args(["detect", "--json"])
        .arg(project.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["language"], "go");
    assert_eq!(json["test_command"], "cd backend && go test ./...");
}

#[test]
fn test_detect_unsupported_project_fails() {
    let home = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    write(project.path(), "README.md", "# nothing to build");

    oss_dev(home.path())
        .arg("detect")
        .arg(project.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unsupported language"));
}

// ============================================================================
// fix
// ============================================================================

#[test]
fn test_fix_rejects_non_github_url() {
    let home = TempDir::new().unwrap();
    oss_dev(home.path())
        .arg("--project")
        .arg(home.path())
        .args(["fix", "https://gitlab.com/acme/widgets/issues/3"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid GitHub issue URL"))
        .stderr(predicate::str::contains("Hint:"));
}

#[test]
fn test_fix_rejects_non_numeric_issue() {
    let home = TempDir::new().unwrap();
    oss_dev(home.path())
        .arg("--project")
        .arg(home.path())
        .args(["fix", "https://github.com/acme/widgets/issues/abc"])
        .assert()
        .code(2);
}

#[test]
fn test_fix_rejects_unknown_sandbox() {
    let home = TempDir::new().unwrap();
    oss_dev(home.path())
        .args([
            "fix",
            "https://github.com/acme/widgets/issues/3",
            "--sandbox",
            "vm",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown sandbox backend"));
}

// ============================================================================
// config
// ============================================================================

#[test]
fn test_config_show_defaults() {
    let home = TempDir::new().unwrap();
    oss_dev(home.path())
        .arg("--project")
        .arg(home.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max_attempts = 5"))
        .stdout(predicate::str::contains("provider = \"gemini\""));
}

#[test]
fn test_config_show_merges_project_file_and_env() {
    let home = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    write(
        project.path(),
        ".oss-dev.toml",
        "max_attempts = 3\n\n[sandbox]\nbackend = \"local\"\n",
    );

    let output = oss_dev(home.path())
        .env("OSS_DEV_MAX_COST", "0.5")
        .arg("--project")
        .arg(project.path())
        .args(["config", "show", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["max_attempts"], 3);
    assert_eq!(json["sandbox"]["backend"], "local");
    assert_eq!(json["sandbox"]["command_timeout_secs"], 900);
    assert_eq!(json["max_cost_usd"], 0.5);
}

#[test]
#[cfg(target_os = "linux")]
fn test_config_show_user_file_is_overridden_by_project() {
    let home = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    write(
        home.path(),
        ".config/oss-dev/config.toml",
        "max_attempts = 8\ngithub_token_env = \"GH_PAT\"\n",
    );
    write(project.path(), ".oss-dev.toml", "max_attempts = 2\n");

    oss_dev(home.path())
        .arg("--project")
        .arg(project.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max_attempts = 2"))
        .stdout(predicate::str::contains("github_token_env = \"GH_PAT\""));
}

#[test]
fn test_malformed_project_file_is_config_error() {
    let home = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    write(project.path(), ".oss-dev.toml", "max_attempts = [");

    oss_dev(home.path())
        .arg("--project")
        .arg(project.path())
        .args(["config", "show"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("invalid TOML"));
}

#[test]
fn test_config_validate_reports_missing_key() {
    let home = TempDir::new().unwrap();
    oss_dev(home.path())
        .arg("--project")
        .arg(home.path())
        .args(["config", "validate"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("GEMINI_API_KEY"));
}

#[test]
fn test_config_validate_passes_with_key() {
    let home = TempDir::new().unwrap();
    oss_dev(home.path())
        .env("GEMINI_API_KEY", "test-key")
        .arg("--project")
        .arg(home.path())
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("settings are valid"))
        .stdout(predicate::str::contains("GITHUB_TOKEN not set"));
}

#[test]
fn test_config_validate_rejects_zero_attempts() {
    let home = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    write(project.path(), ".oss-dev.toml", "max_attempts = 0\n");

    oss_dev(home.path())
        .env("GEMINI_API_KEY", "test-key")
        .arg("--project")
        .arg(project.path())
        .args(["config", "validate"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("max_attempts"));
}

#[test]
fn test_config_validate_claude_needs_no_key() {
    let home = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    write(
        project.path(),
        ".oss-dev.toml",
        "[llm]\nprovider = \"claude\"\nmodel = \"sonnet\"\n",
    );

    oss_dev(home.path())
        .arg("--project")
        .arg(project.path())
        .args(["config", "validate"])
        .assert()
        .success();
}

#[test]
fn test_config_paths() {
    let home = TempDir::new().unwrap();
    oss_dev(home.path())
        .arg("--project")
        .arg(home.path())
        .args(["config", "paths"])
        .assert()
        .success()
        .stdout(predicate::str::contains(".oss-dev.toml"))
        .stdout(predicate::str::contains("config.toml"));
}
