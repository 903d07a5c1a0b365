//! CLI contract tests run against the built binary.

use std::fs;

use assert_cmd::Command;
use tempfile::TempDir;

fn runvoy(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("runvoy").expect("binary builds");
    cmd.env_clear()
        .env("HOME", home.path())
        .env("RUNVOY_CONFIG", home.path().join("config.toml"))
        .env("RUST_LOG", "warn");
    cmd
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn help_lists_subcommands() {
    let home = TempDir::new().expect("tempdir");
    let output = runvoy(&home).arg("--help").output().expect("run");
    assert!(output.status.success());
    let text = stdout(&output);
    for sub in ["init-admin", "check-policy", "create-user", "claim", "run", "list", "kill"] {
        assert!(text.contains(sub), "missing {sub} in help:\n{text}");
    }
}

#[test]
fn builtin_policy_has_no_gaps() {
    let home = TempDir::new().expect("tempdir");
    let output = runvoy(&home).arg("check-policy").output().expect("run");
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("developer:"));
    assert!(text.contains("no coverage gaps"));
}

#[test]
fn policy_file_with_gap_fails_the_check() {
    let home = TempDir::new().expect("tempdir");
    let policy = home.path().join("policy.toml");
    fs::write(
        &policy,
        r#"
[[rules]]
role = "admin"
objects = ["/api/v1/users"]
actions = ["read"]
"#,
    )
    .expect("write policy");

    let output = runvoy(&home)
        .env("RUNVOY_POLICY_FILE", &policy)
        .arg("check-policy")
        .output()
        .expect("run");
    assert!(!output.status.success());
    assert!(stdout(&output).contains("gap: admin has read on /api/v1/users"));
}

#[test]
fn init_admin_prints_key_once() {
    let home = TempDir::new().expect("tempdir");
    let output = runvoy(&home)
        .env("RUNVOY_STORAGE_BACKEND", "memory")
        .args(["init-admin", "--email", "admin@example.com"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("API key for admin@example.com"));
    let key = text.lines().last().unwrap_or_default();
    assert!(key.len() >= 40, "unexpected key line {key:?}");
}

#[test]
fn init_admin_twice_conflicts_on_disk() {
    let home = TempDir::new().expect("tempdir");
    let db = home.path().join("state").join("runvoy.db");

    let first = runvoy(&home)
        .env("RUNVOY_DATABASE_PATH", &db)
        .args(["init-admin", "--email", "admin@example.com"])
        .output()
        .expect("run");
    assert!(first.status.success());
    assert!(db.exists());

    let second = runvoy(&home)
        .env("RUNVOY_DATABASE_PATH", &db)
        .args(["init-admin", "--email", "other@example.com"])
        .output()
        .expect("run");
    assert!(!second.status.success());
}

#[test]
fn unknown_claim_token_fails() {
    let home = TempDir::new().expect("tempdir");
    let output = runvoy(&home)
        .env("RUNVOY_STORAGE_BACKEND", "memory")
        .args(["claim", "does-not-exist"])
        .output()
        .expect("run");
    assert!(!output.status.success());
}

#[test]
fn bad_config_is_reported() {
    let home = TempDir::new().expect("tempdir");
    fs::write(home.path().join("config.toml"), "[nonsense]\nvalue = 1\n").expect("write");
    let output = runvoy(&home).arg("check-policy").output().expect("run");
    assert!(!output.status.success());
}
