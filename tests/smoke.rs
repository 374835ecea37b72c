//! Smoke tests -- verify the binary runs and the CLI surface is intact.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("linkshaper")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Keeps RouterOS queue limits tracking a DSL line's attainable rate",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("linkshaper")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("linkshaper"));
}

#[test]
fn test_adjust_subcommand_exists() {
    Command::cargo_bin("linkshaper")
        .unwrap()
        .args(["adjust", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--dry-run"));
}

#[test]
fn test_show_subcommand_exists() {
    Command::cargo_bin("linkshaper")
        .unwrap()
        .args(["show", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--json"));
}

#[test]
fn test_missing_explicit_config_is_fatal() {
    Command::cargo_bin("linkshaper")
        .unwrap()
        .args(["--config", "/nonexistent/linkshaper.toml", "adjust", "--dry-run"])
        .assert()
        .failure();
}
