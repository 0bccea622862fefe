//! Focused CLI argument parsing tests.
//!
//! Tests that verify command-line argument parsing and the config commands
//! without starting a view service or a node.

#![allow(deprecated)] // Command::cargo_bin is deprecated but replacement requires newer assert_cmd

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn tandem() -> Command {
    Command::cargo_bin("tandem").unwrap()
}

// ============================================================================
// Commands That Need No Cluster
// ============================================================================

#[test]
fn version_command_lists_wire_protocol() {
    tandem()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("Frame header: 8 bytes"))
        .stdout(predicate::str::contains("Max payload:  16 MiB"))
        .stdout(predicate::str::contains("10  HeartbeatOk"));
}

#[test]
fn version_flag_shows_version() {
    tandem()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tandem"));
}

#[test]
fn help_flag_shows_usage() {
    tandem()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("primary-backup"));
}

#[test]
fn config_show_prints_toml() {
    let temp = TempDir::new().unwrap();
    tandem()
        .args(["config", "show", "--project-dir"])
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("[timing]"))
        .stdout(predicate::str::contains("heartbeat_interval_ms = 500"));
}

#[test]
fn config_show_reads_project_file() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("tandem.toml"),
        "[node]\nname = \"alpha\"\n",
    )
    .unwrap();

    tandem()
        .args(["config", "show", "--format", "text", "--project-dir"])
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Name: alpha"));
}

#[test]
fn config_init_writes_file_once() {
    let temp = TempDir::new().unwrap();

    tandem()
        .args(["config", "init", "--project-dir"])
        .arg(temp.path())
        .assert()
        .success();
    assert!(temp.path().join("tandem.toml").exists());

    tandem()
        .args(["config", "init", "--project-dir"])
        .arg(temp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    tandem()
        .args(["config", "init", "--force", "--project-dir"])
        .arg(temp.path())
        .assert()
        .success();
}

// ============================================================================
// Argument Errors
// ============================================================================

#[test]
fn no_command_shows_help() {
    tandem()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn node_requires_a_name() {
    let temp = TempDir::new().unwrap();
    tandem()
        .args(["node", "--project-dir"])
        .arg(temp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("participant name"));
}

#[test]
fn invalid_listen_address_rejected() {
    tandem()
        .args(["node", "--name", "a", "--listen", "not-an-address"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn invalid_parameter_rejected() {
    tandem()
        .args(["view-service", "--n", "many"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn missing_explicit_config_file_fails() {
    let temp = TempDir::new().unwrap();
    tandem()
        .args(["config", "show", "--project-dir"])
        .arg(temp.path())
        .arg("--config")
        .arg(temp.path().join("absent.toml"))
        .assert()
        .failure();
}

#[test]
fn unrecognized_command_shows_error() {
    tandem()
        .arg("replicate-everything")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

// ============================================================================
// Help Text
// ============================================================================

#[test]
fn node_help_shows_flags() {
    tandem()
        .args(["node", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--view-service"))
        .stdout(predicate::str::contains("--advertise"));
}

#[test]
fn config_help_shows_subcommands() {
    tandem()
        .args(["config", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("show"))
        .stdout(predicate::str::contains("init"));
}
