//! End-to-end CLI smoke tests for subcommands that don't require attached
//! hardware: the registry listing and the config file lifecycle.

use assert_cmd::Command;
use predicates::prelude::*;

fn logicctl() -> Command {
    Command::cargo_bin("logicctl").unwrap()
}

#[test]
fn devices_list_shows_built_in_drivers() {
    logicctl()
        .args(["--quiet", "devices", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("native"));
}

#[test]
fn devices_list_json_is_parseable() {
    let output = logicctl()
        .args(["--quiet", "--format", "json", "devices", "list"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let rows: serde_json::Value = serde_json::from_slice(&output).expect("valid json array");
    assert!(rows.as_array().unwrap().iter().any(|r| r["id"] == "native"));
}

#[test]
fn config_show_set_reset_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    logicctl()
        .env("XDG_CONFIG_HOME", dir.path())
        .args(["--quiet", "config", "set", "default_baud_rate", "9600"])
        .assert()
        .success();

    logicctl()
        .env("XDG_CONFIG_HOME", dir.path())
        .args(["--quiet", "--format", "json", "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("9600"));

    logicctl()
        .env("XDG_CONFIG_HOME", dir.path())
        .args(["--quiet", "config", "reset"])
        .assert()
        .success();

    logicctl()
        .env("XDG_CONFIG_HOME", dir.path())
        .args(["--quiet", "--format", "json", "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("115200"));
}

#[test]
fn config_set_rejects_unknown_key() {
    let dir = tempfile::tempdir().unwrap();
    logicctl()
        .env("XDG_CONFIG_HOME", dir.path())
        .args(["--quiet", "config", "set", "not_a_real_key", "1"])
        .assert()
        .failure();
}

#[test]
fn decode_reports_missing_input_file() {
    logicctl()
        .args(["--quiet", "decode", "--input", "/nonexistent/capture.json", "--decoder", "i2c"])
        .assert()
        .failure();
}
