use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn anvilctl() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("anvilctl").unwrap()
}

#[test]
fn test_help_exits_successfully() {
    anvilctl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("anvilctl"));
}

#[test]
fn test_help_lists_subcommands() {
    let assert = anvilctl().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for sub in ["ping", "node", "challenge", "instance", "vpn"] {
        assert!(output.contains(sub), "help output should list '{}'", sub);
    }
}

#[test]
fn test_unknown_subcommand_fails() {
    anvilctl()
        .arg("not-a-real-subcommand")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized"));
}

#[test]
fn test_node_register_requires_file_flag() {
    anvilctl()
        .args(["node", "register"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--file"));
}

#[test]
fn test_node_register_with_unreachable_socket_fails_past_arg_parsing() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{}}").unwrap();

    // A valid --file means clap parsing succeeds; the command should still
    // fail once it tries to reach anvild over a socket that doesn't exist.
    anvilctl()
        .args([
            "--socket",
            "/tmp/anvil-cli-test-nonexistent.sock",
            "node",
            "register",
            "--file",
        ])
        .arg(file.path())
        .assert()
        .failure();
}
