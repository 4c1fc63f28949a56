//! Binary-level tests for the `coffer` command.

use std::io::Write;
use std::process::{Command, Output, Stdio};

const RFC_SEED: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

fn coffer() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_coffer"));
    cmd.env_remove("COFFER_CONFIG")
        .env_remove("COFFER_OTP_SEED")
        .env_remove("COFFER_MASTER_PASSPHRASE");
    cmd
}

fn run(cmd: &mut Command) -> Output {
    cmd.output().expect("coffer runs")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn help_lists_commands() {
    let output = run(coffer().arg("--help"));
    assert!(output.status.success());
    let text = stdout(&output);
    for command in ["otp", "export", "demo"] {
        assert!(text.contains(command), "missing {command} in {text}");
    }
}

#[test]
fn totp_matches_rfc_vector() {
    let output = run(coffer().args([
        "otp", "totp", "--seed", RFC_SEED, "--digits", "8", "--time", "59",
    ]));
    assert!(output.status.success());
    assert!(stdout(&output).contains("94287082"));
}

#[test]
fn seed_can_come_from_environment() {
    let output = run(coffer()
        .env("COFFER_OTP_SEED", RFC_SEED)
        .args(["otp", "hotp", "--counter", "0"]));
    assert!(output.status.success());
    assert!(stdout(&output).contains("755224"));
}

#[test]
fn verify_rejects_wrong_code_as_json() {
    let output = run(coffer().args([
        "--format", "json", "otp", "verify", "--seed", RFC_SEED, "--code", "000000", "--time", "59",
    ]));
    assert!(output.status.success());
    assert!(stdout(&output).contains("\"valid\": false"));
}

#[test]
fn bad_seed_fails() {
    let output = run(coffer().args(["otp", "totp", "--seed", "!!!"]));
    assert!(!output.status.success());
    assert!(stderr(&output).contains("invalid argument"));
}

#[test]
fn export_converts_stdin() {
    let mut child = coffer()
        .args(["export", "--from", "dotenv", "--to", "shell"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn coffer");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"API_KEY=abc123\n")
        .expect("write stdin");
    let output = child.wait_with_output().expect("wait");

    assert!(output.status.success());
    assert_eq!(stdout(&output), "export API_KEY='abc123'\n");
}

#[test]
fn token_generate_uses_prefix() {
    let output = run(coffer().args(["token", "generate", "--prefix", "ci_"]));
    assert!(output.status.success());
    assert!(stdout(&output).contains("ci_"));
}

#[test]
fn missing_config_fails() {
    let output = run(coffer().args(["--config", "/nonexistent/coffer.yaml", "otp", "seed"]));
    assert!(!output.status.success());
    assert!(stderr(&output).contains("configuration error"));
}

#[test]
fn demo_prints_audit_trail() {
    let output = run(coffer().args(["demo", "--passphrase", "integration-test"]));
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("Audit Trail"));
    assert!(text.contains("access_denied"));
}
