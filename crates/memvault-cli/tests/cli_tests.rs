//! Integration tests for the `memvault` CLI binary.
//!
//! These run the built binary as a subprocess and check exit codes, stdout
//! and files written. Vault configuration is passed through the child's
//! environment only.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

fn memvault_bin() -> String {
    let path = env!("CARGO_BIN_EXE_memvault");
    assert!(Path::new(path).exists(), "memvault binary not found at {path}");
    path.to_owned()
}

/// Run memvault with args and extra environment; return (`exit_code`, stdout, stderr).
fn run_with_env(args: &[&str], env: &[(&str, &str)]) -> (i32, String, String) {
    let mut cmd = Command::new(memvault_bin());
    cmd.args(args)
        .env_remove("MEMVAULT_MASTER_KEY")
        .env_remove("MEMVAULT_KEY_ENV")
        .env_remove("MEMVAULT_STORAGE")
        .env_remove("MEMVAULT_STORAGE_PATH")
        .env_remove("MEMVAULT_AUDIT_FILE")
        .env_remove("MEMVAULT_POLICY_FILE");
    for (k, v) in env {
        cmd.env(k, v);
    }
    let output = cmd.output().expect("failed to execute memvault");
    (
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    )
}

fn run(args: &[&str]) -> (i32, String, String) {
    run_with_env(args, &[])
}

fn keygen() -> String {
    let (code, stdout, _) = run(&["keygen"]);
    assert_eq!(code, 0);
    stdout.trim().to_owned()
}

const POLICY: &str = r#"{
  "version": 3,
  "identities": [
    {
      "id": "alden",
      "class": "primary",
      "trust_tier": "core",
      "secret_hash": "30c952fab122c3f9759f02a6d95c3758b246b4fee239957b2d4fee46e26170c4"
    }
  ]
}"#;

// ── Help ─────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_commands() {
    let (code, stdout, _) = run(&["--help"]);
    assert_eq!(code, 0);
    for sub in ["keygen", "hash-secret", "policy", "audit"] {
        assert!(stdout.contains(sub), "help should list '{sub}': {stdout}");
    }
}

#[test]
fn test_unknown_subcommand_fails() {
    let (code, _, _) = run(&["unseal"]);
    assert_ne!(code, 0);
}

// ── Keys and secrets ─────────────────────────────────────────────────

#[test]
fn test_keygen_prints_distinct_32_byte_keys() {
    let first = keygen();
    let second = keygen();
    assert_eq!(first.len(), 44, "base64 of 32 bytes: {first}");
    assert_ne!(first, second);
}

#[test]
fn test_hash_secret_from_argument_and_stdin() {
    let (code, stdout, _) = run(&["hash-secret", "pw"]);
    assert_eq!(code, 0);
    assert_eq!(
        stdout.trim(),
        "30c952fab122c3f9759f02a6d95c3758b246b4fee239957b2d4fee46e26170c4"
    );

    let mut child = Command::new(memvault_bin())
        .arg("hash-secret")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(b"pw\n").unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), stdout.trim());
}

// ── Policy documents ─────────────────────────────────────────────────

#[test]
fn test_policy_seal_then_verify() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("policy.json");
    let sealed = dir.path().join("policy.sealed.json");
    fs::write(&input, POLICY).unwrap();

    let (code, stdout, stderr) = run(&[
        "policy",
        "seal",
        input.to_str().unwrap(),
        sealed.to_str().unwrap(),
    ]);
    assert_eq!(code, 0, "seal failed: {stderr}");
    assert!(stdout.contains("version 3"));
    assert!(fs::read_to_string(&sealed).unwrap().contains("\"checksum\""));

    let (code, stdout, _) = run(&["policy", "verify", sealed.to_str().unwrap()]);
    assert_eq!(code, 0);
    assert!(stdout.contains("1 identities"));
}

#[test]
fn test_policy_verify_rejects_tampering() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("policy.json");
    let sealed = dir.path().join("policy.sealed.json");
    fs::write(&input, POLICY).unwrap();
    run(&["policy", "seal", input.to_str().unwrap(), sealed.to_str().unwrap()]);

    let tampered = fs::read_to_string(&sealed).unwrap().replace("primary", "system");
    fs::write(&sealed, tampered).unwrap();

    let (code, _, stderr) = run(&["policy", "verify", sealed.to_str().unwrap()]);
    assert_eq!(code, 1);
    assert!(stderr.contains("checksum"), "stderr: {stderr}");
}

#[test]
fn test_policy_seal_rejects_invalid_documents() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("policy.json");
    fs::write(&input, POLICY.replace("30c952fa", "zz")).unwrap();

    let (code, _, stderr) = run(&[
        "policy",
        "seal",
        input.to_str().unwrap(),
        dir.path().join("out.json").to_str().unwrap(),
    ]);
    assert_eq!(code, 1);
    assert!(stderr.contains("invalid"), "stderr: {stderr}");
    assert!(!dir.path().join("out.json").exists());
}

// ── Audit verification ───────────────────────────────────────────────

#[test]
fn test_audit_verify_on_a_fresh_vault() {
    let dir = tempfile::tempdir().unwrap();
    let key = keygen();
    let audit = dir.path().join("audit.jsonl");
    let (code, stdout, stderr) = run_with_env(
        &["audit", "verify"],
        &[
            ("MEMVAULT_MASTER_KEY", &key),
            ("MEMVAULT_AUDIT_FILE", audit.to_str().unwrap()),
        ],
    );
    assert_eq!(code, 0, "stderr: {stderr}");
    let report: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(report["status"], "ok");
    assert_eq!(report["records"], 0);
}

#[test]
fn test_audit_verify_exits_2_on_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let key = keygen();
    let audit = dir.path().join("audit.jsonl");
    fs::write(&audit, "{\"sequence\":1,\"not\":\"a record\"}\n").unwrap();

    let (code, stdout, _) = run_with_env(
        &["audit", "verify"],
        &[
            ("MEMVAULT_MASTER_KEY", &key),
            ("MEMVAULT_AUDIT_FILE", audit.to_str().unwrap()),
        ],
    );
    assert_eq!(code, 2);
    let report: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(report["status"], "corrupted");
    assert_eq!(report["at_sequence"], 1);
}

#[test]
fn test_audit_verify_reports_a_missing_master_key() {
    let (code, _, stderr) = run(&["audit", "verify"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("MEMVAULT_MASTER_KEY"), "stderr: {stderr}");
}

#[test]
fn test_audit_verify_honours_a_custom_key_variable() {
    let key = keygen();
    let (code, _, stderr) = run_with_env(
        &["audit", "verify"],
        &[("MEMVAULT_KEY_ENV", "OPS_VAULT_KEY"), ("OPS_VAULT_KEY", &key)],
    );
    assert_eq!(code, 0, "stderr: {stderr}");
}
