//! End-to-end tests driving the built `kbc` binary against real source files.

use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn kbc_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_kbc"))
}

#[test]
fn compiles_a_valid_script_and_prints_disassembly() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ok.k");
    fs::write(&path, "return 1 + 2\n").unwrap();

    let output = kbc_cmd().arg(&path).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("JUMP_RETURN") || stdout.contains("function #0"));
    assert!(output.stderr.is_empty());
}

#[test]
fn reports_a_diagnostic_and_exits_nonzero_on_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.k");
    fs::write(&path, "break\n").unwrap();

    let output = kbc_cmd().arg(&path).output().unwrap();
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("bad.k:1:1: error:"));
    assert!(stderr.contains("invalid 'break' outside of loop"));
}

#[test]
fn missing_file_is_a_read_error_not_a_panic() {
    let output = kbc_cmd().arg("/nonexistent/path/does-not-exist.k").output().unwrap();
    assert!(!output.status.success());
}
