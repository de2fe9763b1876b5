use std::process::{Command, Output};

fn drtm(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_drtm"))
        .args(args)
        .output()
        .expect("Failed to run drtm")
}

#[test]
fn test_cli_help() {
    let output = drtm(&["--help"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: drtm"));
    assert!(stdout.contains("threads"));
}

#[test]
fn test_demo_threads() {
    let output = drtm(&["--demo", "threads"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("idle"));
    assert!(stdout.contains("main"));
    assert!(stdout.contains("running"));
}

#[test]
fn test_demo_threads_json() {
    let output = drtm(&["--demo", "--json", "threads"]);

    assert!(output.status.success());
    let snapshot: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let threads = snapshot["threads"].as_array().unwrap();
    assert_eq!(threads.len(), 5);
    assert_eq!(threads[0]["name"], "idle");
}

#[test]
fn test_demo_layout() {
    let output = drtm(&["--demo", "layout"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("DRTM layout"));
    assert!(stdout.contains("xpsr"));
}

#[test]
fn test_demo_registers() {
    let output = drtm(&["--demo", "regs", "--thread", "1"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("idle"));
    assert!(stdout.contains("pc"));
}

#[test]
fn test_unknown_thread_fails() {
    let output = drtm(&["--demo", "regs", "--thread", "42"]);
    assert!(!output.status.success());

    let output = drtm(&["--demo", "regs", "--thread", "0"]);
    assert!(!output.status.success());
}

#[test]
fn test_missing_target_fails() {
    let output = drtm(&["threads"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No target selected"));
}
