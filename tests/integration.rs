use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn tender_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("tender");
    path
}

fn notice(reference: &str) -> String {
    format!(
        "INVITATION TO TENDER\n\nReference: {}\n\n\
         The county council invites sealed bids for resurfacing of the access road, \
         drainage along the northern boundary and associated kerbing works.\n\n\
         Bidders must submit a signed form of tender, audited accounts for three years \
         and evidence of similar completed projects.\n",
        reference
    )
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let inbox = root.join("inbox/tenders");
    fs::create_dir_all(&inbox).unwrap();
    fs::write(inbox.join("alpha.txt"), notice("TND-100")).unwrap();
    fs::write(inbox.join("beta.txt"), notice("TND-200")).unwrap();
    fs::write(inbox.join("ignored.md"), "# not a tender").unwrap();

    // No extraction service configured: structured extraction fails and
    // documents land in `failed` with their attempt recorded.
    let config_content = format!(
        r#"[db]
path = "{}/data/tender.sqlite"

[source]
root = "{}/inbox"
include_globs = ["**/*.txt"]

[chunking]
window_words = 40
overlap_words = 10
min_chars = 20

[processing]
max_retries = 3
retry_delay_secs = 1800
"#,
        root.display(),
        root.display()
    );

    let config_path = config_dir.join("tender.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_tender(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = tender_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run tender binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_tender(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/tender.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_tender(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_tender(&config_path, &["setup"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_tender(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_scan_records_failures_without_extraction_service() {
    let (_tmp, config_path) = setup_test_env();
    run_tender(&config_path, &["init"]);

    let (stdout, stderr, success) = run_tender(&config_path, &["scan"]);
    assert!(success, "scan failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("discovered: 2"));
    assert!(stdout.contains("new: 2"));
    assert!(stdout.contains("failed: 2"));
}

#[test]
fn test_rescan_respects_backoff() {
    let (_tmp, config_path) = setup_test_env();
    run_tender(&config_path, &["init"]);
    run_tender(&config_path, &["scan"]);

    let (stdout, _, success) = run_tender(&config_path, &["scan"]);
    assert!(success);
    assert!(stdout.contains("new: 0"));
    assert!(stdout.contains("retryable: 2"));
    assert!(stdout.contains("skipped: 2"));
    assert!(stdout.contains("failed: 0"));
}

#[test]
fn test_status_shows_audit_trail() {
    let (_tmp, config_path) = setup_test_env();
    run_tender(&config_path, &["init"]);
    run_tender(&config_path, &["scan"]);

    let (stdout, stderr, success) = run_tender(&config_path, &["status", "tenders/alpha.txt"]);
    assert!(success, "status failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("v1"));
    assert!(stdout.contains("(latest)"));
    assert!(stdout.contains("failed (1/3 attempts)"));
    assert!(stdout.contains("fetch"));
    assert!(stdout.contains("extract_structured"));
}

#[test]
fn test_status_unknown_document_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_tender(&config_path, &["init"]);

    let (_, stderr, success) = run_tender(&config_path, &["status", "tenders/missing.txt"]);
    assert!(!success);
    assert!(stderr.contains("document not found"));
}

#[test]
fn test_stats_after_scan() {
    let (_tmp, config_path) = setup_test_env();
    run_tender(&config_path, &["init"]);
    run_tender(&config_path, &["scan"]);

    let (stdout, stderr, success) = run_tender(&config_path, &["stats"]);
    assert!(success, "stats failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Documents:   2"));
    assert!(stdout.contains("Versions:    2"));
    assert!(stdout.contains("Tenders:     0"));
    assert!(stdout.contains("failed"));
}

#[test]
fn test_process_force_reruns_failed_document() {
    let (_tmp, config_path) = setup_test_env();
    run_tender(&config_path, &["init"]);
    run_tender(&config_path, &["scan"]);

    let (stdout, stderr, success) =
        run_tender(&config_path, &["process", "tenders/alpha.txt", "--force"]);
    assert!(success, "process failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("status: failed"));
    assert!(stdout.contains("attempts: 1/3"));
}

#[test]
fn test_report_unknown_tender_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_tender(&config_path, &["init"]);

    let (_, stderr, success) = run_tender(&config_path, &["report", "TND-404"]);
    assert!(!success);
    assert!(stderr.contains("tender not found"));
}

#[test]
fn test_query_unknown_tender_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_tender(&config_path, &["init"]);

    let (_, stderr, success) = run_tender(&config_path, &["query", "TND-404", "deadline?"]);
    assert!(!success);
    assert!(stderr.contains("tender not found"));
}

#[test]
fn test_query_answer_requires_extraction_provider() {
    let (_tmp, config_path) = setup_test_env();
    run_tender(&config_path, &["init"]);

    let (_, stderr, success) =
        run_tender(&config_path, &["query", "TND-100", "deadline?", "--answer"]);
    assert!(!success);
    assert!(stderr.contains("--answer needs an extraction provider"));
}
