use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

fn ingest_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ingest"))
}

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    let bytes = writer.finish().unwrap().into_inner();
    fs::write(path, bytes).unwrap();
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("uploads")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/ingest.sqlite"

[storage]
backend = "local"

[storage.local]
base_dir = "{}/store"
"#,
        root.display(),
        root.display()
    );

    let config_path = config_dir.join("ingest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ingest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ingest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ingest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn upload(tmp: &TempDir, config_path: &Path, name: &str, entries: &[(&str, &str)]) -> String {
    let archive = tmp.path().join("uploads").join(name);
    write_zip(&archive, entries);
    let (stdout, stderr, success) =
        run_ingest(config_path, &["upload", archive.to_str().unwrap()]);
    assert!(success, "upload failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ingest(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/ingest.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_ingest(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_ingest(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_upload_skips_node_modules() {
    let (tmp, config_path) = setup_test_env();
    run_ingest(&config_path, &["init"]);

    let stdout = upload(
        &tmp,
        &config_path,
        "a.zip",
        &[("index.js", "main"), ("node_modules/dep/index.js", "dep")],
    );
    let outcome: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(outcome["status"], "ingested");
    assert_eq!(outcome["projectName"], "a");
    assert_eq!(outcome["extractedCount"], 1);
    assert_eq!(outcome["skippedCount"], 1);
    assert_eq!(outcome["skippedByReason"]["denied-folder"], 1);

    assert!(tmp.path().join("store/projects/a/index.js").is_file());
    assert!(!tmp.path().join("store/projects/a/node_modules").exists());
}

#[test]
fn test_reupload_reports_already_uploaded() {
    let (tmp, config_path) = setup_test_env();
    run_ingest(&config_path, &["init"]);

    let entries = [("src/Foo.java", "class Foo {}")];
    upload(&tmp, &config_path, "demo.zip", &entries);
    let stdout = upload(&tmp, &config_path, "demo.zip", &entries);
    let outcome: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(outcome["status"], "alreadyUploaded");
}

#[test]
fn test_describe_survives_replace() {
    let (tmp, config_path) = setup_test_env();
    run_ingest(&config_path, &["init"]);

    upload(&tmp, &config_path, "b.zip", &[("src/Foo.java", "X")]);
    let (_, stderr, success) = run_ingest(
        &config_path,
        &["describe", "b", "src/Foo.java", "--set", "entry point"],
    );
    assert!(success, "describe failed: {}", stderr);

    let stdout = upload(&tmp, &config_path, "b.zip", &[("src/Foo.java", "Y")]);
    let outcome: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(outcome["replaced"], true);
    assert_eq!(outcome["preservedAnnotationCount"], 1);

    let (stdout, _, _) = run_ingest(&config_path, &["describe", "b", "src/Foo.java"]);
    assert_eq!(stdout.trim(), "entry point");

    let (stdout, _, _) = run_ingest(&config_path, &["cat", "b", "src/Foo.java"]);
    assert_eq!(stdout, "Y");
}

#[test]
fn test_traversal_archive_rejected() {
    let (tmp, config_path) = setup_test_env();
    run_ingest(&config_path, &["init"]);

    let archive = tmp.path().join("uploads/evil.zip");
    write_zip(&archive, &[("ok.txt", "x"), ("../../escaped.txt", "x")]);
    let (_, stderr, success) = run_ingest(&config_path, &["upload", archive.to_str().unwrap()]);
    assert!(!success, "traversal upload should fail");
    assert!(stderr.contains("outside the extraction directory"));
    assert!(stderr.contains("archive rejected"));
    assert!(!tmp.path().join("escaped.txt").exists());

    let (stdout, _, _) = run_ingest(&config_path, &["projects"]);
    let projects: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(projects.as_array().unwrap().len(), 0);
}

#[test]
fn test_tree_verify_delete() {
    let (tmp, config_path) = setup_test_env();
    run_ingest(&config_path, &["init"]);
    upload(
        &tmp,
        &config_path,
        "site.zip",
        &[("site/index.html", "<h1>hi</h1>"), ("site/css/main.css", "body{}")],
    );

    let (stdout, _, success) = run_ingest(&config_path, &["tree", "site"]);
    assert!(success);
    assert_eq!(stdout, "site/\n  css/\n    main.css\n  index.html\n");

    let (stdout, _, _) = run_ingest(&config_path, &["verify", "site"]);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["status"], "consistent");

    let (stdout, _, success) = run_ingest(&config_path, &["delete", "site"]);
    assert!(success);
    assert!(stdout.contains("Deleted"));
    assert!(!tmp.path().join("store/projects/site").exists());
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_ingest(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
