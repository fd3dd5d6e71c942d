use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn glassdb(data_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_glassdb"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .env_remove("GLASSDB_DATA_DIR")
        .output()
        .expect("failed to run glassdb")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_create_then_inspect() {
    let dir = TempDir::new().unwrap();
    let created = glassdb(dir.path(), &["create", "--max-changesets", "3"]);
    assert!(created.status.success(), "{:?}", created);
    let uuid = stdout(&created).trim().to_string();
    assert_eq!(uuid.len(), 36);

    let inspected = glassdb(dir.path(), &["inspect"]);
    assert!(inspected.status.success(), "{:?}", inspected);
    let report: serde_json::Value = serde_json::from_slice(&inspected.stdout).unwrap();
    assert_eq!(report["uuid"], uuid.as_str());
    assert_eq!(report["snapshot"]["revision"], 0);
    assert_eq!(report["snapshot"]["stats"]["doc_count"], 0);
    assert_eq!(report["single_file"], false);
}

#[test]
fn test_create_twice_fails() {
    let dir = TempDir::new().unwrap();
    assert!(glassdb(dir.path(), &["create"]).status.success());
    assert!(!glassdb(dir.path(), &["create"]).status.success());
}

#[test]
fn test_check_changeset_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("changes.1");
    std::fs::write(&path, b"not a changeset").unwrap();
    let output = glassdb(dir.path(), &["check-changeset", path.to_str().unwrap()]);
    assert!(!output.status.success());
}

#[test]
fn test_inspect_without_database_fails() {
    let dir = TempDir::new().unwrap();
    assert!(!glassdb(dir.path(), &["inspect"]).status.success());
}
