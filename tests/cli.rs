//! CLI tests: run the compiled binary against a scratch config.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn ragsync_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ragsync"))
}

struct Workspace {
    dir: TempDir,
    config: PathBuf,
    source: PathBuf,
}

fn workspace() -> Workspace {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("docs");
    fs::create_dir_all(&source).unwrap();
    fs::write(
        source.join("runbook.md"),
        "# Runbook\n\nRestart the ingestion worker when the queue stalls.\n",
    )
    .unwrap();
    fs::write(source.join("faq.txt"), "Billing questions go to finance.").unwrap();

    let db_dir = dir.path().join("db");
    let config = dir.path().join("ragsync.toml");
    fs::write(
        &config,
        format!(
            r#"
[vector_db]
provider = "sqlite"
path = "{vectors}"

[metadata_store]
provider = "sqlite"
path = "{meta}"

[ingestion]
batch_size = 10
staging_dir = "{staging}"

[logging]
filter = "warn"
"#,
            vectors = toml_path(&db_dir.join("vectors.sqlite")),
            meta = toml_path(&db_dir.join("meta.sqlite")),
            staging = toml_path(&dir.path().join("staging")),
        ),
    )
    .unwrap();

    Workspace {
        dir,
        config,
        source,
    }
}

/// Path as a TOML basic-string body.
fn toml_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "\\\\")
}

impl Workspace {
    fn run(&self, args: &[&str]) -> Output {
        Command::new(ragsync_binary())
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .env_remove("RUST_LOG")
            .current_dir(self.dir.path())
            .output()
            .unwrap()
    }

    fn run_ok(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "ragsync {:?} failed:\nstdout: {}\nstderr: {}",
            args,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    fn source_fqn(&self) -> String {
        format!("localdir::{}", self.source.display())
    }
}

#[test]
fn test_init_is_idempotent() {
    let ws = workspace();
    let out = ws.run_ok(&["init"]);
    assert!(out.contains("Stores initialized"));
    ws.run_ok(&["init"]);
    assert!(ws.dir.path().join("db").join("meta.sqlite").exists());
}

#[test]
fn test_ingest_and_search_workflow() {
    let ws = workspace();
    let source = ws.source.display().to_string();
    let fqn = ws.source_fqn();

    let out = ws.run_ok(&["sources", "add", "localdir", &source]);
    assert!(out.contains(&fqn));
    let out = ws.run_ok(&["collections", "create", "handbook", "--data-source", &fqn]);
    assert!(out.contains("Created collection handbook"));

    let out = ws.run_ok(&["ingest", "handbook", "--mode", "FULL"]);
    assert!(out.contains("COMPLETED"));

    // Nothing changed, so an incremental run has nothing to do but still completes.
    ws.run_ok(&["ingest", "handbook"]);

    let out = ws.run_ok(&["runs", "list", "handbook"]);
    assert_eq!(out.lines().count(), 2);
    assert!(out.lines().all(|l| l.ends_with("COMPLETED")));

    let out = ws.run_ok(&["search", "handbook", "restart the ingestion worker", "--k", "1"]);
    assert!(out.contains("runbook.md"), "unexpected search output: {}", out);

    let out = ws.run_ok(&["collections", "list"]);
    assert!(out.contains("handbook"));
    assert!(out.contains(&fqn));
}

#[test]
fn test_components_listing() {
    let ws = workspace();
    let out = ws.run_ok(&["components", "dataloaders"]);
    assert!(out.contains("localdir"));
    assert!(out.contains("web"));

    let out = ws.run_ok(&["components", "embedders"]);
    assert!(out.contains("hashing"));

    let output = ws.run(&["components", "widgets"]);
    assert!(!output.status.success());
}

#[test]
fn test_errors_exit_non_zero() {
    let ws = workspace();

    let output = ws.run(&["ingest", "nope"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("nope"));

    let output = Command::new(ragsync_binary())
        .args(["--config", "/definitely/not/here.toml", "init"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to read config file"));
}
