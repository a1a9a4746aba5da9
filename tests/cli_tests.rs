// End-to-end tests of the db-backup binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn db_backup() -> Command {
    Command::cargo_bin("db-backup").unwrap()
}

/// Config with one local destination and fake client/dump binaries under `dir`
fn local_config(dir: &Path, dump_binary: &Path, client_binary: &Path) -> PathBuf {
    let contents = format!(
        r#"
[global]
log_directory = "{logs}"
lock_directory = "{locks}"
spool_directory = "{spool}"
max_attempts = 1

[sources.app]
engine = "mysql"
user = "backup"
databases = ["appdb"]
dump_binary = "{dump}"
client_binary = "{client}"

[destinations.disk]
type = "local"
path = "{backups}"

[jobs.nightly]
description = "Nightly application dump"
source = "app"
targets = ["disk"]
retention_keep_last = 2

[jobs.archive]
enabled = false
source = "app"
targets = ["disk"]
"#,
        logs = dir.join("logs").display(),
        locks = dir.display(),
        spool = dir.display(),
        dump = dump_binary.display(),
        client = client_binary.display(),
        backups = dir.join("backups").display(),
    );
    let path = dir.join("config.toml");
    fs::write(&path, contents).unwrap();
    path
}

#[cfg(unix)]
fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn test_validate_accepts_valid_config() {
    let temp_dir = TempDir::new().unwrap();
    let config = local_config(temp_dir.path(), Path::new("/bin/true"), Path::new("/bin/true"));

    db_backup()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("Jobs: 2"));
}

#[test]
fn test_validate_rejects_invalid_config() {
    let temp_dir = TempDir::new().unwrap();
    let config = temp_dir.path().join("config.toml");
    fs::write(
        &config,
        r#"
[jobs.nightly]
source = "missing"
targets = []
"#,
    )
    .unwrap();

    db_backup()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}

#[test]
fn test_jobs_lists_configured_jobs() {
    let temp_dir = TempDir::new().unwrap();
    let config = local_config(temp_dir.path(), Path::new("/bin/true"), Path::new("/bin/true"));

    db_backup()
        .arg("--config")
        .arg(&config)
        .arg("jobs")
        .assert()
        .success()
        .stdout(predicate::str::contains("nightly"))
        .stdout(predicate::str::contains("archive (disabled)"))
        .stdout(predicate::str::contains("Destination: disk [local]"));
}

#[test]
fn test_run_requires_job_or_all() {
    let temp_dir = TempDir::new().unwrap();
    let config = local_config(temp_dir.path(), Path::new("/bin/true"), Path::new("/bin/true"));

    db_backup()
        .arg("--config")
        .arg(&config)
        .arg("run")
        .assert()
        .failure();
}

#[cfg(unix)]
#[test]
fn test_run_job_to_local_destination() {
    let temp_dir = TempDir::new().unwrap();
    let client = script(temp_dir.path(), "fake-mysql", "echo appdb");
    let dump = script(temp_dir.path(), "fake-mysqldump", "echo 'CREATE TABLE users (id INT);'");
    let config = local_config(temp_dir.path(), &dump, &client);

    db_backup()
        .arg("--config")
        .arg(&config)
        .args(["run", "--job", "nightly"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("all succeeded"));

    let stored: Vec<String> = fs::read_dir(temp_dir.path().join("backups"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(stored.len(), 1, "{:?}", stored);
    assert!(stored[0].starts_with("nightly-"));
    assert!(stored[0].ends_with(".sql.gz"));
}

#[cfg(unix)]
#[test]
fn test_run_fails_when_dump_fails() {
    let temp_dir = TempDir::new().unwrap();
    let client = script(temp_dir.path(), "fake-mysql", "echo appdb");
    let dump = script(temp_dir.path(), "fake-mysqldump", "echo 'mysqldump: Got error' >&2; exit 2");
    let config = local_config(temp_dir.path(), &dump, &client);

    db_backup()
        .arg("--config")
        .arg(&config)
        .args(["run", "--job", "nightly"])
        .assert()
        .code(1);

    let backups = temp_dir.path().join("backups");
    let stored = fs::read_dir(&backups).map(|d| d.count()).unwrap_or(0);
    assert_eq!(stored, 0);
}
