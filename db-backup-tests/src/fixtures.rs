//! Test fixtures and sample data
//!
//! Provides pre-built payloads, timestamps and config templates.

use chrono::{DateTime, TimeZone, Utc};
use db_backup::destinations::naming;

/// Start time of every test run: 2026-05-01 03:00:00 UTC
pub fn run_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 3, 0, 0).unwrap()
}

/// Timestamp `days` days before [`run_start`]
pub fn days_before_start(days: i64) -> DateTime<Utc> {
    run_start() - chrono::Duration::days(days)
}

/// A small SQL dump
pub fn sample_dump() -> Vec<u8> {
    b"-- MySQL dump\nCREATE TABLE users (id INT PRIMARY KEY, name TEXT);\n\
      INSERT INTO users VALUES (1, 'alice'), (2, 'bob');\n"
        .to_vec()
}

/// A dump large enough to span many spool chunks
pub fn large_dump(bytes: usize) -> Vec<u8> {
    (0..bytes).map(|i| (i % 251) as u8).collect()
}

/// Name of a prior plain SQL artifact of `job` taken at `at`
pub fn artifact_at(job: &str, at: DateTime<Utc>) -> String {
    naming::artifact_name(job, at, ".sql")
}

/// Minimal valid config TOML with one job writing to one local directory
pub fn minimal_config_toml(backup_path: &str) -> String {
    format!(
        r#"
[global]
retention_keep_last = 3

[sources.main]
engine = "mysql"
user = "backup"
password_ref = "main-db"

[destinations.disk]
type = "local"
path = "{}"

[jobs.nightly]
source = "main"
targets = ["disk"]
"#,
        backup_path
    )
}
