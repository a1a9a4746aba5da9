//! MySQL / MariaDB source backed by `mysqldump`

use super::process::{run_probe, ProcessDumpStream};
use super::{ArtifactStream, SourceAdapter};
use crate::config::SourceConfig;
use crate::credentials::Secret;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const DEFAULT_PORT: u16 = 3306;
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Schemas that are never part of a backup
const SYSTEM_DATABASES: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

pub struct MySqlSource {
    host: String,
    port: u16,
    user: String,
    password: Option<Secret>,
    databases: Vec<String>,
    excluded: Vec<String>,
    dump_binary: PathBuf,
    client_binary: PathBuf,
    /// Databases selected by `connect`
    selected: Vec<String>,
}

impl MySqlSource {
    pub fn new(config: &SourceConfig, password: Option<Secret>) -> Result<Self> {
        let dump_binary = locate(config.dump_binary.as_ref(), "mysqldump")?;
        let client_binary = locate(config.client_binary.as_ref(), "mysql")?;

        Ok(Self {
            host: config.host.clone(),
            port: config.port.unwrap_or(DEFAULT_PORT),
            user: config.user.clone(),
            password,
            databases: config.databases.clone(),
            excluded: config.excluded_databases.clone(),
            dump_binary,
            client_binary,
            selected: Vec::new(),
        })
    }

    /// Databases chosen for the dump after `connect`
    pub fn selected_databases(&self) -> &[String] {
        &self.selected
    }

    fn command(&self, binary: &PathBuf) -> Command {
        let mut cmd = Command::new(binary);
        cmd.arg(format!("--host={}", self.host))
            .arg(format!("--port={}", self.port))
            .arg(format!("--user={}", self.user));
        if let Some(password) = &self.password {
            cmd.env("MYSQL_PWD", password.expose());
        }
        cmd
    }

    fn select(&self, available: &[String]) -> Result<Vec<String>> {
        let wanted: Vec<String> = if self.databases.is_empty() {
            available
                .iter()
                .filter(|db| !SYSTEM_DATABASES.contains(&db.as_str()))
                .cloned()
                .collect()
        } else {
            for db in &self.databases {
                if !available.contains(db) {
                    return Err(BackupError::Config(format!(
                        "Database '{}' does not exist on {}:{}",
                        db, self.host, self.port
                    )));
                }
            }
            self.databases.clone()
        };

        let selected: Vec<String> = wanted
            .into_iter()
            .filter(|db| !self.excluded.contains(db))
            .collect();

        if selected.is_empty() {
            return Err(BackupError::Source(format!(
                "No databases to back up on {}:{}",
                self.host, self.port
            )));
        }
        Ok(selected)
    }
}

#[async_trait]
impl SourceAdapter for MySqlSource {
    fn engine(&self) -> &'static str {
        "mysql"
    }

    async fn connect(&mut self) -> Result<()> {
        let mut cmd = self.command(&self.client_binary);
        cmd.args(["--batch", "--skip-column-names", "-e", "SHOW DATABASES"]);

        let output = run_probe(cmd, "mysql", PROBE_TIMEOUT, classify_client_error).await?;
        let available: Vec<String> = output
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        debug!("Server reports databases: {:?}", available);
        self.selected = self.select(&available)?;
        info!(
            "Connected to MySQL at {}:{}, selected databases: {}",
            self.host,
            self.port,
            self.selected.join(", ")
        );
        Ok(())
    }

    async fn stream_dump(&mut self) -> Result<ArtifactStream> {
        if self.selected.is_empty() {
            return Err(BackupError::Source(
                "stream_dump called before connect".to_string(),
            ));
        }

        let mut cmd = self.command(&self.dump_binary);
        cmd.args([
            "--single-transaction",
            "--quick",
            "--routines",
            "--triggers",
            "--events",
            "--hex-blob",
            "--databases",
        ]);
        cmd.args(&self.selected);

        info!("Starting mysqldump of {} database(s)", self.selected.len());
        Ok(Box::new(ProcessDumpStream::spawn(cmd, "mysqldump")?))
    }

    async fn close(&mut self) -> Result<()> {
        // nothing held open between client invocations
        self.selected.clear();
        Ok(())
    }
}

fn classify_client_error(stderr: &str) -> BackupError {
    if stderr.contains("Access denied") {
        BackupError::Authentication(stderr.to_string())
    } else {
        BackupError::Connection(stderr.to_string())
    }
}

/// Resolve a client binary from configuration or `PATH`
pub(super) fn locate(configured: Option<&PathBuf>, name: &str) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(crate::config::expand_tilde(path));
    }
    which::which(name).map_err(|_| {
        warn!("{} not found in PATH", name);
        BackupError::Config(format!(
            "{} not found in PATH; set its location in the source configuration",
            name
        ))
    })
}
