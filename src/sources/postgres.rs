//! PostgreSQL source backed by `pg_dump` / `pg_dumpall`

use super::mysql::locate;
use super::process::{run_probe, ProcessDumpStream};
use super::{ArtifactStream, SourceAdapter};
use crate::config::SourceConfig;
use crate::credentials::Secret;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

const DEFAULT_PORT: u16 = 5432;
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Dumps one database with `pg_dump`, or the whole cluster with
/// `pg_dumpall` when no database is configured.
pub struct PostgresSource {
    host: String,
    port: u16,
    user: String,
    password: Option<Secret>,
    database: Option<String>,
    dump_binary: PathBuf,
    client_binary: PathBuf,
}

impl PostgresSource {
    pub fn new(config: &SourceConfig, password: Option<Secret>) -> Result<Self> {
        if config.databases.len() > 1 {
            return Err(BackupError::Config(
                "PostgreSQL sources dump a single database (or the whole cluster when none is set)"
                    .to_string(),
            ));
        }
        let database = config.databases.first().cloned();
        let dump_tool = if database.is_some() { "pg_dump" } else { "pg_dumpall" };

        Ok(Self {
            host: config.host.clone(),
            port: config.port.unwrap_or(DEFAULT_PORT),
            user: config.user.clone(),
            password,
            dump_binary: locate(config.dump_binary.as_ref(), dump_tool)?,
            client_binary: locate(config.client_binary.as_ref(), "psql")?,
            database,
        })
    }

    fn command(&self, binary: &PathBuf) -> Command {
        let mut cmd = Command::new(binary);
        cmd.arg(format!("--host={}", self.host))
            .arg(format!("--port={}", self.port))
            .arg(format!("--username={}", self.user))
            .arg("--no-password");
        if let Some(password) = &self.password {
            cmd.env("PGPASSWORD", password.expose());
        }
        cmd
    }
}

#[async_trait]
impl SourceAdapter for PostgresSource {
    fn engine(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&mut self) -> Result<()> {
        let mut cmd = self.command(&self.client_binary);
        cmd.arg(format!(
            "--dbname={}",
            self.database.as_deref().unwrap_or("postgres")
        ))
        .args(["--tuples-only", "--command=SELECT 1"]);

        run_probe(cmd, "psql", PROBE_TIMEOUT, classify_client_error).await?;
        info!("Connected to PostgreSQL at {}:{}", self.host, self.port);
        Ok(())
    }

    async fn stream_dump(&mut self) -> Result<ArtifactStream> {
        let mut cmd = self.command(&self.dump_binary);
        let tool = match &self.database {
            Some(db) => {
                // pg_dump runs in a single serializable snapshot
                cmd.arg("--format=plain").arg(format!("--dbname={}", db));
                "pg_dump"
            }
            None => "pg_dumpall",
        };

        info!("Starting {}", tool);
        Ok(Box::new(ProcessDumpStream::spawn(cmd, tool)?))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn classify_client_error(stderr: &str) -> BackupError {
    if stderr.contains("authentication failed") || stderr.contains("no password supplied") {
        BackupError::Authentication(stderr.to_string())
    } else {
        BackupError::Connection(stderr.to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Engine;
    use crate::error::ErrorKind;
    use crate::sources::read_to_end;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(dir: &TempDir, client: &str, dump: &str, databases: Vec<String>) -> SourceConfig {
        SourceConfig {
            engine: Engine::Postgres,
            host: "pg.local".to_string(),
            port: Some(5433),
            user: "postgres".to_string(),
            password_ref: None,
            databases,
            excluded_databases: vec![],
            dump_binary: Some(script(dir, "dump", dump)),
            client_binary: Some(script(dir, "psql", client)),
        }
    }

    #[tokio::test]
    async fn test_single_database_dump() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, "echo 1", "echo \"$PGPASSWORD $*\"", vec!["app".to_string()]);
        let mut source = PostgresSource::new(&cfg, Some(Secret::new("pgpw"))).unwrap();

        source.connect().await.unwrap();
        let mut stream = source.stream_dump().await.unwrap();
        let out = String::from_utf8(read_to_end(stream.as_mut()).await.unwrap()).unwrap();

        assert!(out.starts_with("pgpw "));
        assert!(out.contains("--no-password"));
        assert!(out.contains("--format=plain"));
        assert!(out.contains("--dbname=app"));
        assert!(out.contains("--port=5433"));
    }

    #[tokio::test]
    async fn test_rejected_password() {
        let dir = TempDir::new().unwrap();
        let cfg = config(
            &dir,
            "echo 'FATAL:  password authentication failed for user \"postgres\"' >&2; exit 2",
            "exit 0",
            vec![],
        );
        let mut source = PostgresSource::new(&cfg, None).unwrap();
        let err = source.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn test_multiple_databases_rejected() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, "", "", vec!["a".to_string(), "b".to_string()]);
        assert!(PostgresSource::new(&cfg, None).is_err());
    }
}
