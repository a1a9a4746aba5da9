//! Fluent API for building test jobs
//!
//! Provides a builder pattern for creating resolved [`BackupJob`]s with
//! sensible defaults: a MySQL source, no transforms, fast retries and no
//! retention.

use db_backup::config::{
    BackupJob, DestinationConfig, DestinationTarget, Engine, LocalDestinationConfig,
    SourceConfig, TransformOptions,
};
use db_backup::retention::RetentionRule;
use db_backup::utils::retry::RetryPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Builder for creating test jobs
pub struct JobBuilder {
    job: BackupJob,
}

impl JobBuilder {
    /// Create a job named `name` with no destinations
    pub fn new(name: &str) -> Self {
        Self {
            job: BackupJob {
                name: name.to_string(),
                description: format!("Test job {}", name),
                enabled: true,
                source_name: "main".to_string(),
                source: SourceConfig {
                    engine: Engine::Mysql,
                    host: "localhost".to_string(),
                    port: None,
                    user: "backup".to_string(),
                    password_ref: None,
                    databases: vec!["app".to_string()],
                    excluded_databases: vec![],
                    dump_binary: None,
                    client_binary: None,
                },
                destinations: Vec::new(),
                transform: TransformOptions {
                    compress: false,
                    compression_level: 6,
                    encryption_key_ref: None,
                },
                retention: RetentionRule::default(),
                retry: fast_retry(3),
                timeout: None,
                spool_directory: None,
                notify_on: Vec::new(),
            },
        }
    }

    /// Add a destination. The adapter itself comes from the factory, so the
    /// configured path is never touched.
    pub fn destination(mut self, name: &str) -> Self {
        self.job.destinations.push(DestinationTarget {
            name: name.to_string(),
            config: DestinationConfig::Local(LocalDestinationConfig {
                path: PathBuf::from("/nonexistent").join(name),
            }),
        });
        self
    }

    pub fn destinations(self, names: &[&str]) -> Self {
        names.iter().fold(self, |builder, name| builder.destination(name))
    }

    pub fn engine(mut self, engine: Engine) -> Self {
        self.job.source.engine = engine;
        self
    }

    pub fn compressed(mut self, level: u32) -> Self {
        self.job.transform.compress = true;
        self.job.transform.compression_level = level;
        self
    }

    /// Encrypt with the key stored under `key_ref`
    pub fn encrypted(mut self, key_ref: &str) -> Self {
        self.job.transform.encryption_key_ref = Some(key_ref.to_string());
        self
    }

    pub fn keep_last(mut self, n: usize) -> Self {
        self.job.retention.keep_last = Some(n);
        self
    }

    pub fn max_age_days(mut self, days: u32) -> Self {
        self.job.retention.max_age_days = Some(days);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.job.retry = fast_retry(attempts);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.job.timeout = Some(timeout);
        self
    }

    pub fn spool_directory(mut self, dir: &Path) -> Self {
        self.job.spool_directory = Some(dir.to_path_buf());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.job.enabled = false;
        self
    }

    pub fn build(self) -> BackupJob {
        self.job
    }
}

/// Retry policy with millisecond delays
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_delay: Duration::from_millis(10),
    }
}
