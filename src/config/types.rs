use crate::retention::RetentionRule;
use crate::utils::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
    #[serde(default)]
    pub destinations: HashMap<String, DestinationConfig>,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub jobs: HashMap<String, JobConfig>,
}

/// Global configuration settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Where spool files are written (system temp dir when unset)
    pub spool_directory: Option<PathBuf>,

    /// Directory holding per-job run locks
    pub lock_directory: PathBuf,

    /// Logging configuration
    pub log_directory: PathBuf,
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_max_files: u32,

    /// Default retention rule
    pub retention_keep_last: usize,
    /// Zero disables age-based retention
    pub retention_max_age_days: u32,

    /// Transfer retry policy
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,

    /// Job-wide timeout, zero for none
    pub timeout_seconds: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            spool_directory: None,
            lock_directory: default_lock_directory(),
            log_directory: default_log_directory(),
            log_level: default_log_level(),
            log_format: LogFormat::Text,
            log_max_files: default_log_max_files(),
            retention_keep_last: default_retention_keep_last(),
            retention_max_age_days: 0,
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: default_backoff_max_ms(),
            timeout_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Mysql,
    Postgres,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Mysql => "mysql",
            Engine::Postgres => "postgres",
        }
    }
}

/// Database to dump
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub engine: Engine,

    #[serde(default = "default_host")]
    pub host: String,

    /// Engine default when unset
    #[serde(default)]
    pub port: Option<u16>,

    pub user: String,

    /// Credential id of the database password
    #[serde(default)]
    pub password_ref: Option<String>,

    /// Databases to dump; empty means every non-system database
    #[serde(default)]
    pub databases: Vec<String>,

    #[serde(default)]
    pub excluded_databases: Vec<String>,

    /// Dump tool location (PATH lookup when unset)
    #[serde(default)]
    pub dump_binary: Option<PathBuf>,

    /// Client tool used to probe the server (PATH lookup when unset)
    #[serde(default)]
    pub client_binary: Option<PathBuf>,
}

/// Backup destination configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DestinationConfig {
    Local(LocalDestinationConfig),
    S3(S3DestinationConfig),
    Sftp(SftpDestinationConfig),
}

impl DestinationConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            DestinationConfig::Local(_) => "local",
            DestinationConfig::S3(_) => "s3",
            DestinationConfig::Sftp(_) => "sftp",
        }
    }

    /// Human readable location, without credentials
    pub fn location(&self) -> String {
        match self {
            DestinationConfig::Local(c) => c.path.display().to_string(),
            DestinationConfig::S3(c) if c.prefix.is_empty() => format!("s3://{}", c.bucket),
            DestinationConfig::S3(c) => format!("s3://{}/{}", c.bucket, c.prefix),
            DestinationConfig::Sftp(c) => format!("sftp://{}@{}/{}", c.user, c.host, c.remote_dir),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalDestinationConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct S3DestinationConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub path_style: bool,
    /// Credential ids of the access and secret keys
    pub access_key_ref: String,
    pub secret_key_ref: String,
    #[serde(default = "default_part_size_mb")]
    pub part_size_mb: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SftpDestinationConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub user: String,
    pub remote_dir: String,
    #[serde(default)]
    pub password_ref: Option<String>,
    #[serde(default)]
    pub private_key_ref: Option<String>,
    /// OpenSSH known_hosts file to check the host key against
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Notification configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub discord_webhook_url: String,

    #[serde(default = "default_notify_on")]
    pub notify_on: Vec<NotifyEvent>,

    #[serde(default = "default_rate_limit")]
    pub rate_limit_minutes: u64,

    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            discord_webhook_url: String::new(),
            notify_on: default_notify_on(),
            rate_limit_minutes: default_rate_limit(),
            cache_file: default_cache_file(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NotifyEvent {
    Success,
    Partial,
    Failure,
}

impl NotifyEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyEvent::Success => "success",
            NotifyEvent::Partial => "partial",
            NotifyEvent::Failure => "failure",
        }
    }
}

/// Job configuration (raw, before merging with global defaults)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub description: String,

    /// Source name
    pub source: String,

    /// Destination names
    #[serde(default)]
    pub targets: Vec<String>,

    #[serde(default = "default_compress")]
    pub compress: bool,
    #[serde(default)]
    pub compression_level: Option<u32>,

    /// Credential id of the encryption passphrase; enables encryption
    #[serde(default)]
    pub encryption_key_ref: Option<String>,

    /// Retention overrides
    #[serde(default)]
    pub retention_keep_last: Option<usize>,
    #[serde(default)]
    pub retention_max_age_days: Option<u32>,

    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Notification overrides
    #[serde(default)]
    pub notify_on: Vec<NotifyEvent>,
}

/// Transform chain settings for a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOptions {
    pub compress: bool,
    pub compression_level: u32,
    pub encryption_key_ref: Option<String>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            compress: true,
            compression_level: default_compression_level(),
            encryption_key_ref: None,
        }
    }
}

/// A destination as referenced by a job
#[derive(Debug, Clone)]
pub struct DestinationTarget {
    pub name: String,
    pub config: DestinationConfig,
}

/// Resolved job (after merging with global defaults). Immutable for the
/// duration of a run.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub source_name: String,
    pub source: SourceConfig,
    /// Destinations in configured order
    pub destinations: Vec<DestinationTarget>,
    pub transform: TransformOptions,
    pub retention: RetentionRule,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub spool_directory: Option<PathBuf>,
    pub notify_on: Vec<NotifyEvent>,
}

// Default value functions

fn default_lock_directory() -> PathBuf { std::env::temp_dir() }
fn default_log_directory() -> PathBuf { PathBuf::from("~/logs") }
fn default_log_level() -> String { "info".to_string() }
fn default_log_max_files() -> u32 { 10 }
fn default_retention_keep_last() -> usize { 5 }
fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_backoff_max_ms() -> u64 { 60_000 }
fn default_host() -> String { "localhost".to_string() }
fn default_region() -> String { "us-east-1".to_string() }
fn default_part_size_mb() -> usize { 8 }
fn default_enabled() -> bool { true }
fn default_compress() -> bool { true }
pub(crate) fn default_compression_level() -> u32 { 6 }
fn default_notify_on() -> Vec<NotifyEvent> {
    vec![NotifyEvent::Failure, NotifyEvent::Partial]
}
fn default_rate_limit() -> u64 { 60 }
fn default_cache_file() -> PathBuf {
    PathBuf::from("~/.cache/db-backup-notifications.json")
}
