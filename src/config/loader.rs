use super::types::*;
use crate::retention::RetentionRule;
use crate::utils::retry::RetryPolicy;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Source '{0}' not found")]
    SourceNotFound(String),

    #[error("Destination '{0}' not found")]
    DestinationNotFound(String),

    #[error("Job '{0}' not found")]
    JobNotFound(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

const MIN_PART_SIZE_MB: usize = 5;

/// Load and validate configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from TOML text
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate the configuration
fn validate_config(config: &Config) -> Result<()> {
    validate_global(&config.global)?;

    for (name, source) in &config.sources {
        validate_source(name, source)?;
    }

    for (name, destination) in &config.destinations {
        validate_destination(name, destination)?;
    }

    for (name, job) in &config.jobs {
        validate_job(name, job, config)?;
    }

    Ok(())
}

fn validate_global(global: &GlobalConfig) -> Result<()> {
    if global.max_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "global.max_attempts must be at least 1".to_string(),
        ));
    }
    if global.retention_keep_last == 0 {
        return Err(ConfigError::ValidationError(
            "global.retention_keep_last must be at least 1".to_string(),
        ));
    }
    if !(global.backoff_multiplier >= 1.0) {
        return Err(ConfigError::ValidationError(format!(
            "global.backoff_multiplier must be >= 1.0, got {}",
            global.backoff_multiplier
        )));
    }
    Ok(())
}

fn validate_source(name: &str, source: &SourceConfig) -> Result<()> {
    if source.user.trim().is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Source '{}': user must not be empty",
            name
        )));
    }

    if source.engine == Engine::Postgres && source.databases.len() > 1 {
        return Err(ConfigError::ValidationError(format!(
            "Source '{}': postgres sources dump one database, or all of them when none is listed",
            name
        )));
    }

    if let Some(db) = source
        .databases
        .iter()
        .find(|db| source.excluded_databases.contains(db))
    {
        return Err(ConfigError::ValidationError(format!(
            "Source '{}': database '{}' is both selected and excluded",
            name, db
        )));
    }

    Ok(())
}

fn validate_destination(name: &str, destination: &DestinationConfig) -> Result<()> {
    match destination {
        DestinationConfig::Local(local) => {
            if local.path.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Destination '{}': path must not be empty",
                    name
                )));
            }
        }
        DestinationConfig::S3(s3) => {
            if s3.bucket.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Destination '{}': bucket must not be empty",
                    name
                )));
            }
            if s3.part_size_mb < MIN_PART_SIZE_MB {
                return Err(ConfigError::ValidationError(format!(
                    "Destination '{}': part_size_mb must be at least {}",
                    name, MIN_PART_SIZE_MB
                )));
            }
        }
        DestinationConfig::Sftp(sftp) => {
            if sftp.password_ref.is_none() && sftp.private_key_ref.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Destination '{}': sftp needs password_ref or private_key_ref",
                    name
                )));
            }
            if sftp.remote_dir.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Destination '{}': remote_dir must not be empty",
                    name
                )));
            }
        }
    }
    Ok(())
}

fn validate_job(name: &str, job: &JobConfig, config: &Config) -> Result<()> {
    if !config.sources.contains_key(&job.source) {
        return Err(ConfigError::SourceNotFound(job.source.clone()));
    }

    if job.targets.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Job '{}' has no targets defined",
            name
        )));
    }

    let mut seen = HashSet::new();
    for target in &job.targets {
        if !config.destinations.contains_key(target) {
            return Err(ConfigError::DestinationNotFound(target.clone()));
        }
        if !seen.insert(target.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Job '{}': destination '{}' listed twice",
                name, target
            )));
        }
    }

    if let Some(level) = job.compression_level {
        if level > 9 {
            return Err(ConfigError::ValidationError(format!(
                "Job '{}': compression_level must be 0-9, got {}",
                name, level
            )));
        }
    }

    if job.retention_keep_last == Some(0) {
        return Err(ConfigError::ValidationError(format!(
            "Job '{}': retention_keep_last must be at least 1",
            name
        )));
    }

    if job.max_attempts == Some(0) {
        return Err(ConfigError::ValidationError(format!(
            "Job '{}': max_attempts must be at least 1",
            name
        )));
    }

    Ok(())
}

/// Resolve a job by merging it with global defaults
///
/// Settings are taken from the job first, then the global section, then
/// built-in defaults.
pub fn resolve_job(name: &str, config: &Config) -> Result<BackupJob> {
    let job = config
        .jobs
        .get(name)
        .ok_or_else(|| ConfigError::JobNotFound(name.to_string()))?;

    let source = config
        .sources
        .get(&job.source)
        .ok_or_else(|| ConfigError::SourceNotFound(job.source.clone()))?;

    let destinations = job
        .targets
        .iter()
        .map(|target| {
            config
                .destinations
                .get(target)
                .map(|dest| DestinationTarget {
                    name: target.clone(),
                    config: dest.clone(),
                })
                .ok_or_else(|| ConfigError::DestinationNotFound(target.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    if destinations.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Job '{}' has no targets defined",
            name
        )));
    }

    let global = &config.global;

    let max_age_days = job
        .retention_max_age_days
        .unwrap_or(global.retention_max_age_days);
    let retention = RetentionRule {
        keep_last: Some(job.retention_keep_last.unwrap_or(global.retention_keep_last)),
        max_age_days: (max_age_days > 0).then_some(max_age_days),
    };

    let retry = RetryPolicy {
        max_attempts: job.max_attempts.unwrap_or(global.max_attempts),
        base_delay: Duration::from_millis(global.backoff_base_ms),
        multiplier: global.backoff_multiplier,
        max_delay: Duration::from_millis(global.backoff_max_ms),
    };

    let timeout_seconds = job.timeout_seconds.unwrap_or(global.timeout_seconds);

    let notify_on = if !job.notify_on.is_empty() {
        job.notify_on.clone()
    } else {
        config.notifications.notify_on.clone()
    };

    Ok(BackupJob {
        name: name.to_string(),
        description: job.description.clone(),
        enabled: job.enabled,
        source_name: job.source.clone(),
        source: source.clone(),
        destinations,
        transform: TransformOptions {
            compress: job.compress,
            compression_level: job
                .compression_level
                .unwrap_or_else(default_compression_level),
            encryption_key_ref: job.encryption_key_ref.clone(),
        },
        retention,
        retry,
        timeout: (timeout_seconds > 0).then(|| Duration::from_secs(timeout_seconds)),
        spool_directory: global.spool_directory.clone(),
        notify_on,
    })
}

/// Resolve all jobs in the configuration, ordered by name
pub fn resolve_all_jobs(config: &Config) -> Result<BTreeMap<String, BackupJob>> {
    let mut resolved = BTreeMap::new();

    for name in config.jobs.keys() {
        resolved.insert(name.clone(), resolve_job(name, config)?);
    }

    Ok(resolved)
}
