//! Tests for configuration resolution

use db_backup::config::{self, DestinationConfig, NotifyEvent};
use std::time::Duration;
use test_utils::minimal_config_toml;

#[test]
fn test_minimal_config_resolves() {
    let config = config::parse_config(&minimal_config_toml("/var/backups/db")).unwrap();
    let job = config::resolve_job("nightly", &config).unwrap();

    assert_eq!(job.source_name, "main");
    assert_eq!(job.retention.keep_last, Some(3));
    assert_eq!(job.retry.max_attempts, 3);
    assert_eq!(job.retry.base_delay, Duration::from_secs(1));
    assert_eq!(job.notify_on, vec![NotifyEvent::Failure, NotifyEvent::Partial]);
    assert!(job.transform.compress);
    assert!(matches!(job.destinations[0].config, DestinationConfig::Local(_)));
}

#[test]
fn test_global_timeout_applies_to_jobs() {
    let contents = minimal_config_toml("/var/backups/db")
        .replace("[global]", "[global]\ntimeout_seconds = 3600");
    let config = config::parse_config(&contents).unwrap();
    let job = config::resolve_job("nightly", &config).unwrap();
    assert_eq!(job.timeout, Some(Duration::from_secs(3600)));
}

#[test]
fn test_max_age_zero_means_unset() {
    let contents = minimal_config_toml("/var/backups/db")
        .replace("targets = [\"disk\"]", "targets = [\"disk\"]\nretention_max_age_days = 0");
    let config = config::parse_config(&contents).unwrap();
    let job = config::resolve_job("nightly", &config).unwrap();
    assert_eq!(job.retention.max_age_days, None);
}

#[test]
fn test_invalid_backoff_rejected() {
    let contents = minimal_config_toml("/var/backups/db")
        .replace("[global]", "[global]\nbackoff_multiplier = 0.5");
    assert!(config::parse_config(&contents).is_err());
}
