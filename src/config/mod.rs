//! Configuration module for db-backup
//!
//! This module handles loading, validating, and resolving configuration from TOML files.
//!
//! ## Configuration Inheritance
//!
//! Settings are applied in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. The `[global]` section
//! 3. Job-level settings
//!
//! Secrets never appear in the file. Sources, destinations and jobs refer to
//! them by credential id (`password_ref`, `access_key_ref`, ...).
//!
//! ## Example Usage
//!
//! ```no_run
//! use db_backup::config;
//!
//! let config = config::load_config("db-backup.toml")?;
//! let jobs = config::resolve_all_jobs(&config)?;
//!
//! for (name, job) in jobs {
//!     println!("Job: {}, Destinations: {}", name, job.destinations.len());
//! }
//! # Ok::<(), config::ConfigError>(())
//! ```

mod loader;
mod types;

pub use loader::{load_config, parse_config, resolve_all_jobs, resolve_job, ConfigError, Result};
pub use types::*;

/// Expand tilde (~) in path
pub fn expand_tilde(path: &std::path::Path) -> std::path::PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}
