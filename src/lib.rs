//! db-backup library
//!
//! Backup pipeline for databases: a consistent dump is compressed and
//! optionally encrypted, spooled once, then shipped concurrently to every
//! configured destination, verified and pruned by retention.

pub mod config;
pub mod credentials;
pub mod destinations;
pub mod error;
pub mod managers;
pub mod report;
pub mod retention;
pub mod sources;
pub mod transform;
pub mod utils;

// Re-export commonly used types
pub use config::{load_config, resolve_all_jobs, resolve_job, BackupJob, Config};
pub use credentials::{CredentialProvider, SecretKind, StaticCredentials};
pub use error::{BackupError, ErrorKind};
pub use managers::backup::BackupOrchestrator;
pub use managers::events::{EventSink, ProgressEvent};
pub use managers::factory::{AdapterFactory, DefaultAdapterFactory};
pub use managers::logging::{init_console_logging, init_logging, LogGuard, LoggingConfig};
pub use managers::notification::NotificationManager;
pub use report::{DestinationState, JobReport, JobStatus};
pub use utils::cancel::{CancelHandle, CancelSignal};
