//! Test utilities for db-backup
//!
//! This crate provides shared test utilities, mock wiring and helper
//! functions for exercising the backup pipeline end to end without a
//! database or real storage.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use test_utils::{MockDestination, TestContext};
//!
//! #[tokio::test]
//! async fn my_test() {
//!     let ctx = TestContext::new().with_destination(MockDestination::new("disk"));
//!     let job = ctx.job().build();
//!     let report = ctx.run(&job).await;
//!     // ... assertions
//! }
//! ```

pub mod fixtures;
pub mod job_builder;
pub mod test_context;

// Re-export commonly used items
pub use fixtures::*;
pub use job_builder::JobBuilder;
pub use test_context::TestContext;

// Re-export types from the main crate for convenience
pub use db_backup::config::{BackupJob, DestinationTarget, TransformOptions};
pub use db_backup::error::{ErrorInfo, ErrorKind};
pub use db_backup::report::{DestinationResult, DestinationState, JobReport, JobStatus};
pub use db_backup::retention::RetentionRule;
pub use db_backup::utils::cancel::{CancelHandle, CancelSignal};
pub use db_backup::utils::retry::RetryPolicy;

// Re-export mock implementations from the main crate
pub use db_backup::destinations::mock::{DestinationCall, MockDestination};
pub use db_backup::sources::mock::{MockSource, SourceCall};
pub use db_backup::utils::clock::mock::ManualClock;

/// Common test result type
pub type TestResult<T = ()> = anyhow::Result<T>;
