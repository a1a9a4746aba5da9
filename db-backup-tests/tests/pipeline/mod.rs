//! Pipeline tests for db-backup
//!
//! These tests drive the orchestrator end to end against the in-memory
//! source and destinations.

mod cancellation;
mod fatal;
mod integrity;
mod isolation;
mod retention_runs;
mod retry;
mod transforms;
