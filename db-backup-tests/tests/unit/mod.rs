//! Unit tests for db-backup
//!
//! Pure logic: retention selection, naming and config resolution.

mod config;
mod naming;
mod retention;
