//! Test context and harness for pipeline testing
//!
//! Wires a mock source and mock destinations into a [`BackupOrchestrator`]
//! driven by a manual clock, with a private spool directory.

use crate::fixtures::{run_start, sample_dump};
use crate::job_builder::JobBuilder;
use db_backup::config::BackupJob;
use db_backup::credentials::StaticCredentials;
use db_backup::destinations::mock::MockDestination;
use db_backup::destinations::DestinationAdapter;
use db_backup::managers::backup::BackupOrchestrator;
use db_backup::managers::events::{EventSink, ProgressEvent};
use db_backup::managers::factory::mock::MockAdapterFactory;
use db_backup::report::JobReport;
use db_backup::sources::mock::MockSource;
use db_backup::utils::cancel::CancelSignal;
use db_backup::utils::clock::mock::ManualClock;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Test context that owns the mocks and the spool directory
pub struct TestContext {
    /// Spool directory handed to every job built by [`TestContext::job`]
    spool_dir: TempDir,
    clock: ManualClock,
    source: MockSource,
    destinations: Vec<MockDestination>,
    missing_credentials: Vec<String>,
    credentials: StaticCredentials,
}

impl TestContext {
    /// Create a context with a sample dump and no destinations
    pub fn new() -> Self {
        Self {
            spool_dir: TempDir::new().expect("Failed to create spool dir"),
            clock: ManualClock::new(run_start()),
            source: MockSource::new(sample_dump()),
            destinations: Vec::new(),
            missing_credentials: Vec::new(),
            credentials: StaticCredentials::new(),
        }
    }

    pub fn with_source(mut self, source: MockSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_destination(mut self, destination: MockDestination) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Make building the adapter of `destination` fail with a credential error
    pub fn with_missing_credentials(mut self, destination: &str) -> Self {
        self.missing_credentials.push(destination.to_string());
        self
    }

    pub fn with_credentials(mut self, credentials: StaticCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Job builder targeting every registered destination, in registration
    /// order, spooling into this context
    pub fn job(&self) -> JobBuilder {
        let names: Vec<&str> = self.destinations.iter().map(|d| d.name()).collect();
        JobBuilder::new("nightly")
            .destinations(&names)
            .spool_directory(self.spool_dir.path())
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Move the clock forward by whole hours between runs
    pub fn advance_hours(&self, hours: i64) {
        self.clock.advance(chrono::Duration::hours(hours));
    }

    pub fn source(&self) -> &MockSource {
        &self.source
    }

    /// Shared handle on a registered destination
    pub fn destination(&self, name: &str) -> &MockDestination {
        self.destinations
            .iter()
            .find(|d| d.name() == name)
            .unwrap_or_else(|| panic!("No destination named '{}'", name))
    }

    pub fn spool_dir(&self) -> &Path {
        self.spool_dir.path()
    }

    /// Files left behind in the spool directory
    pub fn spool_leftovers(&self) -> usize {
        std::fs::read_dir(self.spool_dir.path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    /// Orchestrator over fresh clones of the mocks. Clones share state, so
    /// consecutive runs see each other's stored objects.
    pub fn orchestrator(&self) -> BackupOrchestrator {
        let factory = self
            .destinations
            .iter()
            .cloned()
            .fold(MockAdapterFactory::new(self.source.clone()), |f, d| {
                f.with_destination(d)
            });
        let factory = self
            .missing_credentials
            .iter()
            .fold(factory, |f, name| f.with_missing_credentials(name));

        BackupOrchestrator::new(Arc::new(factory), Arc::new(self.credentials.clone()))
            .with_clock(Arc::new(self.clock.clone()))
    }

    pub async fn run(&self, job: &BackupJob) -> JobReport {
        self.orchestrator().run(job, &CancelSignal::never()).await
    }

    pub async fn run_with_cancel(&self, job: &BackupJob, cancel: &CancelSignal) -> JobReport {
        self.orchestrator().run(job, cancel).await
    }

    /// Run and collect every progress event emitted along the way
    pub async fn run_with_events(&self, job: &BackupJob) -> (JobReport, Vec<ProgressEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = self
            .orchestrator()
            .with_events(EventSink::new(tx))
            .run(job, &CancelSignal::never())
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (report, events)
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
