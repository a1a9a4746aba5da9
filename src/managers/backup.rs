//! Backup orchestrator - runs one job from dump to retention
//!
//! The dump is read once, passed through the transform chain and spooled to
//! a local file. One worker per destination then uploads from its own reader
//! over the spool, verifies the stored copy and applies retention. Workers
//! report into a channel, so a failure at one destination never touches the
//! others.

use crate::config::{expand_tilde, BackupJob, DestinationTarget};
use crate::credentials::CredentialProvider;
use crate::destinations::{naming, DestinationAdapter};
use crate::error::{BackupError, ErrorInfo, ErrorKind, Result};
use crate::managers::events::{EventSink, ProgressEvent};
use crate::managers::factory::AdapterFactory;
use crate::report::{ArtifactDescriptor, DestinationResult, DestinationState, JobReport, SpooledArtifact};
use crate::retention::{select_for_deletion, RetentionRule};
use crate::sources::SourceAdapter;
use crate::transform::TransformChain;
use crate::utils::cancel::CancelSignal;
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::locker::JobLock;
use crate::utils::retry::RetryPolicy;
use crate::utils::spool::Spool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct BackupOrchestrator {
    factory: Arc<dyn AdapterFactory>,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
    lock_directory: Option<PathBuf>,
    events: EventSink,
}

impl BackupOrchestrator {
    pub fn new(factory: Arc<dyn AdapterFactory>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            factory,
            credentials,
            clock: Arc::new(SystemClock),
            lock_directory: None,
            events: EventSink::disabled(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Hold a per-job lock file in `dir` for the duration of each run
    pub fn with_lock_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_directory = Some(dir.into());
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Run a job to completion.
    ///
    /// Never fails: every outcome, fatal ones included, is described by the
    /// returned report. `cancel` stops the run early; the job's own timeout
    /// is layered on top of it.
    pub async fn run(&self, job: &BackupJob, cancel: &CancelSignal) -> JobReport {
        let started_at = self.clock.now();
        info!(
            job = %job.name,
            destinations = job.destinations.len(),
            "Starting backup job"
        );

        let (signal, timer) = cancel.with_timeout(job.timeout);
        let outcome = self.run_locked(job, &signal).await;
        timer.abort();

        let finished_at = self.clock.now();
        let report = match outcome {
            Ok((artifact, results)) => {
                JobReport::new(&job.name, started_at, finished_at, Some(artifact), results, None)
            }
            Err(err) => {
                error!(job = %job.name, "Backup job aborted: {}", err);
                let info = ErrorInfo::from(&err);
                let results = job
                    .destinations
                    .iter()
                    .map(|d| DestinationResult::failed(&d.name, info.clone()))
                    .collect();
                JobReport::new(&job.name, started_at, finished_at, None, results, Some(info))
            }
        };

        for line in report.summary_lines() {
            info!(job = %job.name, "{}", line);
        }
        self.events.emit(
            &job.name,
            ProgressEvent::JobFinished {
                status: report.status,
            },
        );
        report
    }

    async fn run_locked(
        &self,
        job: &BackupJob,
        cancel: &CancelSignal,
    ) -> Result<(SpooledArtifact, Vec<DestinationResult>)> {
        let mut lock = match &self.lock_directory {
            Some(dir) => Some(JobLock::open(&expand_tilde(dir), &job.name)?),
            None => None,
        };
        let _guard = match lock.as_mut() {
            Some(lock) => Some(lock.try_acquire()?),
            None => None,
        };

        let (spool, artifact) = self.produce(job, cancel).await?;
        let results = self.fan_out(job, Arc::new(spool), &artifact, cancel).await;
        Ok((artifact, results))
    }

    /// Dump, transform and spool the artifact
    async fn produce(&self, job: &BackupJob, cancel: &CancelSignal) -> Result<(Spool, SpooledArtifact)> {
        // key material is checked before the database is touched
        let chain = TransformChain::from_options(&job.transform, self.credentials.as_ref())?;
        let mut source = self.factory.source(job, self.credentials.as_ref())?;

        let created_at = self.clock.now();
        let suffix = format!(".{}{}", source.extension(), chain.extension_suffix());
        let name = naming::artifact_name(&job.name, created_at, &suffix);

        let spooled = self.spool_dump(job, source.as_mut(), chain, &name, cancel).await;
        if let Err(e) = source.close().await {
            warn!(job = %job.name, "Failed to close {} source: {}", source.engine(), e);
        }
        let spool = spooled?;

        let artifact = SpooledArtifact {
            name,
            size_bytes: spool.size(),
            checksum: spool.checksum().to_string(),
            created_at,
        };
        self.events.emit(
            &job.name,
            ProgressEvent::SpoolCompleted {
                artifact: artifact.name.clone(),
                bytes: artifact.size_bytes,
                checksum: artifact.checksum.clone(),
            },
        );
        Ok((spool, artifact))
    }

    async fn spool_dump(
        &self,
        job: &BackupJob,
        source: &mut dyn SourceAdapter,
        chain: TransformChain,
        name: &str,
        cancel: &CancelSignal,
    ) -> Result<Spool> {
        connect_source(job, source, cancel).await?;

        let dump = source.stream_dump().await?;
        let mut stream = chain.apply(dump);

        self.events.emit(
            &job.name,
            ProgressEvent::SpoolStarted {
                artifact: name.to_string(),
            },
        );
        let dir = job.spool_directory.as_deref().map(expand_tilde);
        Spool::write_from(dir.as_deref(), stream.as_mut(), cancel).await
    }

    /// Run one worker per destination and collect their results in
    /// configuration order
    async fn fan_out(
        &self,
        job: &BackupJob,
        spool: Arc<Spool>,
        artifact: &SpooledArtifact,
        cancel: &CancelSignal,
    ) -> Vec<DestinationResult> {
        let mut results: Vec<DestinationResult> = job
            .destinations
            .iter()
            .map(|d| DestinationResult::pending(&d.name))
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, DestinationResult)>();
        let mut handles = Vec::new();

        for (index, target) in job.destinations.iter().enumerate() {
            let adapter = match self.factory.destination(target, self.credentials.as_ref()) {
                Ok(adapter) => adapter,
                Err(e) => {
                    error!(job = %job.name, destination = %target.name, "Cannot build destination: {}", e);
                    results[index] = DestinationResult::failed(&target.name, ErrorInfo::from(&e));
                    self.emit_state(&job.name, target, DestinationState::Failed);
                    continue;
                }
            };

            let worker = DestinationWorker {
                job: job.name.clone(),
                adapter,
                spool: Arc::clone(&spool),
                artifact_name: artifact.name.clone(),
                retention: job.retention.clone(),
                retry: job.retry.clone(),
                clock: Arc::clone(&self.clock),
                events: self.events.clone(),
                cancel: cancel.clone(),
            };
            let tx = tx.clone();
            handles.push((
                index,
                tokio::spawn(async move {
                    let result = worker.run().await;
                    // the collector only goes away if the run itself is dropped
                    let _ = tx.send((index, result));
                }),
            ));
        }
        drop(tx);

        while let Some((index, result)) = rx.recv().await {
            results[index] = result;
        }

        for (index, handle) in handles {
            if let Err(e) = handle.await {
                let name = job.destinations[index].name.clone();
                error!(job = %job.name, destination = %name, "Destination worker crashed: {}", e);
                results[index] = DestinationResult::failed(
                    &name,
                    ErrorInfo {
                        kind: ErrorKind::Transfer,
                        message: format!("worker crashed: {}", e),
                    },
                );
            }
        }

        results
    }

    fn emit_state(&self, job: &str, target: &DestinationTarget, state: DestinationState) {
        self.events.emit(
            job,
            ProgressEvent::StateChanged {
                destination: target.name.clone(),
                state,
            },
        );
    }
}

/// Connect the source, retrying transient failures
async fn connect_source(job: &BackupJob, source: &mut dyn SourceAdapter, cancel: &CancelSignal) -> Result<()> {
    let mut cancel = cancel.clone();
    let mut attempts = 0;
    loop {
        attempts += 1;
        match cancel.guard(source.connect()).await {
            Ok(()) => {
                debug!(job = %job.name, engine = source.engine(), "Source connected");
                return Ok(());
            }
            Err(e) if e.is_transient() && job.retry.can_retry(attempts) => {
                let delay = job.retry.next_delay(attempts);
                warn!(
                    job = %job.name,
                    attempt = attempts,
                    "Source connection failed, retrying in {:?}: {}",
                    delay, e
                );
                if !cancel.sleep(delay).await {
                    return Err(BackupError::Cancelled);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Drives one destination through connect, transfer, verify and retention
struct DestinationWorker {
    job: String,
    adapter: Box<dyn DestinationAdapter>,
    spool: Arc<Spool>,
    artifact_name: String,
    retention: RetentionRule,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: EventSink,
    cancel: CancelSignal,
}

impl DestinationWorker {
    async fn run(mut self) -> DestinationResult {
        let name = self.adapter.name().to_string();
        let mut result = DestinationResult::pending(&name);

        match self.transfer(&mut result).await {
            Ok(descriptor) => {
                info!(
                    job = %self.job,
                    destination = %name,
                    bytes = descriptor.size_bytes,
                    "Artifact stored and verified"
                );
                self.set_state(&mut result, DestinationState::Succeeded);
                result.artifact = Some(descriptor.clone());
                self.apply_retention(&descriptor, &mut result).await;
            }
            Err(e) => {
                error!(job = %self.job, destination = %name, "Destination failed: {}", e);
                result.error = Some(ErrorInfo::from(&e));
                self.set_state(&mut result, DestinationState::Failed);
            }
        }

        if let Err(e) = self.adapter.close().await {
            warn!(job = %self.job, destination = %name, "Failed to close destination: {}", e);
        }
        result
    }

    /// Attempt the upload until it succeeds, fails terminally or runs out
    /// of attempts
    async fn transfer(&mut self, result: &mut DestinationResult) -> Result<ArtifactDescriptor> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            result.attempts += 1;

            match self.attempt(result).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(e) if e.is_transient() && self.retry.can_retry(result.attempts) => {
                    let delay = self.retry.next_delay(result.attempts);
                    self.events.emit(
                        &self.job,
                        ProgressEvent::RetryScheduled {
                            destination: result.destination.clone(),
                            attempt: result.attempts,
                            delay,
                            error: ErrorInfo::from(&e),
                        },
                    );
                    if !self.cancel.sleep(delay).await {
                        return Err(BackupError::Cancelled);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&mut self, result: &mut DestinationResult) -> Result<ArtifactDescriptor> {
        self.set_state(result, DestinationState::Connecting);
        self.cancel.guard(self.adapter.connect()).await?;

        self.set_state(result, DestinationState::Transferring);
        let reader = self.spool.reader()?;
        let descriptor = self
            .adapter
            .put_stream(&self.artifact_name, Box::new(reader), &self.cancel)
            .await?;
        self.events.emit(
            &self.job,
            ProgressEvent::BytesTransferred {
                destination: result.destination.clone(),
                bytes: descriptor.size_bytes,
            },
        );

        self.set_state(result, DestinationState::Verifying);
        let verified = if descriptor.checksum.as_deref() != Some(self.spool.checksum())
            || descriptor.size_bytes != self.spool.size()
        {
            Err(BackupError::Integrity(format!(
                "{} at {}: bytes sent differ from the spooled artifact",
                descriptor.name, descriptor.destination
            )))
        } else {
            self.cancel
                .guard(self.adapter.verify_checksum(&descriptor))
                .await
        };

        if let Err(e) = verified {
            // an unverified artifact must not stay listable
            if let Err(cleanup) = self.adapter.delete_existing(&descriptor).await {
                warn!(
                    job = %self.job,
                    destination = %result.destination,
                    "Failed to remove unverified artifact {}: {}",
                    descriptor.name, cleanup
                );
            }
            return Err(e);
        }
        Ok(descriptor)
    }

    /// Delete prior artifacts selected by the retention rule. Runs only
    /// after the new artifact has been verified.
    async fn apply_retention(&mut self, new_artifact: &ArtifactDescriptor, result: &mut DestinationResult) {
        if self.cancel.is_cancelled() {
            warn!(job = %self.job, destination = %result.destination, "Cancelled before retention");
            result.error = Some(ErrorInfo::from(&BackupError::Cancelled));
            return;
        }

        let prefix = naming::artifact_prefix(&self.job);
        let existing = match self.adapter.list_existing(&prefix).await {
            Ok(list) => list
                .into_iter()
                .filter(|a| naming::is_artifact(&prefix, &a.name))
                .collect::<Vec<_>>(),
            Err(e) => {
                error!(job = %self.job, destination = %result.destination, "Listing for retention failed: {}", e);
                result.error = Some(ErrorInfo::from(&e));
                return;
            }
        };

        let doomed = select_for_deletion(&existing, new_artifact, &self.retention, self.clock.now());
        debug!(
            job = %self.job,
            destination = %result.destination,
            existing = existing.len(),
            selected = doomed.len(),
            "Retention evaluated"
        );

        let mut first_error = None;
        for artifact in doomed {
            match self.adapter.delete_existing(&artifact).await {
                Ok(()) => {
                    self.events.emit(
                        &self.job,
                        ProgressEvent::RetentionDeleted {
                            destination: result.destination.clone(),
                            artifact: artifact.name.clone(),
                        },
                    );
                    result.deleted.push(artifact);
                }
                Err(e) => {
                    error!(
                        job = %self.job,
                        destination = %result.destination,
                        "Failed to delete {}: {}",
                        artifact.name, e
                    );
                    first_error.get_or_insert(ErrorInfo::from(&e));
                }
            }
        }

        match first_error {
            Some(info) => result.error = Some(info),
            None => self.set_state(result, DestinationState::RetentionApplied),
        }
    }

    fn set_state(&self, result: &mut DestinationResult, state: DestinationState) {
        result.state = state;
        self.events.emit(
            &self.job,
            ProgressEvent::StateChanged {
                destination: result.destination.clone(),
                state,
            },
        );
    }
}
