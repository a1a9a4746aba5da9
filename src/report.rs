//! Run outcomes: artifact descriptors, per-destination results and the
//! aggregate job report

use crate::error::ErrorInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Succeeded,
    Failed,
}

/// Metadata about an artifact stored (or attempted) at a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub size_bytes: u64,
    /// SHA-256 hex digest, when known
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub destination: String,
    pub status: ArtifactStatus,
}

/// Per-destination state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationState {
    Pending,
    Connecting,
    Transferring,
    Verifying,
    Succeeded,
    Failed,
    RetentionApplied,
}

impl DestinationState {
    /// Whether the destination holds a verified artifact from this run
    pub fn is_verified(&self) -> bool {
        matches!(self, DestinationState::Succeeded | DestinationState::RetentionApplied)
    }
}

impl fmt::Display for DestinationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DestinationState::Pending => "pending",
            DestinationState::Connecting => "connecting",
            DestinationState::Transferring => "transferring",
            DestinationState::Verifying => "verifying",
            DestinationState::Succeeded => "succeeded",
            DestinationState::Failed => "failed",
            DestinationState::RetentionApplied => "retention_applied",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationResult {
    pub destination: String,
    pub state: DestinationState,
    /// The verified artifact, if the transfer succeeded
    pub artifact: Option<ArtifactDescriptor>,
    /// Why the destination did not reach `RetentionApplied`
    pub error: Option<ErrorInfo>,
    /// Transfer attempts consumed
    pub attempts: u32,
    /// Prior artifacts removed by retention
    pub deleted: Vec<ArtifactDescriptor>,
}

impl DestinationResult {
    pub fn pending(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            state: DestinationState::Pending,
            artifact: None,
            error: None,
            attempts: 0,
            deleted: Vec::new(),
        }
    }

    pub fn failed(destination: &str, error: ErrorInfo) -> Self {
        Self {
            state: DestinationState::Failed,
            error: Some(error),
            ..Self::pending(destination)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    AllSucceeded,
    PartialFailure,
    AllFailed,
}

impl JobStatus {
    /// Process exit status for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            JobStatus::AllSucceeded => 0,
            JobStatus::PartialFailure => 2,
            JobStatus::AllFailed => 1,
        }
    }

    /// Notification event name
    pub fn event_name(&self) -> &'static str {
        match self {
            JobStatus::AllSucceeded => "success",
            JobStatus::PartialFailure => "partial",
            JobStatus::AllFailed => "failure",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::AllSucceeded => "all succeeded",
            JobStatus::PartialFailure => "partial failure",
            JobStatus::AllFailed => "all failed",
        };
        f.write_str(s)
    }
}

/// Details of the spooled artifact shared by every destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpooledArtifact {
    pub name: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Final result of one job run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: JobStatus,
    pub artifact: Option<SpooledArtifact>,
    /// One entry per configured destination, in configuration order
    pub destinations: Vec<DestinationResult>,
    /// Error that stopped the run before fan-out
    pub fatal_error: Option<ErrorInfo>,
}

impl JobReport {
    pub fn new(
        job: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        artifact: Option<SpooledArtifact>,
        destinations: Vec<DestinationResult>,
        fatal_error: Option<ErrorInfo>,
    ) -> Self {
        let status = Self::aggregate(&destinations, fatal_error.is_some());
        Self {
            job: job.to_string(),
            started_at,
            finished_at,
            status,
            artifact,
            destinations,
            fatal_error,
        }
    }

    fn aggregate(destinations: &[DestinationResult], fatal: bool) -> JobStatus {
        if fatal || destinations.is_empty() {
            return JobStatus::AllFailed;
        }
        if destinations
            .iter()
            .all(|d| d.state == DestinationState::RetentionApplied)
        {
            JobStatus::AllSucceeded
        } else if destinations.iter().any(|d| d.state.is_verified()) {
            JobStatus::PartialFailure
        } else {
            JobStatus::AllFailed
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn result(&self, destination: &str) -> Option<&DestinationResult> {
        self.destinations
            .iter()
            .find(|d| d.destination == destination)
    }

    /// One line per destination, for logs and notifications
    pub fn summary_lines(&self) -> Vec<String> {
        self.destinations
            .iter()
            .map(|d| match &d.error {
                Some(err) => format!("{}: {} ({})", d.destination, d.state, err),
                None => format!(
                    "{}: {} after {} attempt(s), {} old artifact(s) removed",
                    d.destination,
                    d.state,
                    d.attempts,
                    d.deleted.len()
                ),
            })
            .collect()
    }
}
