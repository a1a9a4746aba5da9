//! Progress events emitted during a job run
//!
//! Every event is logged through `tracing`. When a channel is attached the
//! event is also delivered to the caller, which renders it however it likes.

use crate::error::ErrorInfo;
use crate::report::{DestinationState, JobStatus};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    SpoolStarted {
        artifact: String,
    },
    SpoolCompleted {
        artifact: String,
        bytes: u64,
        checksum: String,
    },
    StateChanged {
        destination: String,
        state: DestinationState,
    },
    BytesTransferred {
        destination: String,
        bytes: u64,
    },
    RetryScheduled {
        destination: String,
        attempt: u32,
        delay: Duration,
        error: ErrorInfo,
    },
    RetentionDeleted {
        destination: String,
        artifact: String,
    },
    JobFinished {
        status: JobStatus,
    },
}

/// Where progress events go
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<ProgressEvent>>,
}

impl EventSink {
    /// Log events and forward them to `tx`
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Log events only
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, job: &str, event: ProgressEvent) {
        log_event(job, &event);
        if let Some(tx) = &self.tx {
            // the receiver may have stopped listening
            let _ = tx.send(event);
        }
    }
}

fn log_event(job: &str, event: &ProgressEvent) {
    match event {
        ProgressEvent::SpoolStarted { artifact } => {
            info!(job, artifact = %artifact, "Spooling dump");
        }
        ProgressEvent::SpoolCompleted {
            artifact,
            bytes,
            checksum,
        } => {
            info!(job, artifact = %artifact, bytes, sha256 = %checksum, "Spool complete");
        }
        ProgressEvent::StateChanged { destination, state } => {
            info!(job, destination = %destination, state = %state, "Destination state changed");
        }
        ProgressEvent::BytesTransferred { destination, bytes } => {
            debug!(job, destination = %destination, bytes, "Transferred");
        }
        ProgressEvent::RetryScheduled {
            destination,
            attempt,
            delay,
            error,
        } => {
            warn!(
                job,
                destination = %destination,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, retrying: {}",
                error
            );
        }
        ProgressEvent::RetentionDeleted {
            destination,
            artifact,
        } => {
            info!(job, destination = %destination, artifact = %artifact, "Retention removed artifact");
        }
        ProgressEvent::JobFinished { status } => {
            info!(job, status = %status, "Job finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_events_reach_attached_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);

        sink.emit(
            "nightly",
            ProgressEvent::StateChanged {
                destination: "offsite".to_string(),
                state: DestinationState::Connecting,
            },
        );
        sink.emit(
            "nightly",
            ProgressEvent::JobFinished {
                status: JobStatus::AllSucceeded,
            },
        );

        assert!(matches!(
            rx.try_recv().unwrap(),
            ProgressEvent::StateChanged { state: DestinationState::Connecting, .. }
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            ProgressEvent::JobFinished { status: JobStatus::AllSucceeded }
        );
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new(tx);
        sink.emit("nightly", ProgressEvent::SpoolStarted { artifact: "a".into() });
        EventSink::disabled().emit("nightly", ProgressEvent::SpoolStarted { artifact: "b".into() });
    }
}
