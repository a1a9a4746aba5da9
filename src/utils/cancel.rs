//! Job-wide cancellation signal
//!
//! A [`CancelHandle`] is held by whoever may stop the job (operator
//! interrupt, timeout). Every worker holds a cloned [`CancelSignal`].

use crate::error::{BackupError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Sending side of the cancellation signal
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Receiving side, cheap to clone
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (
            Self { tx },
            CancelSignal {
                rx,
                _keepalive: None,
            },
        )
    }

    pub fn cancel(&self) {
        // receivers may already be gone
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    ///
    /// If every handle is dropped without cancelling, this never resolves.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `delay`, returning `false` early if cancelled
    pub async fn sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancelled() => false,
        }
    }

    /// Run `fut` unless cancellation arrives first, which yields
    /// [`BackupError::Cancelled`]
    pub async fn guard<F, T>(&mut self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(BackupError::Cancelled),
            res = fut => res,
        }
    }

    /// Derive a signal that also fires after `timeout`.
    ///
    /// The caller owns the forwarding task and should abort it once the job
    /// is over.
    pub fn with_timeout(&self, timeout: Option<Duration>) -> (CancelSignal, tokio::task::JoinHandle<()>) {
        let (handle, signal) = CancelHandle::new();
        if self.is_cancelled() {
            handle.cancel();
        }
        let mut upstream = self.clone();
        let task = tokio::spawn(async move {
            match timeout {
                Some(limit) => {
                    tokio::select! {
                        _ = upstream.cancelled() => {}
                        _ = tokio::time::sleep(limit) => {
                            tracing::warn!("Job timeout of {:?} reached, cancelling", limit);
                        }
                    }
                }
                None => upstream.cancelled().await,
            }
            handle.cancel();
        });
        (signal, task)
    }
}
