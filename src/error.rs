//! Error taxonomy shared by every pipeline stage
//!
//! Each variant maps to one [`ErrorKind`]. Only connection and transfer
//! errors are transient; everything else is terminal for the attempt that
//! produced it.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Source dump failed: {0}")]
    Source(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Credential {kind} '{id}' could not be resolved: {reason}")]
    Credential {
        kind: String,
        id: String,
        reason: String,
    },

    #[error("Authentication rejected: {0}")]
    Authentication(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Job '{0}' is already running (lock held)")]
    Locked(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Serializable classification of a [`BackupError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Source,
    Transfer,
    Integrity,
    Encryption,
    Credential,
    Authentication,
    Config,
    Locked,
    Cancelled,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Source => "SourceError",
            ErrorKind::Transfer => "TransferError",
            ErrorKind::Integrity => "IntegrityError",
            ErrorKind::Encryption => "EncryptionError",
            ErrorKind::Credential => "CredentialError",
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Locked => "LockedError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Io => "IoError",
        };
        f.write_str(name)
    }
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::Connection(_) => ErrorKind::Connection,
            BackupError::Source(_) => ErrorKind::Source,
            BackupError::Transfer(_) => ErrorKind::Transfer,
            BackupError::Integrity(_) => ErrorKind::Integrity,
            BackupError::Encryption(_) => ErrorKind::Encryption,
            BackupError::Credential { .. } => ErrorKind::Credential,
            BackupError::Authentication(_) => ErrorKind::Authentication,
            BackupError::Config(_) => ErrorKind::Config,
            BackupError::Locked(_) => ErrorKind::Locked,
            BackupError::Cancelled => ErrorKind::Cancelled,
            BackupError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether a retry of the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, BackupError::Connection(_) | BackupError::Transfer(_))
    }

    /// Re-tag a local I/O failure that happened while talking to a remote
    /// as a transfer error, leaving every other variant alone.
    pub fn into_transfer(self) -> Self {
        match self {
            BackupError::Io(e) => BackupError::Transfer(e.to_string()),
            other => other,
        }
    }
}

/// Error as recorded in reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&BackupError> for ErrorInfo {
    fn from(err: &BackupError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
