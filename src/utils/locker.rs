//! File-based locking to prevent concurrent runs of the same job

use crate::error::{BackupError, Result};
use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Lock file for one backup job.
///
/// Opening the file does not lock it; [`JobLock::try_acquire`] takes the
/// exclusive lock and returns a guard tied to this value's lifetime.
pub struct JobLock {
    lock: RwLock<File>,
    lock_path: PathBuf,
    job_name: String,
}

impl JobLock {
    /// Open (creating if needed) the lock file for a job inside `lock_dir`
    pub fn open(lock_dir: &Path, job_name: &str) -> Result<Self> {
        std::fs::create_dir_all(lock_dir)?;
        let lock_path = Self::lock_path(lock_dir, job_name);

        debug!("Opening lock file: {:?}", lock_path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        Ok(Self {
            lock: RwLock::new(file),
            lock_path,
            job_name: job_name.to_string(),
        })
    }

    /// Take the exclusive lock, failing with [`BackupError::Locked`] if
    /// another run of the job holds it
    pub fn try_acquire(&mut self) -> Result<RwLockWriteGuard<'_, File>> {
        let guard = self
            .lock
            .try_write()
            .map_err(|_| BackupError::Locked(self.job_name.clone()))?;
        info!("Acquired run lock for job: {}", self.job_name);
        Ok(guard)
    }

    fn lock_path(lock_dir: &Path, job_name: &str) -> PathBuf {
        lock_dir.join(format!("db-backup-{}.lock", job_name))
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}
