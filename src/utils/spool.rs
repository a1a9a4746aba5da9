//! Local spool file holding the transformed artifact for fan-out
//!
//! Written exactly once, then read by any number of independent readers.
//! The file is removed when the [`Spool`] is dropped.

use crate::error::{BackupError, Result};
use crate::sources::{ChunkStream, CHUNK_SIZE};
use crate::utils::cancel::CancelSignal;
use crate::utils::checksum::Checksum;
use async_trait::async_trait;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

pub struct Spool {
    file: NamedTempFile,
    size: u64,
    checksum: String,
}

impl Spool {
    /// Drain `stream` into a new spool file in `dir` (system temp dir when
    /// `None`), hashing as it goes
    pub async fn write_from(
        dir: Option<&Path>,
        stream: &mut dyn ChunkStream,
        cancel: &CancelSignal,
    ) -> Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("db-backup-").suffix(".spool");
            b
        };
        let file = match dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                builder.tempfile_in(dir)?
            }
            None => builder.tempfile()?,
        };
        debug!("Spooling to {:?}", file.path());

        let mut writer = tokio::fs::File::from_std(file.as_file().try_clone()?);
        let mut checksum = Checksum::new();
        let mut cancel = cancel.clone();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                next = stream.next_chunk() => next?,
            };
            let Some(chunk) = next else { break };
            writer.write_all(&chunk).await?;
            checksum.update(&chunk);
        }
        writer.flush().await?;

        let size = checksum.bytes();
        Ok(Self {
            file,
            size,
            checksum: checksum.finalize(),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// SHA-256 hex digest of the spooled bytes
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Open an independent reader positioned at the start
    pub fn reader(&self) -> Result<SpoolReader> {
        let handle = self.file.reopen()?;
        Ok(SpoolReader {
            file: tokio::fs::File::from_std(handle),
        })
    }
}

pub struct SpoolReader {
    file: tokio::fs::File,
}

#[async_trait]
impl ChunkStream for SpoolReader {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = self.file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}
