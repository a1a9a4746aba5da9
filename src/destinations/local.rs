//! Local or mounted filesystem destination

use super::{check_digest, naming, staging_token, DestinationAdapter};
use crate::config::expand_tilde;
use crate::error::{BackupError, Result};
use crate::report::{ArtifactDescriptor, ArtifactStatus};
use crate::sources::{ArtifactStream, CHUNK_SIZE};
use crate::utils::cancel::CancelSignal;
use crate::utils::checksum::Checksum;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

pub struct LocalDestination {
    name: String,
    dir: PathBuf,
}

impl LocalDestination {
    pub fn new(name: &str, dir: &Path) -> Self {
        Self {
            name: name.to_string(),
            dir: expand_tilde(dir),
        }
    }

    async fn write_staged(
        &self,
        staging: &Path,
        stream: &mut ArtifactStream,
        cancel: &CancelSignal,
    ) -> Result<Checksum> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(staging)
            .await
            .map_err(write_error)?;
        let mut checksum = Checksum::new();
        let mut cancel = cancel.clone();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                next = stream.next_chunk() => next?,
            };
            let Some(chunk) = next else { break };
            file.write_all(&chunk).await.map_err(write_error)?;
            checksum.update(&chunk);
        }

        file.flush().await.map_err(write_error)?;
        file.sync_all().await.map_err(write_error)?;
        Ok(checksum)
    }
}

/// Failures on the destination side are retryable transfer errors; source
/// read errors keep their own kind.
fn write_error(err: std::io::Error) -> BackupError {
    BackupError::from(err).into_transfer()
}

#[async_trait]
impl DestinationAdapter for LocalDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        debug!("Local destination ready at {:?}", self.dir);
        Ok(())
    }

    async fn put_stream(
        &mut self,
        name: &str,
        mut stream: ArtifactStream,
        cancel: &CancelSignal,
    ) -> Result<ArtifactDescriptor> {
        let staging = self.dir.join(naming::staging_name(name, &staging_token()));
        let target = self.dir.join(name);

        let checksum = match self.write_staged(&staging, &mut stream, cancel).await {
            Ok(checksum) => checksum,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&staging).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove staged file {:?}: {}", staging, cleanup);
                    }
                }
                return Err(e);
            }
        };

        tokio::fs::rename(&staging, &target)
            .await
            .map_err(write_error)?;

        let size_bytes = checksum.bytes();
        info!("Wrote {} ({} bytes) to {:?}", name, size_bytes, self.dir);

        Ok(ArtifactDescriptor {
            name: name.to_string(),
            size_bytes,
            checksum: Some(checksum.finalize()),
            created_at: naming::embedded_timestamp(name).unwrap_or_else(Utc::now),
            destination: self.name.clone(),
            status: ArtifactStatus::Succeeded,
        })
    }

    async fn verify_checksum(&mut self, descriptor: &ArtifactDescriptor) -> Result<()> {
        let path = self.dir.join(&descriptor.name);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            BackupError::Integrity(format!("Cannot open {:?} for verification: {}", path, e))
        })?;

        let mut checksum = Checksum::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            checksum.update(&buf[..n]);
        }

        let size = checksum.bytes();
        check_digest(descriptor, &checksum.finalize(), size)
    }

    async fn list_existing(&mut self, prefix: &str) -> Result<Vec<ArtifactDescriptor>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(prefix) || naming::is_staging(&name) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }

            let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::from);
            let created_at = naming::parse_timestamp(prefix, &name)
                .or(modified)
                .unwrap_or_else(Utc::now);

            found.push(ArtifactDescriptor {
                name,
                size_bytes: meta.len(),
                checksum: None,
                created_at,
                destination: self.name.clone(),
                status: ArtifactStatus::Succeeded,
            });
        }
        Ok(found)
    }

    async fn delete_existing(&mut self, descriptor: &ArtifactDescriptor) -> Result<()> {
        let path = self.dir.join(&descriptor.name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::Transfer(format!(
                "Failed to delete {:?}: {}",
                path, e
            ))),
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sources::{ChunkStream, MemoryStream};
    use crate::utils::cancel::CancelHandle;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Broken(u8);

    #[async_trait]
    impl ChunkStream for Broken {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
            if self.0 == 0 {
                return Err(BackupError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "spool vanished",
                )));
            }
            self.0 -= 1;
            Ok(Some(vec![1; 100]))
        }
    }

    fn artifact(day: u32) -> String {
        naming::artifact_name(
            "nightly",
            Utc.with_ymd_and_hms(2026, 4, day, 1, 0, 0).unwrap(),
            ".sql.gz",
        )
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_put_verify_list_delete() {
        let dir = TempDir::new().unwrap();
        let mut dest = LocalDestination::new("disk", &dir.path().join("db"));
        dest.connect().await.unwrap();

        let name = artifact(1);
        let desc = dest
            .put_stream(
                &name,
                Box::new(MemoryStream::from_bytes(b"dump bytes", 4)),
                &CancelSignal::never(),
            )
            .await
            .unwrap();
        assert_eq!(desc.size_bytes, 10);
        dest.verify_checksum(&desc).await.unwrap();

        let listed = dest.list_existing("nightly-").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].created_at, desc.created_at);

        dest.delete_existing(&desc).await.unwrap();
        dest.delete_existing(&desc).await.unwrap();
        assert!(dest.list_existing("nightly-").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let mut dest = LocalDestination::new("disk", dir.path());
        dest.connect().await.unwrap();

        let err = dest
            .put_stream(&artifact(2), Box::new(Broken(3)), &CancelSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(listing(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_is_transfer_error() {
        let dir = TempDir::new().unwrap();
        let mut dest = LocalDestination::new("disk", &dir.path().join("unmounted"));

        let err = dest
            .put_stream(
                &artifact(7),
                Box::new(MemoryStream::from_bytes(b"dump bytes", 4)),
                &CancelSignal::never(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert!(err.is_transient());
        assert!(!dir.path().join("unmounted").exists());
    }

    #[tokio::test]
    async fn test_cancelled_upload_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let mut dest = LocalDestination::new("disk", dir.path());
        let (handle, signal) = CancelHandle::new();
        handle.cancel();

        let err = dest
            .put_stream(
                &artifact(3),
                Box::new(MemoryStream::from_bytes(&[0u8; 4096], 512)),
                &signal,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(listing(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_list_skips_partials_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(artifact(4)), b"a").unwrap();
        std::fs::write(dir.path().join(naming::staging_name(&artifact(5), "x")), b"b").unwrap();
        std::fs::write(dir.path().join("README"), b"c").unwrap();

        let mut dest = LocalDestination::new("disk", dir.path());
        let listed = dest.list_existing("nightly-").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, artifact(4));
    }

    #[tokio::test]
    async fn test_tampered_file_fails_verification() {
        let dir = TempDir::new().unwrap();
        let mut dest = LocalDestination::new("disk", dir.path());
        let name = artifact(6);
        let desc = dest
            .put_stream(
                &name,
                Box::new(MemoryStream::from_bytes(b"original", 8)),
                &CancelSignal::never(),
            )
            .await
            .unwrap();

        std::fs::write(dir.path().join(&name), b"modified").unwrap();
        let err = dest.verify_checksum(&desc).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }
}
