//! Storage destinations
//!
//! Every adapter stages an upload under a temporary name or session and
//! commits it atomically, so a failed or cancelled transfer never leaves an
//! artifact visible under its final name.

mod local;
pub mod naming;
mod s3;
mod sftp;

pub use local::LocalDestination;
pub use s3::S3Destination;
pub use sftp::{SftpAuth, SftpDestination};

use crate::error::{BackupError, Result};
use crate::report::ArtifactDescriptor;
use crate::sources::ArtifactStream;
use crate::utils::cancel::CancelSignal;
use async_trait::async_trait;

#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    /// Configured destination name
    fn name(&self) -> &str;

    async fn connect(&mut self) -> Result<()>;

    /// Upload `stream` as `name`.
    ///
    /// The returned descriptor carries the size and SHA-256 of the bytes
    /// sent. On error or cancellation the staged upload is removed
    /// best-effort and nothing appears under `name`.
    async fn put_stream(
        &mut self,
        name: &str,
        stream: ArtifactStream,
        cancel: &CancelSignal,
    ) -> Result<ArtifactDescriptor>;

    /// Re-read the stored artifact and compare its checksum, failing with
    /// `Integrity` on mismatch
    async fn verify_checksum(&mut self, descriptor: &ArtifactDescriptor) -> Result<()>;

    /// Committed artifacts whose names start with `prefix`
    async fn list_existing(&mut self, prefix: &str) -> Result<Vec<ArtifactDescriptor>>;

    /// Delete an artifact. An already-absent artifact counts as deleted;
    /// any other failure is reported.
    async fn delete_existing(&mut self, descriptor: &ArtifactDescriptor) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Compare a recomputed digest against the descriptor
pub(crate) fn check_digest(descriptor: &ArtifactDescriptor, actual: &str, size: u64) -> Result<()> {
    let expected = descriptor.checksum.as_deref().ok_or_else(|| {
        BackupError::Integrity(format!("{} has no checksum to verify", descriptor.name))
    })?;

    if size != descriptor.size_bytes {
        return Err(BackupError::Integrity(format!(
            "{} at {}: expected {} bytes, found {}",
            descriptor.name, descriptor.destination, descriptor.size_bytes, size
        )));
    }
    if !expected.eq_ignore_ascii_case(actual) {
        return Err(BackupError::Integrity(format!(
            "{} at {}: expected sha256 {}, found {}",
            descriptor.name, descriptor.destination, expected, actual
        )));
    }
    Ok(())
}

/// Random token for staging names
pub(crate) fn staging_token() -> String {
    use aes_gcm::aead::rand_core::RngCore;
    let mut bytes = [0u8; 6];
    aes_gcm::aead::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// In-memory destination with fault injection, for orchestration tests
#[allow(dead_code)]
pub mod mock {
    use super::*;
    use crate::report::ArtifactStatus;
    use crate::utils::checksum::{sha256_hex, Checksum};
    use chrono::{DateTime, Utc};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    /// Recorded destination call
    #[derive(Clone, Debug, PartialEq)]
    pub enum DestinationCall {
        Connect,
        Put { name: String },
        Verify { name: String },
        List { prefix: String },
        Delete { name: String },
        Close,
    }

    #[derive(Clone, Debug)]
    pub struct MockObject {
        pub data: Vec<u8>,
        pub created_at: DateTime<Utc>,
    }

    #[derive(Default)]
    struct MockState {
        objects: BTreeMap<String, MockObject>,
        staging: BTreeMap<String, Vec<u8>>,
        calls: Vec<DestinationCall>,
        connect_failures: u32,
        put_failures: u32,
        verify_failures: u32,
        reject_auth: bool,
        corrupt: bool,
        hang: bool,
        fail_delete: bool,
    }

    /// Clones share state, so a test can keep one handle and give another
    /// to the orchestrator
    #[derive(Clone)]
    pub struct MockDestination {
        name: String,
        state: Arc<Mutex<MockState>>,
    }

    impl MockDestination {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                state: Arc::new(Mutex::new(MockState::default())),
            }
        }

        /// Fail the next `count` connects with a `Connection` error
        pub fn with_connect_failures(self, count: u32) -> Self {
            self.state.lock().unwrap().connect_failures = count;
            self
        }

        /// Fail the next `count` uploads with a `Transfer` error
        pub fn with_transient_failures(self, count: u32) -> Self {
            self.state.lock().unwrap().put_failures = count;
            self
        }

        /// Fail the next `count` verifications with a `Transfer` error
        pub fn with_verify_failures(self, count: u32) -> Self {
            self.state.lock().unwrap().verify_failures = count;
            self
        }

        /// Reject every connect with an `Authentication` error
        pub fn failing_permanently(self) -> Self {
            self.state.lock().unwrap().reject_auth = true;
            self
        }

        /// Store different bytes than were sent
        pub fn corrupting(self) -> Self {
            self.state.lock().unwrap().corrupt = true;
            self
        }

        /// Stall uploads until cancelled
        pub fn hanging(self) -> Self {
            self.state.lock().unwrap().hang = true;
            self
        }

        pub fn failing_deletes(self) -> Self {
            self.state.lock().unwrap().fail_delete = true;
            self
        }

        /// Pre-populate a committed artifact
        pub fn with_object(self, name: &str, data: &[u8], created_at: DateTime<Utc>) -> Self {
            self.state.lock().unwrap().objects.insert(
                name.to_string(),
                MockObject {
                    data: data.to_vec(),
                    created_at,
                },
            );
            self
        }

        pub fn object_names(&self) -> Vec<String> {
            self.state.lock().unwrap().objects.keys().cloned().collect()
        }

        pub fn object(&self, name: &str) -> Option<MockObject> {
            self.state.lock().unwrap().objects.get(name).cloned()
        }

        /// Uploads currently staged but not committed
        pub fn staging_count(&self) -> usize {
            self.state.lock().unwrap().staging.len()
        }

        pub fn get_calls(&self) -> Vec<DestinationCall> {
            self.state.lock().unwrap().calls.clone()
        }

        pub fn put_count(&self) -> usize {
            self.get_calls()
                .iter()
                .filter(|c| matches!(c, DestinationCall::Put { .. }))
                .count()
        }

        pub fn delete_count(&self) -> usize {
            self.get_calls()
                .iter()
                .filter(|c| matches!(c, DestinationCall::Delete { .. }))
                .count()
        }

        fn record(&self, call: DestinationCall) {
            self.state.lock().unwrap().calls.push(call);
        }

        fn descriptor(&self, name: &str, obj: &MockObject) -> ArtifactDescriptor {
            ArtifactDescriptor {
                name: name.to_string(),
                size_bytes: obj.data.len() as u64,
                checksum: Some(sha256_hex(&obj.data)),
                created_at: obj.created_at,
                destination: self.name.clone(),
                status: ArtifactStatus::Succeeded,
            }
        }
    }

    #[async_trait]
    impl DestinationAdapter for MockDestination {
        fn name(&self) -> &str {
            &self.name
        }

        async fn connect(&mut self) -> Result<()> {
            self.record(DestinationCall::Connect);
            let mut state = self.state.lock().unwrap();
            if state.reject_auth {
                return Err(BackupError::Authentication(format!(
                    "{}: credentials rejected",
                    self.name
                )));
            }
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(BackupError::Connection(format!(
                    "{}: connection reset",
                    self.name
                )));
            }
            Ok(())
        }

        async fn put_stream(
            &mut self,
            name: &str,
            mut stream: ArtifactStream,
            cancel: &CancelSignal,
        ) -> Result<ArtifactDescriptor> {
            self.record(DestinationCall::Put {
                name: name.to_string(),
            });
            let staging = naming::staging_name(name, &staging_token());
            self.state
                .lock()
                .unwrap()
                .staging
                .insert(staging.clone(), Vec::new());

            let outcome = self.receive(&staging, stream.as_mut(), cancel).await;

            let mut state = self.state.lock().unwrap();
            let mut data = state.staging.remove(&staging).unwrap_or_default();
            let checksum = outcome?;

            let size_bytes = data.len() as u64;
            if state.corrupt && !data.is_empty() {
                data[0] ^= 0xff;
            }
            let created_at = naming::embedded_timestamp(name).unwrap_or_else(Utc::now);
            state
                .objects
                .insert(name.to_string(), MockObject { data, created_at });

            Ok(ArtifactDescriptor {
                name: name.to_string(),
                size_bytes,
                checksum: Some(checksum),
                created_at,
                destination: self.name.clone(),
                status: ArtifactStatus::Succeeded,
            })
        }

        async fn verify_checksum(&mut self, descriptor: &ArtifactDescriptor) -> Result<()> {
            self.record(DestinationCall::Verify {
                name: descriptor.name.clone(),
            });
            let mut state = self.state.lock().unwrap();
            if state.verify_failures > 0 {
                state.verify_failures -= 1;
                return Err(BackupError::Transfer(format!(
                    "{}: read timed out",
                    self.name
                )));
            }
            let obj = state.objects.get(&descriptor.name).ok_or_else(|| {
                BackupError::Integrity(format!("{} is missing after upload", descriptor.name))
            })?;
            check_digest(descriptor, &sha256_hex(&obj.data), obj.data.len() as u64)
        }

        async fn list_existing(&mut self, prefix: &str) -> Result<Vec<ArtifactDescriptor>> {
            self.record(DestinationCall::List {
                prefix: prefix.to_string(),
            });
            let state = self.state.lock().unwrap();
            Ok(state
                .objects
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(name, obj)| self.descriptor(name, obj))
                .collect())
        }

        async fn delete_existing(&mut self, descriptor: &ArtifactDescriptor) -> Result<()> {
            self.record(DestinationCall::Delete {
                name: descriptor.name.clone(),
            });
            let mut state = self.state.lock().unwrap();
            if state.fail_delete {
                return Err(BackupError::Transfer(format!(
                    "{}: delete of {} not confirmed",
                    self.name, descriptor.name
                )));
            }
            state.objects.remove(&descriptor.name);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.record(DestinationCall::Close);
            Ok(())
        }
    }

    impl MockDestination {
        async fn receive(
            &self,
            staging: &str,
            stream: &mut dyn crate::sources::ChunkStream,
            cancel: &CancelSignal,
        ) -> Result<String> {
            let mut cancel = cancel.clone();
            let (fail, hang) = {
                let mut state = self.state.lock().unwrap();
                let fail = state.put_failures > 0;
                if fail {
                    state.put_failures -= 1;
                }
                (fail, state.hang)
            };

            let mut checksum = Checksum::new();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(BackupError::Cancelled),
                    next = stream.next_chunk() => next?,
                };
                let Some(chunk) = next else { break };
                checksum.update(&chunk);
                if let Some(buf) = self.state.lock().unwrap().staging.get_mut(staging) {
                    buf.extend_from_slice(&chunk);
                }
                if fail {
                    return Err(BackupError::Transfer(format!(
                        "{}: connection reset during upload",
                        self.name
                    )));
                }
            }

            if fail {
                return Err(BackupError::Transfer(format!(
                    "{}: connection reset during upload",
                    self.name
                )));
            }
            if hang {
                cancel.cancelled().await;
                return Err(BackupError::Cancelled);
            }
            Ok(checksum.finalize())
        }
    }
}
