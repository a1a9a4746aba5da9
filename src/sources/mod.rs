//! Database sources
//!
//! A [`SourceAdapter`] turns a configured database into a single-pass
//! [`ArtifactStream`] of dump bytes. Consistency of the snapshot is the
//! adapter's responsibility; the orchestrator only consumes the stream.

mod mysql;
mod postgres;
mod process;

pub use mysql::MySqlSource;
pub use postgres::PostgresSource;
pub use process::ProcessDumpStream;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;

/// Chunk size used by every stream producer in the crate
pub const CHUNK_SIZE: usize = 64 * 1024;

/// One pull-based, finite, non-restartable sequence of byte chunks
#[async_trait]
pub trait ChunkStream: Send {
    /// Next chunk, or `None` once the stream is exhausted.
    ///
    /// An error ends the stream; callers must not poll again afterwards.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

pub type ArtifactStream = Box<dyn ChunkStream>;

/// Stream over chunks already held in memory
pub struct MemoryStream {
    chunks: VecDeque<Vec<u8>>,
}

impl MemoryStream {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into(),
        }
    }

    /// Split `data` into chunks of at most `chunk_size` bytes
    pub fn from_bytes(data: &[u8], chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self::new(data.chunks(chunk_size).map(|c| c.to_vec()).collect())
    }
}

#[async_trait]
impl ChunkStream for MemoryStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.chunks.pop_front())
    }
}

/// Drain a stream into memory. Only meant for small payloads and tests.
pub async fn read_to_end(stream: &mut dyn ChunkStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next_chunk().await? {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// A database engine that can produce a consistent dump
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Engine name used in logs ("mysql", "postgres")
    fn engine(&self) -> &'static str;

    /// File extension of the raw dump
    fn extension(&self) -> &'static str {
        "sql"
    }

    /// Verify connectivity and credentials.
    ///
    /// Fails with `Connection` on network trouble and `Authentication` when
    /// the server rejects the credentials.
    async fn connect(&mut self) -> Result<()>;

    /// Start the dump. Errors reported by the export mechanism surface as
    /// `Source` errors from the returned stream.
    async fn stream_dump(&mut self) -> Result<ArtifactStream>;

    /// Release anything acquired by `connect`. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

/// In-memory source for orchestration tests
#[allow(dead_code)]
pub mod mock {
    use super::*;
    use crate::error::BackupError;
    use std::sync::{Arc, Mutex};

    /// Recorded source call
    #[derive(Clone, Debug, PartialEq)]
    pub enum SourceCall {
        Connect,
        StreamDump,
        Close,
    }

    /// Mock source producing a fixed payload
    #[derive(Clone)]
    pub struct MockSource {
        payload: Arc<Vec<u8>>,
        chunk_size: usize,
        /// Recorded calls
        pub calls: Arc<Mutex<Vec<SourceCall>>>,
        /// Connection failures to report before connecting succeeds
        connect_failures: Arc<Mutex<u32>>,
        /// Fail the stream after this many bytes with a `Source` error
        fail_after: Option<usize>,
        reject_auth: bool,
    }

    impl MockSource {
        pub fn new(payload: impl Into<Vec<u8>>) -> Self {
            Self {
                payload: Arc::new(payload.into()),
                chunk_size: 1024,
                calls: Arc::new(Mutex::new(Vec::new())),
                connect_failures: Arc::new(Mutex::new(0)),
                fail_after: None,
                reject_auth: false,
            }
        }

        pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
            self.chunk_size = chunk_size.max(1);
            self
        }

        /// Report `count` connection errors before connecting
        pub fn with_connect_failures(self, count: u32) -> Self {
            *self.connect_failures.lock().unwrap() = count;
            self
        }

        /// Abort the dump mid-stream after `bytes` bytes
        pub fn failing_after(mut self, bytes: usize) -> Self {
            self.fail_after = Some(bytes);
            self
        }

        /// Reject credentials on connect
        pub fn rejecting_auth(mut self) -> Self {
            self.reject_auth = true;
            self
        }

        pub fn get_calls(&self) -> Vec<SourceCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, call: &SourceCall) -> usize {
            self.get_calls().iter().filter(|c| *c == call).count()
        }
    }

    struct FailingStream {
        inner: MemoryStream,
        remaining: usize,
    }

    #[async_trait]
    impl ChunkStream for FailingStream {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
            match self.inner.next_chunk().await? {
                Some(chunk) if chunk.len() <= self.remaining => {
                    self.remaining -= chunk.len();
                    Ok(Some(chunk))
                }
                _ => Err(BackupError::Source(
                    "dump process exited with status 2: lost connection".to_string(),
                )),
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for MockSource {
        fn engine(&self) -> &'static str {
            "mock"
        }

        async fn connect(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push(SourceCall::Connect);
            if self.reject_auth {
                return Err(BackupError::Authentication(
                    "access denied for user".to_string(),
                ));
            }
            let mut failures = self.connect_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(BackupError::Connection("connection refused".to_string()));
            }
            Ok(())
        }

        async fn stream_dump(&mut self) -> Result<ArtifactStream> {
            self.calls.lock().unwrap().push(SourceCall::StreamDump);
            let inner = MemoryStream::from_bytes(&self.payload, self.chunk_size);
            match self.fail_after {
                Some(remaining) => Ok(Box::new(FailingStream { inner, remaining })),
                None => Ok(Box::new(inner)),
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push(SourceCall::Close);
            Ok(())
        }
    }
}
