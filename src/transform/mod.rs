//! Transform chain applied to the dump stream before spooling
//!
//! Stages run strictly in declared order (compression, then encryption) and
//! operate chunk by chunk, so memory use does not depend on dump size.

mod compression;
mod encryption;

pub use compression::GzipCompressor;
pub use encryption::{AesGcmEncryptor, KdfParams};

use crate::config::TransformOptions;
use crate::credentials::{CredentialProvider, SecretKind};
use crate::error::{BackupError, Result};
use crate::sources::{ArtifactStream, ChunkStream};
use async_trait::async_trait;
use tracing::debug;

/// One synchronous stage of the chain
pub trait StreamTransformer: Send {
    fn name(&self) -> &'static str;

    /// Suffix appended to the artifact name, without the dot
    fn extension(&self) -> &'static str;

    /// Feed one chunk, returning whatever output is ready
    fn transform(&mut self, chunk: &[u8]) -> Result<Vec<u8>>;

    /// Flush buffered state at end of input
    fn finish(&mut self) -> Result<Vec<u8>>;
}

#[derive(Default)]
pub struct TransformChain {
    stages: Vec<Box<dyn StreamTransformer>>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, stage: Box<dyn StreamTransformer>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Build the chain for a job. Encryption key material is resolved here,
    /// so a missing or malformed key fails before the source is touched.
    pub fn from_options(
        options: &TransformOptions,
        credentials: &dyn CredentialProvider,
    ) -> Result<Self> {
        let mut chain = Self::new();

        if options.compress {
            chain = chain.push(Box::new(GzipCompressor::new(options.compression_level)));
        }

        if let Some(key_ref) = &options.encryption_key_ref {
            let secret = credentials
                .resolve(SecretKind::EncryptionKey, key_ref)
                .map_err(|e| BackupError::Encryption(format!("Encryption key unavailable: {}", e)))?;
            chain = chain.push(Box::new(AesGcmEncryptor::from_secret(&secret)?));
        }

        debug!("Transform chain: [{}]", chain.stage_names().join(" -> "));
        Ok(chain)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Name suffix for the transformed artifact, e.g. `.gz.enc`
    pub fn extension_suffix(&self) -> String {
        self.stages
            .iter()
            .map(|s| format!(".{}", s.extension()))
            .collect()
    }

    /// Wrap `input` so every chunk passes through the chain
    pub fn apply(self, input: ArtifactStream) -> ArtifactStream {
        if self.stages.is_empty() {
            return input;
        }
        Box::new(TransformedStream {
            input,
            stages: self.stages,
            finished: false,
        })
    }
}

struct TransformedStream {
    input: ArtifactStream,
    stages: Vec<Box<dyn StreamTransformer>>,
    finished: bool,
}

#[async_trait]
impl ChunkStream for TransformedStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.finished {
                return Ok(None);
            }

            match self.input.next_chunk().await? {
                Some(chunk) => {
                    let mut data = chunk;
                    for stage in self.stages.iter_mut() {
                        data = stage.transform(&data)?;
                    }
                    if !data.is_empty() {
                        return Ok(Some(data));
                    }
                }
                None => {
                    self.finished = true;
                    // each stage's tail is fed through the stages after it
                    let mut carry = Vec::new();
                    for stage in self.stages.iter_mut() {
                        let mut out = stage.transform(&carry)?;
                        out.extend(stage.finish()?);
                        carry = out;
                    }
                    if !carry.is_empty() {
                        return Ok(Some(carry));
                    }
                }
            }
        }
    }
}
