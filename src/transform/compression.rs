use super::StreamTransformer;
use crate::error::{BackupError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

/// Streaming gzip stage
pub struct GzipCompressor {
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl GzipCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            encoder: Some(GzEncoder::new(Vec::new(), Compression::new(level.min(9)))),
        }
    }

    fn encoder(&mut self) -> Result<&mut GzEncoder<Vec<u8>>> {
        self.encoder
            .as_mut()
            .ok_or_else(|| BackupError::Source("gzip stage used after finish".to_string()))
    }
}

impl StreamTransformer for GzipCompressor {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn extension(&self) -> &'static str {
        "gz"
    }

    fn transform(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        let encoder = self.encoder()?;
        encoder.write_all(chunk)?;
        Ok(std::mem::take(encoder.get_mut()))
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| BackupError::Source("gzip stage finished twice".to_string()))?;
        Ok(encoder.finish()?)
    }
}
