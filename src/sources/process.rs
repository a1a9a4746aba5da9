//! Dump tools run as child processes

use super::{ChunkStream, CHUNK_SIZE};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error};

const STDERR_TAIL_BYTES: usize = 1024;

/// Streams a child's stdout; the exit status is checked at end of stream
pub struct ProcessDumpStream {
    program: String,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<Vec<u8>>>,
}

impl ProcessDumpStream {
    /// Spawn `cmd` with piped output. The child is killed if the stream is
    /// dropped before it finishes.
    pub fn spawn(mut cmd: Command, program: &str) -> Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Spawning dump process: {}", program);

        let mut child = cmd
            .spawn()
            .map_err(|e| BackupError::Source(format!("Failed to start {}: {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackupError::Source(format!("{} has no stdout pipe", program)))?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        Ok(Self {
            program: program.to_string(),
            child,
            stdout: Some(stdout),
            stderr_task,
        })
    }

    async fn finish(&mut self) -> Result<()> {
        let status = self.child.wait().await.map_err(|e| {
            BackupError::Source(format!("Failed to wait for {}: {}", self.program, e))
        })?;

        let stderr = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if !status.success() {
            let tail = stderr_tail(&stderr);
            error!("{} failed with {}: {}", self.program, status, tail);
            return Err(BackupError::Source(format!(
                "{} exited with {}: {}",
                self.program, status, tail
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkStream for ProcessDumpStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = stdout.read(&mut buf).await.map_err(|e| {
            BackupError::Source(format!("Failed reading {} output: {}", self.program, e))
        })?;

        if n > 0 {
            buf.truncate(n);
            return Ok(Some(buf));
        }

        self.stdout = None;
        self.finish().await?;
        Ok(None)
    }
}

/// Run a short client command to completion and return its stdout.
///
/// Failures are mapped through `classify`, which receives the stderr text.
pub async fn run_probe(
    mut cmd: Command,
    program: &str,
    timeout: Duration,
    classify: fn(&str) -> BackupError,
) -> Result<String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Running probe: {}", program);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(output) => output
            .map_err(|e| BackupError::Connection(format!("Failed to execute {}: {}", program, e)))?,
        Err(_) => {
            return Err(BackupError::Connection(format!(
                "{} timed out after {:?}",
                program, timeout
            )))
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify(stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
