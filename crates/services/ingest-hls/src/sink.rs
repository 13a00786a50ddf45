//! Append-only ingest sink
//!
//! Receives the raw container bytes of one session in delivery order and
//! writes them to `recording.webm`. The encoder tails the same file while it
//! grows, so the sink only ever appends and never takes an exclusive lock.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Byte receiver for one session's ingest artifact
#[derive(Debug)]
pub struct IngestSink {
    path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
    chunks_written: u64,
}

impl IngestSink {
    /// Create the ingest file, truncating a recording left by an earlier
    /// session under the same key
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|source| SinkError::Open {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file: Some(file),
            bytes_written: 0,
            chunks_written: 0,
        })
    }

    /// Append one chunk after everything written so far
    ///
    /// Data is flushed to the OS before returning so a concurrent reader
    /// sees it immediately.
    pub async fn append(&mut self, bytes: &[u8]) -> Result<u64, SinkError> {
        let file = self.file.as_mut().ok_or(SinkError::Closed)?;
        file.write_all(bytes).await?;
        file.flush().await?;

        self.bytes_written += bytes.len() as u64;
        self.chunks_written += 1;
        Ok(self.bytes_written)
    }

    /// Flush and release the file handle. Calling it again is a no-op.
    pub async fn close(&mut self) -> Result<(), SinkError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush().await?;
        file.sync_data().await?;
        tracing::debug!(
            path = %self.path.display(),
            bytes = self.bytes_written,
            chunks = self.chunks_written,
            "Ingest sink closed"
        );
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn chunks_written(&self) -> u64 {
        self.chunks_written
    }
}

/// Ingest sink errors
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Failed to open ingest file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ingest sink is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
