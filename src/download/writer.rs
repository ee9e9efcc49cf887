//! Download sinks

use crate::error::Result;
use crate::validation::{ArtifactHasher, ArtifactIdentity};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// A file produced by a [`FileWriter`], with its computed identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    /// Location of the written file
    pub path: PathBuf,
    /// Size and every digest of the written bytes
    pub identity: ArtifactIdentity,
}

/// Destination for the bytes of one download
///
/// `reset` is called before every attempt, so a retried download never appends
/// to the bytes of a failed one. `close` is called once after validation passed.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Append one chunk
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Discard everything written so far
    async fn reset(&mut self) -> Result<()>;

    /// Flush and finish the output
    async fn close(&mut self) -> Result<()>;

    /// The finished file, available after `close`
    fn output(&self) -> Option<WrittenFile> {
        None
    }

    /// In-memory bytes, for writers that buffer
    fn bytes(&self) -> Option<&[u8]> {
        None
    }
}

/// Streams bytes to a file and hashes them with every supported algorithm
///
/// The file (and its parent directories) is created lazily on the first write,
/// so a download that never receives a byte leaves nothing behind unless closed.
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    hasher: ArtifactHasher,
    output: Option<WrittenFile>,
}

impl FileWriter {
    /// Write to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            hasher: ArtifactHasher::new(),
            output: None,
        }
    }

    /// Destination path
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&mut self) -> Result<&mut tokio::fs::File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.file = Some(tokio::fs::File::create(&self.path).await?);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(crate::Error::Other(format!(
                "failed to open {}",
                self.path.display()
            ))),
        }
    }
}

#[async_trait]
impl Writer for FileWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.open().await?.write_all(chunk).await?;
        self.hasher.update(chunk);
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.file = None;
        self.hasher = ArtifactHasher::new();
        self.output = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        // Empty bodies still produce a file
        let file = self.open().await?;
        file.flush().await?;
        file.sync_all().await?;
        self.file = None;

        let hasher = std::mem::take(&mut self.hasher);
        self.output = Some(WrittenFile {
            path: self.path.clone(),
            identity: hasher.finish(),
        });
        Ok(())
    }

    fn output(&self) -> Option<WrittenFile> {
        self.output.clone()
    }
}

/// Collects the body in memory
#[derive(Debug, Default)]
pub struct BufferWriter {
    buffer: Vec<u8>,
}

impl BufferWriter {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Writer for BufferWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.buffer.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn bytes(&self) -> Option<&[u8]> {
        Some(&self.buffer)
    }
}
