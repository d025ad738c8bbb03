// Content cache: pluggable storage backends plus archive and zip ingestion on top of them.

pub mod archive;
pub mod extract;
pub mod fs;
pub mod mime;
pub mod paths;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::tree::Tree;

/// Sequentially consumed byte stream.
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// Per-file callback of [`StorageBackend::list_files`]: path relative to the
/// listed root, and file size.
pub type EntryCallback<'a> = dyn FnMut(&str, u64) + Send + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Folder,
    File,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    #[default]
    Zip,
    Tar,
}

impl std::str::FromStr for ArchiveFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar" => Ok(ArchiveFormat::Tar),
            other => Err(format!("unknown archive format: {}", other)),
        }
    }
}

/// What the HTTP layer needs to serve one cached file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub content_type: &'static str,
    /// Local version marker of the cached copy.
    pub version: String,
}

/// Caller-supplied per-file filter applied while building archives.
#[async_trait]
pub trait FileTransformer: Send + Sync {
    async fn transform(&self, path: &str, input: ByteReader) -> Result<ByteReader>;
}

#[derive(Clone, Default)]
pub struct ArchiveOptions {
    pub format: ArchiveFormat,
    pub transformer: Option<Arc<dyn FileTransformer>>,
}

impl ArchiveOptions {
    pub fn new(format: ArchiveFormat) -> Self {
        Self {
            format,
            transformer: None,
        }
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn FileTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }
}

/// Capability contract every cache backend implements. All operations are
/// scoped to one repository's cache subtree.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Never fails: any lookup problem reports [`EntryStatus::NotFound`].
    async fn exists(&self, repo_id: &str, path: &str) -> EntryStatus;

    async fn read(&self, repo_id: &str, path: &str) -> Result<ByteReader>;

    /// Creates missing parent directories, then persists `data`.
    async fn write(&self, repo_id: &str, path: &str, data: Bytes) -> Result<()>;

    /// Streaming variant of [`StorageBackend::write`]; returns the number of bytes written.
    async fn write_stream(&self, repo_id: &str, path: &str, input: ByteReader) -> Result<u64>;

    /// Recursive and idempotent; a missing target is not an error.
    async fn rm(&self, repo_id: &str, path: &str) -> Result<()>;

    /// Idempotent directory creation.
    async fn mk(&self, repo_id: &str, path: &str) -> Result<()>;

    /// Depth-first walk of the cached subtree at `path`. `on_entry` sees every
    /// file as it is discovered. Per-entry failures are logged and skipped.
    async fn list_files(
        &self,
        repo_id: &str,
        path: &str,
        on_entry: Option<&mut EntryCallback<'_>>,
    ) -> Result<Tree>;

    async fn file_info(&self, repo_id: &str, path: &str) -> Result<FileInfo>;
}
