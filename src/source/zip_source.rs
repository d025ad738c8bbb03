use std::sync::Arc;

use async_trait::async_trait;

use super::traits::{FileRef, ProgressFn, Source, SourceKind, SyncProgress};
use crate::error::{Error, Result};
use crate::storage::extract::{extract_zip, ExtractSummary};
use crate::storage::{ByteReader, EntryStatus, StorageBackend};
use crate::tree::Tree;

/// Uploaded-archive source. Content lands in the cache at upload time via
/// [`ZipSource::ingest`]; afterwards everything is answered from storage.
pub struct ZipSource {
    storage: Arc<dyn StorageBackend>,
    repo_id: String,
}

impl ZipSource {
    pub fn new(storage: Arc<dyn StorageBackend>, repo_id: impl Into<String>) -> Self {
        Self {
            storage,
            repo_id: repo_id.into(),
        }
    }

    /// Replace the cached content with the uploaded archive.
    pub async fn ingest(&self, upload: ByteReader) -> Result<ExtractSummary> {
        self.storage.rm(&self.repo_id, "").await?;
        self.storage.mk(&self.repo_id, "").await?;
        extract_zip(self.storage.as_ref(), &self.repo_id, "", upload).await
    }
}

#[async_trait]
impl Source for ZipSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Zip
    }

    async fn get_files(&self, progress: Option<&ProgressFn<'_>>) -> Result<Tree> {
        let tree = self.storage.list_files(&self.repo_id, "", None).await?;
        if let Some(report) = progress {
            report(&SyncProgress {
                listed: tree.flatten().len(),
                pending: 0,
            });
        }
        Ok(tree)
    }

    async fn get_file_content(&self, file: &FileRef) -> Result<ByteReader> {
        match self.storage.exists(&self.repo_id, &file.path).await {
            EntryStatus::File => self.storage.read(&self.repo_id, &file.path).await,
            _ => Err(Error::FileNotAccessible(file.path.clone())),
        }
    }
}
