// Repository cache facade: the operations queue consumers and the HTTP layer call.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::source::repository::RepositoryHandle;
use crate::source::traits::{FileRef, Source};
use crate::storage::archive::{archive_with_depth, ArchiveStream};
use crate::storage::extract::{extract_zip, ExtractSummary};
use crate::storage::fs::FileSystemStorage;
use crate::storage::{ArchiveOptions, ByteReader, EntryStatus, FileInfo, StorageBackend};
use crate::tree::Tree;

/// Per-repository cache over a storage backend.
///
/// Operations on different repository ids never interfere. Mutations on the
/// same id are not serialized here; callers run one job per repository at a time.
#[derive(Clone)]
pub struct RepoCache {
    storage: Arc<dyn StorageBackend>,
    archive_depth: usize,
}

impl RepoCache {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            archive_depth: crate::config::DEFAULT_ARCHIVE_CHANNEL_DEPTH,
        }
    }

    /// Filesystem-backed cache rooted at `config.storage_root`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            storage: Arc::new(FileSystemStorage::new(config.storage_root.clone())),
            archive_depth: config.archive_channel_depth,
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Drop everything cached for `repo_id`. Missing caches are fine.
    pub async fn remove_cache(&self, repo_id: &str) -> Result<()> {
        self.storage.rm(repo_id, "").await?;
        info!("cache removed repo={}", repo_id);
        Ok(())
    }

    pub async fn exists(&self, repo_id: &str, path: &str) -> EntryStatus {
        self.storage.exists(repo_id, path).await
    }

    pub async fn read(&self, repo_id: &str, path: &str) -> Result<ByteReader> {
        self.storage.read(repo_id, path).await
    }

    pub async fn file_info(&self, repo_id: &str, path: &str) -> Result<FileInfo> {
        self.storage.file_info(repo_id, path).await
    }

    /// Metadata and content of one cached file, for serving it.
    pub async fn send(&self, repo_id: &str, path: &str) -> Result<(FileInfo, ByteReader)> {
        let info = self.storage.file_info(repo_id, path).await?;
        let reader = self.storage.read(repo_id, path).await?;
        debug!("send repo={} path={} size={} type={}", repo_id, path, info.size, info.content_type);
        Ok((info, reader))
    }

    /// Cached copy when present, otherwise fetched through `source` (which caches it).
    pub async fn fetch(&self, source: &dyn Source, repo_id: &str, file: &FileRef) -> Result<ByteReader> {
        if self.storage.exists(repo_id, &file.path).await == EntryStatus::File {
            return self.storage.read(repo_id, &file.path).await;
        }
        debug!("cache miss repo={} path={} source={:?}", repo_id, file.path, source.kind());
        source.get_file_content(file).await
    }

    pub async fn list_files(&self, repo_id: &str, path: &str) -> Result<Tree> {
        self.storage.list_files(repo_id, path, None).await
    }

    /// Must be called from within a Tokio runtime.
    pub fn archive(&self, repo_id: &str, path: &str, options: ArchiveOptions) -> ArchiveStream {
        archive_with_depth(Arc::clone(&self.storage), repo_id, path, options, self.archive_depth)
    }

    pub async fn extract_zip(&self, repo_id: &str, path: &str, input: ByteReader) -> Result<ExtractSummary> {
        extract_zip(self.storage.as_ref(), repo_id, path, input).await
    }

    /// Remove the cache when it was produced from another commit, then record
    /// `commit` as current. Returns whether the cache was dropped.
    pub async fn ensure_fresh(&self, handle: &mut RepositoryHandle, commit: &str) -> Result<bool> {
        if handle.is_up_to_date(commit) {
            return Ok(false);
        }
        let repo_id = handle.repository().external_id.clone();
        self.remove_cache(&repo_id).await?;
        handle.mark_cached(commit).await?;
        info!("cache stale repo={} now tracking commit={}", repo_id, commit);
        Ok(true)
    }
}
