use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::github_api::RemoteHost;
use super::repository::RepoSlug;
use super::traits::{content_error, FileRef, ProgressFn, Source, SourceKind};
use crate::error::{Error, Result};
use crate::storage::{ByteReader, StorageBackend};
use crate::sync::TreeSynchronizer;
use crate::tree::Tree;

/// Live source: lists through the tree API and fetches blobs one by one.
pub struct GitHubStream {
    host: Arc<dyn RemoteHost>,
    storage: Arc<dyn StorageBackend>,
    repo_id: String,
    repo: RepoSlug,
    commit: String,
    tree_concurrency: usize,
    max_blob_size: Option<u64>,
}

impl GitHubStream {
    pub fn new(
        host: Arc<dyn RemoteHost>,
        storage: Arc<dyn StorageBackend>,
        repo_id: impl Into<String>,
        repo: RepoSlug,
        commit: impl Into<String>,
    ) -> Self {
        Self {
            host,
            storage,
            repo_id: repo_id.into(),
            repo,
            commit: commit.into(),
            tree_concurrency: 1,
            max_blob_size: None,
        }
    }

    pub fn with_tree_concurrency(mut self, n: usize) -> Self {
        self.tree_concurrency = n.max(1);
        self
    }

    /// Refuse blobs larger than `limit` bytes.
    pub fn with_max_blob_size(mut self, limit: u64) -> Self {
        self.max_blob_size = Some(limit);
        self
    }

    async fn fetch(&self, file: &FileRef) -> Result<ByteReader> {
        let sha = file.require_sha()?;
        let blob = self.host.get_blob(&self.repo, sha).await?;
        if let Some(limit) = self.max_blob_size {
            if blob.size > limit {
                return Err(Error::FileTooLarge(format!("{} ({} bytes)", file.path, blob.size)));
            }
        }
        let content = blob.decode()?;
        debug!(
            "blob fetched repo={} path={} sha={} bytes={}",
            self.repo,
            file.path,
            sha,
            content.len()
        );
        self.storage
            .write(&self.repo_id, &file.path, content.clone())
            .await?;
        Ok(Box::pin(std::io::Cursor::new(content)))
    }
}

#[async_trait]
impl Source for GitHubStream {
    fn kind(&self) -> SourceKind {
        SourceKind::GitHubStream
    }

    async fn get_files(&self, progress: Option<&ProgressFn<'_>>) -> Result<Tree> {
        TreeSynchronizer::new(Arc::clone(&self.host), self.repo.clone())
            .with_concurrency(self.tree_concurrency)
            .synchronize(&self.commit, progress)
            .await
    }

    async fn get_file_content(&self, file: &FileRef) -> Result<ByteReader> {
        self.fetch(file).await.map_err(|e| {
            warn!("file content failed repo={} path={}: {}", self.repo, file.path, e);
            content_error(&file.path, e)
        })
    }
}
