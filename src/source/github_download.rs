use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::info;

use super::github_api::RemoteHost;
use super::repository::RepoSlug;
use super::traits::{content_error, FileRef, ProgressFn, Source, SourceKind, SyncProgress};
use crate::error::{Error, Result};
use crate::storage::extract::extract_zip;
use crate::storage::{ByteReader, EntryStatus, StorageBackend};
use crate::tree::Tree;

/// Bulk source: downloads the whole revision as one zip, then serves from the cache.
pub struct GitHubDownload {
    host: Arc<dyn RemoteHost>,
    storage: Arc<dyn StorageBackend>,
    repo_id: String,
    repo: RepoSlug,
    commit: String,
    downloaded: OnceCell<()>,
}

impl GitHubDownload {
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
            downloaded: OnceCell::new(),
        }
    }

    /// Download and extract once per instance. A populated cache directory counts as downloaded.
    async fn ensure_downloaded(&self) -> Result<()> {
        self.downloaded
            .get_or_try_init(|| async {
                if self.storage.exists(&self.repo_id, "").await == EntryStatus::Folder {
                    return Ok(());
                }
                if self.commit.is_empty() {
                    return Err(Error::FileShaMissing(format!("{} revision", self.repo)));
                }
                info!("downloading repo={} commit={}", self.repo, self.commit);
                let archive = self.host.download_archive(&self.repo, &self.commit).await?;
                let summary = extract_zip(self.storage.as_ref(), &self.repo_id, "", archive).await?;
                info!(
                    "download extracted repo={} files={} into {}",
                    self.repo, summary.files, self.repo_id
                );
                Ok::<(), Error>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Source for GitHubDownload {
    fn kind(&self) -> SourceKind {
        SourceKind::GitHubDownload
    }

    async fn get_files(&self, progress: Option<&ProgressFn<'_>>) -> Result<Tree> {
        self.ensure_downloaded().await?;
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
        self.ensure_downloaded()
            .await
            .map_err(|e| content_error(&file.path, e))?;
        match self.storage.exists(&self.repo_id, &file.path).await {
            EntryStatus::File => self.storage.read(&self.repo_id, &file.path).await,
            _ => Err(Error::FileNotAccessible(file.path.clone())),
        }
    }
}
