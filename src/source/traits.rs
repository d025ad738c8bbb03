use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::storage::ByteReader;
use crate::tree::Tree;

/// Progress of a tree listing, reported after each merged listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Distinct entries in the tree built so far.
    pub listed: usize,
    /// Subtree listings queued or in flight.
    pub pending: usize,
}

pub type ProgressFn<'a> = dyn Fn(&SyncProgress) + Send + Sync + 'a;

/// A file to fetch: logical path plus its content-addressable identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub path: String,
    pub sha: Option<String>,
}

impl FileRef {
    pub fn new(path: impl Into<String>, sha: Option<String>) -> Self {
        Self {
            path: path.into(),
            sha,
        }
    }

    pub fn require_sha(&self) -> Result<&str> {
        self.sha
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::FileShaMissing(self.path.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    GitHubStream,
    GitHubDownload,
    Zip,
}

#[async_trait]
pub trait Source: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Full recursive tree of the selected revision.
    async fn get_files(&self, progress: Option<&ProgressFn<'_>>) -> Result<Tree>;

    /// Bytes of one file. A cache copy is written as a side effect.
    async fn get_file_content(&self, file: &FileRef) -> Result<ByteReader>;
}

/// Narrow an error from fetching file content to the kinds callers act on.
pub(crate) fn content_error(path: &str, err: Error) -> Error {
    match err {
        Error::FileShaMissing(_)
        | Error::FileTooLarge(_)
        | Error::FileNotAccessible(_)
        | Error::UpstreamTransient(_)
        | Error::StorageIo(_) => err,
        other => Error::FileNotAccessible(format!("{}: {}", path, other)),
    }
}
