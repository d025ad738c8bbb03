// Filesystem storage backend, one directory per repository under the storage root.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::mime::content_type;
use super::paths::CachePaths;
use super::{ByteReader, EntryCallback, EntryStatus, FileInfo, StorageBackend};
use crate::error::{Error, Result};
use crate::tree::{join_path, FileEntry, Tree, TreeKey, TreeNode};

/// Result of a filesystem walk.
#[derive(Debug, Default)]
pub struct Listing {
    pub tree: Tree,
    /// `<path>: <error>` for every entry skipped during the walk.
    pub errors: Vec<String>,
}

pub struct FileSystemStorage {
    paths: CachePaths,
}

impl FileSystemStorage {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            paths: CachePaths::new(storage_root),
        }
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    /// Walk `path` like [`StorageBackend::list_files`] and also return the
    /// entries that could not be read. The walk continues past them.
    pub async fn listing(
        &self,
        repo_id: &str,
        path: &str,
        on_entry: Option<&mut EntryCallback<'_>>,
    ) -> Result<Listing> {
        let root = self.paths.resolve(repo_id, path)?;
        let mut tree = Tree::new();
        let mut walk = Walk {
            on_entry,
            files: 0,
            errors: Vec::new(),
        };
        walk.visit(root, String::new(), &mut tree).await;
        debug!(
            "list_files repo={} path=/{} files={} errors={}",
            repo_id,
            path,
            walk.files,
            walk.errors.len()
        );
        Ok(Listing {
            tree,
            errors: walk.errors,
        })
    }

    async fn ensure_parent(target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            // create_dir_all accepts an existing directory; anything else propagates.
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

/// Local version marker of a cached file: modification time in ms, hex.
fn version_marker(meta: &std::fs::Metadata) -> String {
    let millis = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{:x}", millis)
}

/// State threaded through the recursive walk.
struct Walk<'a, 'cb> {
    on_entry: Option<&'a mut EntryCallback<'cb>>,
    files: usize,
    errors: Vec<String>,
}

impl<'a, 'cb> Walk<'a, 'cb> {
    fn record(&mut self, path: &Path, err: std::io::Error) {
        warn!("list_files skipped {}: {}", path.display(), err);
        self.errors.push(format!("{}: {}", path.display(), err));
    }

    /// Depth-first over `dir`, entries in name order. `rel` is the path of
    /// `dir` relative to the listed root.
    fn visit<'f>(&'f mut self, dir: PathBuf, rel: String, tree: &'f mut Tree) -> BoxFuture<'f, ()>
    where
        'a: 'f,
        'cb: 'f,
    {
        async move {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) => return self.record(&dir, e),
            };
            let mut children = Vec::new();
            loop {
                match read_dir.next_entry().await {
                    Ok(Some(entry)) => children.push(entry),
                    Ok(None) => break,
                    Err(e) => {
                        self.record(&dir, e);
                        break;
                    }
                }
            }
            children.sort_by_key(|e| e.file_name());

            for entry in children {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    warn!("list_files skipped non UTF-8 name in {}", dir.display());
                    continue;
                };
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(e) => {
                        self.record(&path, e);
                        continue;
                    }
                };
                let child_rel = join_path(&rel, &name);
                if file_type.is_dir() {
                    let subtree = tree.dir_mut(TreeKey::new(name));
                    self.visit(path, child_rel, subtree).await;
                } else if file_type.is_file() {
                    let meta = match entry.metadata().await {
                        Ok(m) => m,
                        Err(e) => {
                            self.record(&path, e);
                            continue;
                        }
                    };
                    if let Some(cb) = self.on_entry.as_deref_mut() {
                        cb(&child_rel, meta.len());
                    }
                    self.files += 1;
                    tree.insert(
                        TreeKey::new(name),
                        TreeNode::File(FileEntry::new(meta.len(), version_marker(&meta))),
                    );
                } else {
                    debug!("list_files ignored special file {}", path.display());
                }
            }
        }
        .boxed()
    }
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn exists(&self, repo_id: &str, path: &str) -> EntryStatus {
        let Ok(target) = self.paths.resolve(repo_id, path) else {
            return EntryStatus::NotFound;
        };
        match fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => EntryStatus::Folder,
            Ok(meta) if meta.is_file() => EntryStatus::File,
            _ => EntryStatus::NotFound,
        }
    }

    async fn read(&self, repo_id: &str, path: &str) -> Result<ByteReader> {
        let target = self.paths.resolve(repo_id, path)?;
        let file = fs::File::open(&target).await?;
        Ok(Box::pin(file))
    }

    async fn write(&self, repo_id: &str, path: &str, data: Bytes) -> Result<()> {
        let target = self.paths.resolve(repo_id, path)?;
        Self::ensure_parent(&target).await?;
        fs::write(&target, &data).await?;
        debug!("cache write repo={} path={} bytes={}", repo_id, path, data.len());
        Ok(())
    }

    async fn write_stream(&self, repo_id: &str, path: &str, mut input: ByteReader) -> Result<u64> {
        let target = self.paths.resolve(repo_id, path)?;
        Self::ensure_parent(&target).await?;
        let mut file = fs::File::create(&target).await?;
        let written = tokio::io::copy(&mut input, &mut file).await?;
        file.flush().await?;
        debug!("cache write repo={} path={} bytes={}", repo_id, path, written);
        Ok(written)
    }

    async fn rm(&self, repo_id: &str, path: &str) -> Result<()> {
        let target = self.paths.resolve(repo_id, path)?;
        let result = match fs::symlink_metadata(&target).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target).await,
            Ok(_) => fs::remove_file(&target).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!("cache rm repo={} path={}", repo_id, path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn mk(&self, repo_id: &str, path: &str) -> Result<()> {
        let target = self.paths.resolve(repo_id, path)?;
        // An existing directory is fine, a file in the way is not.
        fs::create_dir_all(&target).await?;
        Ok(())
    }

    async fn list_files(
        &self,
        repo_id: &str,
        path: &str,
        on_entry: Option<&mut EntryCallback<'_>>,
    ) -> Result<Tree> {
        Ok(self.listing(repo_id, path, on_entry).await?.tree)
    }

    async fn file_info(&self, repo_id: &str, path: &str) -> Result<FileInfo> {
        let target = self.paths.resolve(repo_id, path)?;
        let meta = fs::metadata(&target).await?;
        if !meta.is_file() {
            return Err(Error::FileNotAccessible(format!("{} is not a file", path)));
        }
        Ok(FileInfo {
            size: meta.len(),
            content_type: content_type(path),
            version: version_marker(&meta),
        })
    }
}
