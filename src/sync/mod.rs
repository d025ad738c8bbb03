// Truncation-aware tree synchronizer. Rebuilds a full tree from a listing API
// that may cut recursive responses short.

pub mod arena;

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::source::github_api::RemoteHost;
use crate::source::repository::RepoSlug;
use crate::source::traits::{ProgressFn, SyncProgress};
use crate::tree::{join_path, split_path, EntryKind, Tree, TreeKey, TreeListing};
use arena::{NodeId, TreeArena, ROOT};

/// A subtree whose listing still has to be fetched and folded at `node`.
#[derive(Debug, Clone)]
struct ResolveTask {
    node: NodeId,
    sha: String,
    path: String,
}

struct Fetched {
    task: ResolveTask,
    recursive: TreeListing,
    /// Single-level listing, only fetched when `recursive` came back truncated.
    level: Option<TreeListing>,
}

pub struct TreeSynchronizer {
    host: Arc<dyn RemoteHost>,
    repo: RepoSlug,
    concurrency: usize,
}

impl TreeSynchronizer {
    pub fn new(host: Arc<dyn RemoteHost>, repo: RepoSlug) -> Self {
        Self {
            host,
            repo,
            concurrency: 1,
        }
    }

    /// Resolve up to `n` truncated sibling subtrees at once. `1` keeps remote calls sequential.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Build the complete tree of the revision `sha`.
    ///
    /// Each task fetches the recursive listing of one subtree and folds it at
    /// that subtree's arena node. A truncated answer is followed by the
    /// single-level listing of the same id: every child subtree that is still
    /// unexpanded becomes a new task, and the single-level entries are folded
    /// again to pick up sibling files the truncated answer dropped. Fetches may
    /// overlap up to the configured concurrency, merges happen one at a time on
    /// the arena and only touch the fetched subtree.
    pub async fn synchronize(&self, sha: &str, progress: Option<&ProgressFn<'_>>) -> Result<Tree> {
        if sha.is_empty() {
            return Err(Error::FileShaMissing(format!("{} revision", self.repo)));
        }
        info!("tree sync repo={} sha={} concurrency={}", self.repo, sha, self.concurrency);

        let mut arena = TreeArena::new();
        let mut queue = VecDeque::from([ResolveTask {
            node: ROOT,
            sha: sha.to_string(),
            path: String::new(),
        }]);
        let mut in_flight = FuturesUnordered::new();
        let mut truncated = 0usize;

        loop {
            while in_flight.len() < self.concurrency {
                match queue.pop_front() {
                    Some(task) => in_flight.push(self.fetch(task)),
                    None => break,
                }
            }
            let Some(fetched) = in_flight.next().await else {
                break;
            };
            let fetched = fetched?;
            if fetched.level.is_some() {
                truncated += 1;
            }
            Self::merge(&mut arena, fetched, &mut queue)?;

            if let Some(report) = progress {
                report(&SyncProgress {
                    listed: arena.entry_count(),
                    pending: queue.len() + in_flight.len(),
                });
            }
        }

        info!(
            "tree sync done repo={} sha={} entries={} truncated_subtrees={}",
            self.repo,
            sha,
            arena.entry_count(),
            truncated
        );
        Ok(arena.into_tree())
    }

    async fn fetch(&self, task: ResolveTask) -> Result<Fetched> {
        debug!("tree fetch repo={} path=/{} sha={}", self.repo, task.path, task.sha);
        let recursive = self.host.get_tree(&self.repo, &task.sha, true).await?;
        let level = if recursive.truncated {
            debug!(
                "tree truncated repo={} path=/{} entries={}",
                self.repo,
                task.path,
                recursive.entries.len()
            );
            Some(self.host.get_tree(&self.repo, &task.sha, false).await?)
        } else {
            None
        };
        Ok(Fetched {
            task,
            recursive,
            level,
        })
    }

    fn merge(arena: &mut TreeArena, fetched: Fetched, queue: &mut VecDeque<ResolveTask>) -> Result<()> {
        let Fetched {
            task,
            recursive,
            level,
        } = fetched;
        arena.fold(task.node, &recursive.entries);

        let Some(level) = level else {
            return Ok(());
        };

        for entry in level.entries.iter().filter(|e| e.kind == EntryKind::Tree) {
            // Single-level paths are bare names; tolerate stray separators.
            let Some(name) = split_path(&entry.path).last() else {
                continue;
            };
            let key = TreeKey::new(name);
            if let Some(existing) = arena.child(task.node, &key) {
                if arena.is_expanded_dir(existing) {
                    continue;
                }
            }
            let path = join_path(&task.path, name);
            let sha = entry
                .sha
                .clone()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| Error::FileShaMissing(path.clone()))?;
            let node = arena.ensure_dir(task.node, key);
            queue.push_back(ResolveTask { node, sha, path });
        }

        arena.fold(task.node, &level.entries);
        Ok(())
    }
}
