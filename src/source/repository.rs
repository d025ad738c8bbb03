// Repository records and the metadata store they are persisted through.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::github_api::RemoteHost;
use crate::error::{Error, Result};

/// `owner/name` coordinates of a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoSlug {
    pub owner: String,
    pub name: String,
}

impl RepoSlug {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Accepts `owner/name`, `https://github.com/owner/name`, a trailing `/` and a `.git` suffix.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let without_scheme = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        let without_host = without_scheme
            .strip_prefix("github.com/")
            .or_else(|| without_scheme.strip_prefix("www.github.com/"))
            .unwrap_or(without_scheme);
        let path = without_host.trim_end_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);

        let mut parts = path.split('/').filter(|s| !s.is_empty());
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) => Ok(Self::new(owner, name)),
            _ => Err(Error::RepoNotFound(format!("invalid repository reference: {}", input))),
        }
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub commit: String,
    /// Fetched lazily once, refreshed only on explicit force.
    #[serde(default)]
    pub readme: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub external_id: String,
    pub name: String,
    pub owner: String,
    pub default_branch: String,
    pub size: u64,
    #[serde(default)]
    pub branches: Vec<Branch>,
    /// Commit the cached content was produced from.
    #[serde(default)]
    pub cached_commit: Option<String>,
}

impl Repository {
    pub fn slug(&self) -> RepoSlug {
        RepoSlug::new(&self.owner, &self.name)
    }

    pub fn branch(&self, name: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.name == name)
    }
}

/// External metadata store, addressed by external repository id.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    async fn get(&self, external_id: &str) -> Result<Option<Repository>>;
    async fn update(&self, repo: &Repository) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryRepositoryStore {
    repos: RwLock<HashMap<String, Repository>>,
}

impl MemoryRepositoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RepositoryStore for MemoryRepositoryStore {
    async fn get(&self, external_id: &str) -> Result<Option<Repository>> {
        Ok(self.repos.read().get(external_id).cloned())
    }

    async fn update(&self, repo: &Repository) -> Result<()> {
        self.repos
            .write()
            .insert(repo.external_id.clone(), repo.clone());
        Ok(())
    }
}

/// One JSON document per repository under `root`.
pub struct JsonRepositoryStore {
    root: PathBuf,
}

impl JsonRepositoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn document(&self, external_id: &str) -> Result<PathBuf> {
        let valid = !external_id.is_empty()
            && external_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !external_id.starts_with('.');
        if !valid {
            return Err(Error::RepoNotFound(format!("invalid repository id: {}", external_id)));
        }
        Ok(self.root.join(format!("{}.json", external_id)))
    }
}

#[async_trait]
impl RepositoryStore for JsonRepositoryStore {
    async fn get(&self, external_id: &str) -> Result<Option<Repository>> {
        let path = self.document(external_id)?;
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, repo: &Repository) -> Result<()> {
        let path = self.document(&repo.external_id)?;
        tokio::fs::create_dir_all(&self.root).await?;
        let raw = serde_json::to_vec_pretty(repo)?;
        // Atomic replace: readers never see a partial document.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// A repository record bound to the remote host and the metadata store.
/// All mutation goes through explicit refresh operations.
pub struct RepositoryHandle {
    repo: Repository,
    host: Arc<dyn RemoteHost>,
    store: Arc<dyn RepositoryStore>,
}

impl RepositoryHandle {
    pub fn new(repo: Repository, host: Arc<dyn RemoteHost>, store: Arc<dyn RepositoryStore>) -> Self {
        Self { repo, host, store }
    }

    /// Load the record from the store, or fetch its metadata from the host and persist it.
    pub async fn open(
        external_id: &str,
        slug: &RepoSlug,
        host: Arc<dyn RemoteHost>,
        store: Arc<dyn RepositoryStore>,
    ) -> Result<Self> {
        if let Some(repo) = store.get(external_id).await? {
            return Ok(Self::new(repo, host, store));
        }
        let remote = host.get_repository(slug).await?;
        let repo = Repository {
            external_id: external_id.to_string(),
            name: remote.name,
            owner: remote.owner,
            default_branch: remote.default_branch,
            size: remote.size,
            branches: Vec::new(),
            cached_commit: None,
        };
        store.update(&repo).await?;
        info!("repository {} registered as {}", slug, external_id);
        Ok(Self::new(repo, host, store))
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn host(&self) -> &Arc<dyn RemoteHost> {
        &self.host
    }

    /// Branch list, fetched from the host when empty or when `force` is set.
    /// Readmes already cached for a branch survive the refresh.
    pub async fn branches(&mut self, force: bool) -> Result<&[Branch]> {
        if force || self.repo.branches.is_empty() {
            let remote = self.host.list_branches(&self.repo.slug()).await?;
            let previous = std::mem::take(&mut self.repo.branches);
            self.repo.branches = remote
                .into_iter()
                .map(|b| {
                    let readme = previous
                        .iter()
                        .find(|p| p.name == b.name && p.commit == b.commit)
                        .and_then(|p| p.readme.clone());
                    Branch {
                        name: b.name,
                        commit: b.commit,
                        readme,
                    }
                })
                .collect();
            self.store.update(&self.repo).await?;
            debug!(
                "repository {} branches refreshed count={}",
                self.repo.external_id,
                self.repo.branches.len()
            );
        }
        Ok(&self.repo.branches)
    }

    /// Readme of `branch`, fetched once and persisted. `force` refetches.
    pub async fn readme(&mut self, branch: &str, force: bool) -> Result<Option<String>> {
        self.branches(false).await?;
        let idx = self
            .repo
            .branches
            .iter()
            .position(|b| b.name == branch)
            .ok_or_else(|| Error::RepoNotFound(format!("{} has no branch {}", self.repo.slug(), branch)))?;

        if !force {
            if let Some(readme) = &self.repo.branches[idx].readme {
                return Ok(Some(readme.clone()));
            }
        }

        let readme = self.host.get_readme(&self.repo.slug(), branch).await?;
        self.repo.branches[idx].readme = readme.clone();
        self.store.update(&self.repo).await?;
        Ok(readme)
    }

    /// Whether cached content was produced from `commit`.
    pub fn is_up_to_date(&self, commit: &str) -> bool {
        self.repo.cached_commit.as_deref() == Some(commit)
    }

    /// Record that the cache now reflects `commit`.
    pub async fn mark_cached(&mut self, commit: &str) -> Result<()> {
        self.repo.cached_commit = Some(commit.to_string());
        self.store.update(&self.repo).await
    }
}
