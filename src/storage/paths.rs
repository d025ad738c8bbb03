// Cache path policy: maps (repository id, logical path) to a location under the storage root.

use std::path::{Component, Path, PathBuf};

use crate::config::REPOSITORIES_DIR;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            root: storage_root.into().join(REPOSITORIES_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache directory of one repository. Ids are a single plain path component.
    pub fn repo_dir(&self, repo_id: &str) -> Result<PathBuf> {
        let mut components = Path::new(repo_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !repo_id.contains(['/', '\\', '\0']) => {
                Ok(self.root.join(repo_id))
            }
            _ => Err(Error::RepoNotFound(format!("invalid repository id: {:?}", repo_id))),
        }
    }

    /// Location of `logical` inside the repository cache. `.` is skipped and
    /// `..` is clamped at the repository directory, so the result never leaves it.
    pub fn resolve(&self, repo_id: &str, logical: &str) -> Result<PathBuf> {
        let base = self.repo_dir(repo_id)?;
        contained_join(&base, logical)
    }
}

/// Join an untrusted relative path onto `base` without ever leaving it.
pub fn contained_join(base: &Path, untrusted: &str) -> Result<PathBuf> {
    if untrusted.as_bytes().contains(&0) {
        return Err(Error::FileNotAccessible("NUL byte in path".into()));
    }

    let mut result = base.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(untrusted).components() {
        match component {
            Component::Normal(c) => {
                result.push(c);
                depth += 1;
            }
            Component::ParentDir => {
                if depth > 0 {
                    result.pop();
                    depth -= 1;
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(result)
}
