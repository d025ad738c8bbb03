use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Path segments starting with this character are escaped in the at-rest tree encoding.
pub const RESERVED_MARKER: char = '$';

/// Prefix added to a segment to escape it in the at-rest tree encoding.
pub const ESCAPE_PREFIX: char = '\\';

/// User agent sent to the remote hosting API.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Default GitHub REST endpoint.
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

/// Blobs above this size are rejected upstream (100 MB, GitHub limit).
pub const DEFAULT_MAX_BLOB_SIZE: u64 = 100 * 1024 * 1024;

/// Number of file payloads buffered between the tree walk and the archive encoder.
pub const DEFAULT_ARCHIVE_CHANNEL_DEPTH: usize = 16;

/// Directory under the storage root that holds one subdirectory per repository.
pub const REPOSITORIES_DIR: &str = "repositories";

/// Top-level configuration for the cache engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for all cached repository content.
    pub storage_root: PathBuf,
    /// Base URL of the remote hosting API.
    pub github_api_url: String,
    /// Token for the remote hosting API. Anonymous access when absent.
    pub github_token: Option<String>,
    /// Maximum number of truncated subtrees resolved concurrently.
    pub tree_concurrency: usize,
    /// Largest blob the live source will attempt to fetch.
    pub max_blob_size: u64,
    /// Bounded queue depth between archive walk and encoder.
    pub archive_channel_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./data"),
            github_api_url: DEFAULT_GITHUB_API_URL.to_string(),
            github_token: None,
            tree_concurrency: 1, // sequential
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            archive_channel_depth: DEFAULT_ARCHIVE_CHANNEL_DEPTH,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `ANON_CACHE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(root) = lookup("ANON_CACHE_STORAGE_ROOT") {
            config.storage_root = PathBuf::from(root);
        }
        if let Some(url) = lookup("ANON_CACHE_GITHUB_API_URL") {
            config.github_api_url = url.trim_end_matches('/').to_string();
        }
        config.github_token = lookup("ANON_CACHE_GITHUB_TOKEN").filter(|t| !t.trim().is_empty());
        if let Some(n) = lookup("ANON_CACHE_TREE_CONCURRENCY") {
            config.tree_concurrency = parse_number("ANON_CACHE_TREE_CONCURRENCY", &n)?;
        }
        if let Some(n) = lookup("ANON_CACHE_MAX_BLOB_SIZE") {
            config.max_blob_size = parse_number("ANON_CACHE_MAX_BLOB_SIZE", &n)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tree_concurrency == 0 {
            return Err(Error::Config("tree_concurrency must be > 0".into()));
        }
        if self.archive_channel_depth == 0 {
            return Err(Error::Config("archive_channel_depth must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} is not a number: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("ANON_CACHE_STORAGE_ROOT", "/srv/cache"),
            ("ANON_CACHE_GITHUB_API_URL", "http://127.0.0.1:9000/"),
            ("ANON_CACHE_TREE_CONCURRENCY", "4"),
            ("ANON_CACHE_GITHUB_TOKEN", "  "),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.storage_root, PathBuf::from("/srv/cache"));
        assert_eq!(config.github_api_url, "http://127.0.0.1:9000");
        assert_eq!(config.tree_concurrency, 4);
        assert!(config.github_token.is_none());
        assert_eq!(config.max_blob_size, DEFAULT_MAX_BLOB_SIZE);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = EngineConfig::from_lookup(|k| {
            (k == "ANON_CACHE_TREE_CONCURRENCY").then(|| "0".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
