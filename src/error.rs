// Error kinds shared by sources, the tree synchronizer and storage backends.

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The remote host does not know the repository (or hides it from us).
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    /// A file content request carried no content identifier.
    #[error("file sha missing for {0}")]
    FileShaMissing(String),

    #[error("file not accessible: {0}")]
    FileNotAccessible(String),

    /// Upstream refused to serve the blob because of its size policy.
    #[error("file too large: {0}")]
    FileTooLarge(String),

    /// Network failure, rate limit or 5xx from the remote host. Callers own retries.
    #[error("upstream unavailable: {0}")]
    UpstreamTransient(String),

    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the failure may go away on its own, i.e. worth a retry by orchestration.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::UpstreamTransient(_))
    }

    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => Error::StorageIo(e),
            other => Error::Archive(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::UpstreamTransient(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::StorageIo(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_upstream_errors_are_transient() {
        assert!(Error::UpstreamTransient("503".into()).is_transient());
        assert!(!Error::FileTooLarge("big.bin".into()).is_transient());
        assert!(!Error::StorageIo(std::io::Error::other("disk")).is_transient());
    }
}
