// Remote hosting API: the GitHub REST calls the sources and synchronizer rely on.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::repository::RepoSlug;
use crate::config::USER_AGENT;
use crate::error::{Error, Result};
use crate::storage::ByteReader;
use crate::tree::TreeListing;

const BRANCHES_PER_PAGE: usize = 100;

/// Repository metadata as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepository {
    pub id: u64,
    pub name: String,
    pub owner: String,
    pub default_branch: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBranch {
    pub name: String,
    pub commit: String,
}

/// Blob payload as returned by the host.
#[derive(Debug, Clone, Deserialize)]
pub struct Blob {
    pub content: String,
    pub encoding: String,
    #[serde(default)]
    pub size: u64,
}

impl Blob {
    pub fn decode(&self) -> Result<Bytes> {
        match self.encoding.as_str() {
            "base64" => {
                // The host wraps base64 payloads at 60 columns.
                let compact: String = self.content.chars().filter(|c| !c.is_whitespace()).collect();
                base64::engine::general_purpose::STANDARD
                    .decode(compact)
                    .map(Bytes::from)
                    .map_err(|e| Error::FileNotAccessible(format!("invalid base64 blob: {}", e)))
            }
            "utf-8" | "utf8" | "" => Ok(Bytes::from(self.content.clone().into_bytes())),
            other => Err(Error::FileNotAccessible(format!("unsupported blob encoding {}", other))),
        }
    }
}

#[async_trait]
pub trait RemoteHost: Send + Sync {
    async fn get_repository(&self, repo: &RepoSlug) -> Result<RemoteRepository>;
    async fn list_branches(&self, repo: &RepoSlug) -> Result<Vec<RemoteBranch>>;
    /// Raw readme text at `reference`, `None` when the revision has no readme.
    async fn get_readme(&self, repo: &RepoSlug, reference: &str) -> Result<Option<String>>;
    async fn get_tree(&self, repo: &RepoSlug, sha: &str, recursive: bool) -> Result<TreeListing>;
    async fn get_blob(&self, repo: &RepoSlug, sha: &str) -> Result<Blob>;
    /// Zip archive of the whole repository at `reference`.
    async fn download_archive(&self, repo: &RepoSlug, reference: &str) -> Result<ByteReader>;
}

/// What a 404 means for the call being made.
#[derive(Debug, Clone, Copy)]
enum Missing {
    Repository,
    File,
}

/// Map a non-success response to an error kind.
fn classify(status: StatusCode, body: &str, what: &str, missing: Missing) -> Error {
    let message = format!("{}: HTTP {}", what, status.as_u16());
    match status {
        StatusCode::NOT_FOUND => match missing {
            Missing::Repository => Error::RepoNotFound(message),
            Missing::File => Error::FileNotAccessible(message),
        },
        StatusCode::FORBIDDEN | StatusCode::UNPROCESSABLE_ENTITY if body.contains("too_large") => {
            Error::FileTooLarge(message)
        }
        StatusCode::FORBIDDEN if body.to_ascii_lowercase().contains("rate limit") => {
            Error::UpstreamTransient(message)
        }
        StatusCode::TOO_MANY_REQUESTS => Error::UpstreamTransient(message),
        s if s.is_server_error() => Error::UpstreamTransient(message),
        _ => match missing {
            Missing::Repository => Error::RepoNotFound(message),
            Missing::File => Error::FileNotAccessible(message),
        },
    }
}

#[derive(Deserialize)]
struct RepoResponse {
    id: u64,
    name: String,
    owner: OwnerResponse,
    default_branch: String,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct OwnerResponse {
    login: String,
}

#[derive(Deserialize)]
struct BranchResponse {
    name: String,
    commit: CommitRef,
}

#[derive(Deserialize)]
struct CommitRef {
    sha: String,
}

/// GitHub REST implementation of [`RemoteHost`].
#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Send and parse a JSON response, mapping failures through [`classify`].
    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        req: RequestBuilder,
        what: &str,
        missing: Missing,
    ) -> Result<T> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!("github request failed what={} status={}", what, status.as_u16());
            return Err(classify(status, &body, what, missing));
        }
        resp.json::<T>()
            .await
            .map_err(|e| Error::UpstreamTransient(format!("{}: malformed response: {}", what, e)))
    }
}

#[async_trait]
impl RemoteHost for GitHubClient {
    async fn get_repository(&self, repo: &RepoSlug) -> Result<RemoteRepository> {
        let path = format!("/repos/{}/{}", repo.owner, repo.name);
        let raw: RepoResponse = self
            .get_json(self.request(&path), &repo.to_string(), Missing::Repository)
            .await?;
        Ok(RemoteRepository {
            id: raw.id,
            name: raw.name,
            owner: raw.owner.login,
            default_branch: raw.default_branch,
            size: raw.size,
        })
    }

    async fn list_branches(&self, repo: &RepoSlug) -> Result<Vec<RemoteBranch>> {
        let path = format!("/repos/{}/{}/branches", repo.owner, repo.name);
        let mut branches = Vec::new();
        for page in 1.. {
            let req = self.request(&path).query(&[
                ("per_page", BRANCHES_PER_PAGE.to_string()),
                ("page", page.to_string()),
            ]);
            let batch: Vec<BranchResponse> = self
                .get_json(req, &format!("{} branches", repo), Missing::Repository)
                .await?;
            let len = batch.len();
            branches.extend(batch.into_iter().map(|b| RemoteBranch {
                name: b.name,
                commit: b.commit.sha,
            }));
            if len < BRANCHES_PER_PAGE {
                break;
            }
        }
        debug!("github branches repo={} count={}", repo, branches.len());
        Ok(branches)
    }

    async fn get_readme(&self, repo: &RepoSlug, reference: &str) -> Result<Option<String>> {
        let path = format!("/repos/{}/{}/readme", repo.owner, repo.name);
        let req = self.request(&path).query(&[("ref", reference)]);
        match self
            .get_json::<Blob>(req, &format!("{} readme", repo), Missing::File)
            .await
        {
            Ok(blob) => {
                let bytes = blob.decode()?;
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
            Err(Error::FileNotAccessible(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_tree(&self, repo: &RepoSlug, sha: &str, recursive: bool) -> Result<TreeListing> {
        let path = format!("/repos/{}/{}/git/trees/{}", repo.owner, repo.name, sha);
        let mut req = self.request(&path);
        if recursive {
            req = req.query(&[("recursive", "1")]);
        }
        self.get_json(req, &format!("{} tree {}", repo, sha), Missing::Repository)
            .await
    }

    async fn get_blob(&self, repo: &RepoSlug, sha: &str) -> Result<Blob> {
        let path = format!("/repos/{}/{}/git/blobs/{}", repo.owner, repo.name, sha);
        self.get_json(self.request(&path), &format!("{} blob {}", repo, sha), Missing::File)
            .await
    }

    async fn download_archive(&self, repo: &RepoSlug, reference: &str) -> Result<ByteReader> {
        let path = format!("/repos/{}/{}/zipball/{}", repo.owner, repo.name, reference);
        let resp = self.request(&path).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify(status, &body, &format!("{} zipball", repo), Missing::Repository));
        }
        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }
}
