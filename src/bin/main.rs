//! Operator CLI for the repository cache.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::info;

use anon_repo_cache::config::EngineConfig;
use anon_repo_cache::engine::cache::RepoCache;
use anon_repo_cache::source::github_api::{GitHubClient, RemoteHost};
use anon_repo_cache::source::github_stream::GitHubStream;
use anon_repo_cache::source::repository::RepoSlug;
use anon_repo_cache::source::traits::{ProgressFn, Source, SyncProgress};
use anon_repo_cache::source::zip_source::ZipSource;
use anon_repo_cache::storage::{ArchiveFormat, ArchiveOptions};
use anon_repo_cache::telemetry::init_tracing;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Overrides ANON_CACHE_STORAGE_ROOT.
    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the full tree of a hosted repository as JSON.
    Tree {
        /// `owner/name` or repository URL.
        repo: String,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long, env = "ANON_CACHE_TREE_CONCURRENCY")]
        concurrency: Option<usize>,
    },
    /// Write a cached subtree as an archive.
    Archive {
        repo_id: String,
        #[arg(default_value = "")]
        path: String,
        #[arg(long, default_value = "zip")]
        format: ArchiveFormat,
        #[arg(long)]
        out: PathBuf,
    },
    /// Remove a repository cache.
    Rm { repo_id: String },
    /// Load an uploaded zip into a repository cache.
    Ingest { repo_id: String, zip: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = EngineConfig::from_env()?;
    if let Some(root) = cli.storage_root {
        config.storage_root = root;
    }
    let cache = RepoCache::from_config(&config);

    match cli.command {
        Command::Tree {
            repo,
            branch,
            concurrency,
        } => {
            let slug = RepoSlug::parse(&repo)?;
            let host: Arc<dyn RemoteHost> = Arc::new(GitHubClient::new(
                config.github_api_url.clone(),
                config.github_token.clone(),
            )?);
            let remote = host.get_repository(&slug).await?;
            let branch = branch.unwrap_or(remote.default_branch);
            let commit = host
                .list_branches(&slug)
                .await?
                .into_iter()
                .find(|b| b.name == branch)
                .map(|b| b.commit)
                .ok_or_else(|| anyhow!("{} has no branch {}", slug, branch))?;

            let source = GitHubStream::new(host, Arc::clone(cache.storage()), remote.id.to_string(), slug, commit)
                .with_tree_concurrency(concurrency.unwrap_or(config.tree_concurrency))
                .with_max_blob_size(config.max_blob_size);
            let report: &ProgressFn<'_> = &|p: &SyncProgress| {
                info!("listed={} pending={}", p.listed, p.pending);
            };
            let tree = source.get_files(Some(report)).await?;
            println!("{}", serde_json::to_string_pretty(&tree)?);
        }
        Command::Archive {
            repo_id,
            path,
            format,
            out,
        } => {
            let mut stream = cache.archive(&repo_id, &path, ArchiveOptions::new(format));
            let mut file = tokio::fs::File::create(&out)
                .await
                .with_context(|| format!("creating {}", out.display()))?;
            tokio::io::copy(&mut stream, &mut file).await?;
            file.flush().await?;
            let summary = stream.finalized().await?;
            info!(
                "wrote {} with {} entries ({} skipped)",
                out.display(),
                summary.entries.len(),
                summary.skipped.len()
            );
        }
        Command::Rm { repo_id } => {
            cache.remove_cache(&repo_id).await?;
        }
        Command::Ingest { repo_id, zip } => {
            let file = tokio::fs::File::open(&zip)
                .await
                .with_context(|| format!("opening {}", zip.display()))?;
            let source = ZipSource::new(Arc::clone(cache.storage()), repo_id);
            let summary = source.ingest(Box::pin(file)).await?;
            info!(
                "ingested {} files, {} directories",
                summary.files, summary.dirs
            );
        }
    }

    Ok(())
}
