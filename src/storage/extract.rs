// Uploaded / downloaded zip ingestion into a repository cache.

use std::io::Read;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info};

use super::{ByteReader, StorageBackend};
use crate::error::{Error, Result};
use crate::tree::join_path;

const EXTRACT_QUEUE_DEPTH: usize = 16;
const CHUNK_QUEUE_DEPTH: usize = 8;
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub dirs: usize,
    /// Entries whose name was empty after stripping the wrapper.
    pub discarded: usize,
}

enum Op {
    Dir(String),
    /// File content follows on its own channel, ending when the sender drops.
    File(String, mpsc::Receiver<std::io::Result<Bytes>>),
}

/// Drop the top-level wrapper directory archive-download services put around
/// the repository content. Names without a directory part are kept as they are.
pub fn strip_wrapper(name: &str) -> &str {
    let name = name.trim_start_matches('/');
    match name.split_once('/') {
        Some((_, rest)) => rest,
        None => name,
    }
}

/// Stream a zip archive into the cache of `repo_id` below `path`.
pub async fn extract_zip(
    storage: &dyn StorageBackend,
    repo_id: &str,
    path: &str,
    input: ByteReader,
) -> Result<ExtractSummary> {
    let (tx, mut rx) = mpsc::channel::<Op>(EXTRACT_QUEUE_DEPTH);
    let bridge = SyncIoBridge::new(input);
    let decoder = tokio::task::spawn_blocking(move || decode(bridge, tx));

    let mut summary = ExtractSummary::default();
    let target_root = path.trim_matches('/');
    let mut apply_err = None;
    while let Some(op) = rx.recv().await {
        let result = match op {
            Op::Dir(name) => {
                summary.dirs += 1;
                storage.mk(repo_id, &join_path(target_root, &name)).await
            }
            Op::File(name, chunks) => {
                summary.files += 1;
                let body = StreamReader::new(futures::stream::unfold(chunks, |mut rx| async move {
                    rx.recv().await.map(|chunk| (chunk, rx))
                }));
                storage
                    .write_stream(repo_id, &join_path(target_root, &name), Box::pin(body))
                    .await
                    .map(|_| ())
            }
        };
        if let Err(e) = result {
            apply_err = Some(e);
            break;
        }
    }
    // Closing the queue makes the decoder stop at its next send.
    drop(rx);

    let discarded = match decoder.await {
        Ok(result) => result,
        Err(e) => Err(Error::archive(format!("zip decoder task failed: {}", e))),
    };
    if let Some(e) = apply_err {
        return Err(e);
    }
    summary.discarded = discarded?;

    info!(
        "extract_zip repo={} path=/{} files={} dirs={} discarded={}",
        repo_id, target_root, summary.files, summary.dirs, summary.discarded
    );
    Ok(summary)
}

/// Blocking side: walk local headers in stream order. Returns the discard count.
/// Entry bodies go out in fixed-size chunks; the declared size is never trusted.
fn decode<R: Read>(mut reader: R, tx: mpsc::Sender<Op>) -> Result<usize> {
    let mut discarded = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];
    'entries: while let Some(mut entry) = zip::read::read_zipfile_from_stream(&mut reader)? {
        let raw_name = entry.name().to_string();
        let name = strip_wrapper(&raw_name).trim_end_matches('/').to_string();
        if name.is_empty() {
            std::io::copy(&mut entry, &mut std::io::sink())?;
            discarded += 1;
            debug!("extract_zip discarded {}", raw_name);
            continue;
        }
        if entry.is_dir() {
            if tx.blocking_send(Op::Dir(name)).is_err() {
                break;
            }
            continue;
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        if tx.blocking_send(Op::File(name, chunk_rx)).is_err() {
            break;
        }
        loop {
            match entry.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if chunk_tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        // Receiver stopped on a storage error, which it reports itself.
                        break 'entries;
                    }
                }
                Err(e) => {
                    let _ = chunk_tx.blocking_send(Err(std::io::Error::new(e.kind(), e.to_string())));
                    return Err(e.into());
                }
            }
        }
    }
    Ok(discarded)
}
