// Streaming archive construction over any storage backend.
//
// Three stages connected by channels:
//   walk     list_files callback -> (relative path, size) (unbounded, the walk never waits)
//   feeder   read + transform each file -> bounded queue of fixed-size chunks
//   encoder  blocking zip/tar writer -> duplex pipe read by the consumer

use std::future::Future;
use std::io::{Read, Seek, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, warn};

use super::{ArchiveFormat, ArchiveOptions, ByteReader, EntryCallback, StorageBackend};
use crate::config::DEFAULT_ARCHIVE_CHANNEL_DEPTH;
use crate::error::{Error, Result};
use crate::tree::join_path;

const PIPE_CAPACITY: usize = 64 * 1024;
const CHUNK_SIZE: usize = 64 * 1024;

/// Outcome reported through the finalize signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Entries appended, in walk order.
    pub entries: Vec<String>,
    /// Files the walk found but that could not be opened.
    pub skipped: Vec<String>,
}

/// Feeder to encoder protocol: `Entry`, its `Chunk`s, then `EndEntry`.
enum Payload {
    Entry { name: String, size: Option<u64> },
    Chunk(Bytes),
    EndEntry,
    /// The feeder failed; the encoder must stop without finishing the archive.
    Abort,
}

enum Finalize {
    Pending(oneshot::Receiver<Result<ArchiveSummary>>),
    Ready(Result<ArchiveSummary>),
    Consumed,
}

/// The archive byte stream plus its finalize signal.
///
/// A failed archive never ends cleanly: once the encoder stops, reading
/// returns the failure instead of end-of-stream. Read the stream to the end
/// before awaiting [`ArchiveStream::finalized`], the encoder blocks once the
/// pipe is full.
pub struct ArchiveStream {
    reader: tokio::io::DuplexStream,
    finalize: Finalize,
}

impl ArchiveStream {
    /// Resolves exactly once, after the walk finished and every entry was appended.
    pub async fn finalized(&mut self) -> Result<ArchiveSummary> {
        match std::mem::replace(&mut self.finalize, Finalize::Consumed) {
            Finalize::Pending(rx) => rx
                .await
                .map_err(|_| Error::archive("archive task ended without finalizing"))?,
            Finalize::Ready(outcome) => outcome,
            Finalize::Consumed => Err(Error::archive("finalize signal already consumed")),
        }
    }

    /// Read the whole archive into memory and wait for the finalize signal.
    pub async fn collect(mut self) -> Result<(Vec<u8>, ArchiveSummary)> {
        let mut buf = Vec::new();
        if let Err(read_err) = self.read_to_end(&mut buf).await {
            return match self.finalized().await {
                Err(e) => Err(e),
                Ok(_) => Err(read_err.into()),
            };
        }
        let summary = self.finalized().await?;
        Ok((buf, summary))
    }
}

impl AsyncRead for ArchiveStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.reader).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // The encoder closed the pipe: end-of-stream only if it succeeded.
        if let Finalize::Pending(rx) = &mut this.finalize {
            let outcome = match ready!(Pin::new(rx).poll(cx)) {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::archive("archive task ended without finalizing")),
            };
            this.finalize = Finalize::Ready(outcome);
        }
        match &this.finalize {
            Finalize::Ready(Err(e)) => Poll::Ready(Err(std::io::Error::other(e.to_string()))),
            _ => Poll::Ready(Ok(())),
        }
    }
}

/// Stream the subtree `root` of `repo_id` as an archive. Entry names are
/// relative to `root`, in depth-first walk order.
pub fn archive(
    storage: Arc<dyn StorageBackend>,
    repo_id: &str,
    root: &str,
    options: ArchiveOptions,
) -> ArchiveStream {
    archive_with_depth(storage, repo_id, root, options, DEFAULT_ARCHIVE_CHANNEL_DEPTH)
}

pub fn archive_with_depth(
    storage: Arc<dyn StorageBackend>,
    repo_id: &str,
    root: &str,
    options: ArchiveOptions,
    depth: usize,
) -> ArchiveStream {
    let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel();
    let (payload_tx, payload_rx) = mpsc::channel::<Payload>(depth.max(1));

    let format = options.format;
    let bridge = SyncIoBridge::new(writer);
    let encoder = tokio::task::spawn_blocking(move || encode(format, payload_rx, bridge));

    let repo_id = repo_id.to_string();
    let root = root.to_string();
    tokio::spawn(async move {
        let fed = feed(storage, &repo_id, &root, options, &payload_tx).await;
        if fed.is_err() {
            let _ = payload_tx.send(Payload::Abort).await;
        }
        // Without a sender the encoder drains and finishes.
        drop(payload_tx);
        let encoded = match encoder.await {
            Ok(result) => result,
            Err(e) => Err(Error::archive(format!("encoder task failed: {}", e))),
        };
        let outcome = match (fed, encoded) {
            (Ok(summary), Ok(appended)) if appended == summary.entries.len() => {
                info!(
                    "archive finalized repo={} root=/{} format={:?} entries={} skipped={}",
                    repo_id,
                    root,
                    format,
                    appended,
                    summary.skipped.len()
                );
                Ok(summary)
            }
            (Ok(summary), Ok(appended)) => Err(Error::archive(format!(
                "encoder appended {} of {} entries",
                appended,
                summary.entries.len()
            ))),
            (Err(e), _) | (_, Err(e)) => {
                warn!("archive failed repo={} root=/{}: {}", repo_id, root, e);
                Err(e)
            }
        };
        let _ = done_tx.send(outcome);
    });

    ArchiveStream {
        reader,
        finalize: Finalize::Pending(done_rx),
    }
}

/// Walk the subtree and push every readable file to the encoder queue.
async fn feed(
    storage: Arc<dyn StorageBackend>,
    repo_id: &str,
    root: &str,
    options: ArchiveOptions,
    payload_tx: &mpsc::Sender<Payload>,
) -> Result<ArchiveSummary> {
    let (path_tx, mut path_rx) = mpsc::unbounded_channel::<(String, u64)>();

    let walk = {
        let storage = Arc::clone(&storage);
        async move {
            let on_entry: &mut EntryCallback<'_> = &mut |path: &str, size: u64| {
                let _ = path_tx.send((path.to_string(), size));
            };
            storage.list_files(repo_id, root, Some(on_entry)).await
            // path_tx drops here, ending the feeder loop below.
        }
    };

    let append = async {
        let mut summary = ArchiveSummary::default();
        while let Some((rel, size)) = path_rx.recv().await {
            let full = join_path(root.trim_matches('/'), &rel);
            let input = match storage.read(repo_id, &full).await {
                Ok(reader) => reader,
                Err(e) => {
                    warn!("archive skipped {}: {}", full, e);
                    summary.skipped.push(rel);
                    continue;
                }
            };
            let (input, size) = match &options.transformer {
                Some(transformer) => {
                    let output = transformer.transform(&rel, input).await?;
                    match options.format {
                        // Tar headers carry the size up front.
                        ArchiveFormat::Tar => {
                            let data = read_all(output).await?;
                            let len = data.len() as u64;
                            (Box::pin(std::io::Cursor::new(data)) as ByteReader, Some(len))
                        }
                        ArchiveFormat::Zip => (output, None),
                    }
                }
                None => (input, Some(size)),
            };

            send(payload_tx, Payload::Entry { name: rel.clone(), size }).await?;
            send_chunks(payload_tx, input).await?;
            send(payload_tx, Payload::EndEntry).await?;
            summary.entries.push(rel);
        }
        Ok::<_, Error>(summary)
    };

    let (walked, appended) = tokio::join!(walk, append);
    walked?;
    let summary = appended?;
    debug!("archive feed done repo={} entries={}", repo_id, summary.entries.len());
    Ok(summary)
}

async fn send(tx: &mpsc::Sender<Payload>, payload: Payload) -> Result<()> {
    tx.send(payload)
        .await
        .map_err(|_| Error::archive("archive consumer went away"))
}

async fn send_chunks(tx: &mpsc::Sender<Payload>, mut input: ByteReader) -> Result<()> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        send(tx, Payload::Chunk(Bytes::copy_from_slice(&buf[..n]))).await?;
    }
}

async fn read_all(mut input: ByteReader) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    input.read_to_end(&mut data).await?;
    Ok(data)
}

/// Blocking side of one entry: yields its chunks until `EndEntry`.
struct EntryBody<'a> {
    rx: &'a mut mpsc::Receiver<Payload>,
    pending: Bytes,
    done: bool,
    written: u64,
}

impl<'a> EntryBody<'a> {
    fn new(rx: &'a mut mpsc::Receiver<Payload>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
            done: false,
            written: 0,
        }
    }
}

impl Read for EntryBody<'_> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        while self.pending.is_empty() {
            if self.done || out.is_empty() {
                return Ok(0);
            }
            match self.rx.blocking_recv() {
                Some(Payload::Chunk(data)) => self.pending = data,
                Some(Payload::EndEntry) => self.done = true,
                Some(Payload::Entry { .. }) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "entry started before the previous one ended",
                    ))
                }
                Some(Payload::Abort) | None => return Err(std::io::Error::other("archive aborted")),
            }
        }
        let n = out.len().min(self.pending.len());
        out[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        self.written += n as u64;
        Ok(n)
    }
}

/// Writer that refuses every write once closed, so a codec dropped after a
/// failure cannot complete the archive behind our back.
struct GatedWriter<W> {
    inner: W,
    open: Arc<AtomicBool>,
}

impl<W: Write> Write for GatedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        self.inner.flush()
    }
}

/// Blocking encoder loop; returns the number of entries written. On failure
/// the archive is left unfinished.
fn encode<W: Write>(format: ArchiveFormat, mut rx: mpsc::Receiver<Payload>, writer: W) -> Result<usize> {
    let open = Arc::new(AtomicBool::new(true));
    let writer = GatedWriter {
        inner: writer,
        open: Arc::clone(&open),
    };
    match format {
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipWriter::new_stream(writer);
            let appended = match append_zip(&mut zip, &mut rx) {
                Ok(n) => n,
                Err(e) => {
                    open.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            };
            let mut inner = zip.finish()?;
            inner.flush()?;
            Ok(appended)
        }
        ArchiveFormat::Tar => {
            let mut tar = tar::Builder::new(writer);
            let appended = match append_tar(&mut tar, &mut rx) {
                Ok(n) => n,
                Err(e) => {
                    open.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            };
            let mut inner = tar.into_inner()?;
            inner.flush()?;
            Ok(appended)
        }
    }
}

fn append_zip<W: Write + Seek>(zip: &mut zip::ZipWriter<W>, rx: &mut mpsc::Receiver<Payload>) -> Result<usize> {
    let mut appended = 0;
    while let Some(payload) = rx.blocking_recv() {
        let (name, size) = match payload {
            Payload::Entry { name, size } => (name, size),
            Payload::Abort => return Err(Error::archive("archive aborted")),
            _ => return Err(Error::archive("chunk outside of an entry")),
        };
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .large_file(size.unwrap_or(0) >= u32::MAX as u64);
        zip.start_file(name, options)?;
        std::io::copy(&mut EntryBody::new(rx), zip)?;
        appended += 1;
    }
    Ok(appended)
}

fn append_tar<W: Write>(tar: &mut tar::Builder<W>, rx: &mut mpsc::Receiver<Payload>) -> Result<usize> {
    let mut appended = 0;
    while let Some(payload) = rx.blocking_recv() {
        let (name, size) = match payload {
            Payload::Entry { name, size: Some(size) } => (name, size),
            Payload::Entry { name, size: None } => {
                return Err(Error::archive(format!("{}: tar entry without a size", name)))
            }
            Payload::Abort => return Err(Error::archive("archive aborted")),
            _ => return Err(Error::archive("chunk outside of an entry")),
        };
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_size(size);
        let mut body = EntryBody::new(rx);
        tar.append_data(&mut header, &name, &mut body)?;
        if body.written != size {
            return Err(Error::archive(format!(
                "{} changed while archiving: expected {} bytes, read {}",
                name, size, body.written
            )));
        }
        appended += 1;
    }
    Ok(appended)
}
