use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use bytes::Bytes;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use anon_repo_cache::engine::cache::RepoCache;
use anon_repo_cache::error::{Error, Result};
use anon_repo_cache::source::github_api::{GitHubClient, RemoteHost};
use anon_repo_cache::source::github_download::GitHubDownload;
use anon_repo_cache::source::github_stream::GitHubStream;
use anon_repo_cache::source::repository::{
    JsonRepositoryStore, MemoryRepositoryStore, RepoSlug, RepositoryHandle, RepositoryStore,
};
use anon_repo_cache::source::traits::{FileRef, Source, SourceKind};
use anon_repo_cache::source::zip_source::ZipSource;
use anon_repo_cache::storage::fs::FileSystemStorage;
use anon_repo_cache::storage::{ByteReader, EntryStatus, StorageBackend};
use anon_repo_cache::tree::{EntryKind, Tree};

const FILES: &[(&str, &str, &str)] = &[
    ("README.md", "b-readme", "# Demo\n"),
    ("src/$cfg.toml", "b-cfg", "x = 1\n"),
    ("src/lib.rs", "b-lib", "pub fn demo() {}\n"),
];

#[derive(Default)]
struct Fixture {
    repo_calls: AtomicUsize,
    readme_calls: AtomicUsize,
    zipball_calls: AtomicUsize,
}

fn zipball() -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    zip.add_directory("octo-demo-c1", options).unwrap();
    zip.add_directory("octo-demo-c1/src", options).unwrap();
    for (path, _, content) in FILES {
        zip.start_file(format!("octo-demo-c1/{}", path), options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

async fn serve_repository(State(fx): State<Arc<Fixture>>, Path((owner, name)): Path<(String, String)>) -> Response {
    fx.repo_calls.fetch_add(1, Ordering::SeqCst);
    if name != "demo" {
        return (StatusCode::NOT_FOUND, Json(json!({"message": "Not Found"}))).into_response();
    }
    Json(json!({
        "id": 42,
        "name": name,
        "owner": {"login": owner},
        "default_branch": "main",
        "size": 3,
        "pushed_at": "2024-01-01T00:00:00Z"
    }))
    .into_response()
}

async fn serve_branches() -> Response {
    Json(json!([
        {"name": "main", "commit": {"sha": "c1"}},
        {"name": "bare", "commit": {"sha": "c0"}}
    ]))
    .into_response()
}

async fn serve_readme(State(fx): State<Arc<Fixture>>, Query(query): Query<HashMap<String, String>>) -> Response {
    fx.readme_calls.fetch_add(1, Ordering::SeqCst);
    match query.get("ref").map(String::as_str) {
        Some("main") => {
            let content = base64::engine::general_purpose::STANDARD.encode("# Demo\n");
            Json(json!({"encoding": "base64", "content": content, "size": 7})).into_response()
        }
        _ => (StatusCode::NOT_FOUND, Json(json!({"message": "Not Found"}))).into_response(),
    }
}

async fn serve_tree(Path((_owner, _name, sha)): Path<(String, String, String)>) -> Response {
    if sha != "c1" {
        return (StatusCode::NOT_FOUND, Json(json!({"message": "Not Found"}))).into_response();
    }
    let mut entries = vec![json!({"path": "src", "type": "tree", "sha": "t-src"})];
    for (path, blob, content) in FILES {
        entries.push(json!({"path": path, "type": "blob", "sha": blob, "size": content.len()}));
    }
    Json(json!({"sha": "c1", "tree": entries, "truncated": false})).into_response()
}

async fn serve_blob(Path((_owner, _name, sha)): Path<(String, String, String)>) -> Response {
    if sha == "b-big" {
        let content = base64::engine::general_purpose::STANDARD.encode("tiny");
        return Json(json!({"encoding": "base64", "content": content, "size": 1000})).into_response();
    }
    match FILES.iter().find(|(_, blob, _)| *blob == sha) {
        Some((_, _, content)) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(content);
            Json(json!({"encoding": "base64", "content": encoded, "size": content.len()})).into_response()
        }
        None => (StatusCode::NOT_FOUND, Json(json!({"message": "Not Found"}))).into_response(),
    }
}

async fn serve_zipball(State(fx): State<Arc<Fixture>>) -> Response {
    fx.zipball_calls.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/zip")], zipball()).into_response()
}

async fn start_server() -> (SocketAddr, Arc<Fixture>, tokio::task::JoinHandle<()>) {
    let fixture = Arc::new(Fixture::default());
    let app = Router::new()
        .route("/repos/{owner}/{name}", get(serve_repository))
        .route("/repos/{owner}/{name}/branches", get(serve_branches))
        .route("/repos/{owner}/{name}/readme", get(serve_readme))
        .route("/repos/{owner}/{name}/git/trees/{sha}", get(serve_tree))
        .route("/repos/{owner}/{name}/git/blobs/{sha}", get(serve_blob))
        .route("/repos/{owner}/{name}/zipball/{reference}", get(serve_zipball))
        .with_state(fixture.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, fixture, handle)
}

fn client(addr: SocketAddr) -> Arc<dyn RemoteHost> {
    Arc::new(GitHubClient::new(format!("http://{}", addr), None).unwrap())
}

fn slug() -> RepoSlug {
    RepoSlug::new("octo", "demo")
}

/// `ByteReader` is not `Debug`, so `unwrap_err` is unavailable.
fn expect_err(result: Result<ByteReader>) -> Error {
    match result {
        Err(e) => e,
        Ok(_) => panic!("expected an error"),
    }
}

async fn read_string(mut reader: ByteReader) -> String {
    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    out
}

/// Paths, kinds and sizes; blob ids differ between remote listings and local caches.
fn shape(tree: &Tree) -> Vec<(String, EntryKind, Option<u64>)> {
    tree.flatten().into_iter().map(|e| (e.path, e.kind, e.size)).collect()
}

#[tokio::test]
async fn test_stream_source_writes_cache_copy() {
    let (addr, _fx, _handle) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn StorageBackend> = Arc::new(FileSystemStorage::new(dir.path()));
    let source = GitHubStream::new(client(addr), storage.clone(), "r42", slug(), "c1");
    assert_eq!(source.kind(), SourceKind::GitHubStream);

    let file = FileRef::new("src/lib.rs", Some("b-lib".to_string()));
    let content = read_string(source.get_file_content(&file).await.unwrap()).await;
    assert_eq!(content, "pub fn demo() {}\n");

    assert_eq!(storage.exists("r42", "src/lib.rs").await, EntryStatus::File);
    let cached = read_string(storage.read("r42", "src/lib.rs").await.unwrap()).await;
    assert_eq!(cached, content);
}

#[tokio::test]
async fn test_stream_source_content_errors() {
    let (addr, _fx, _handle) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn StorageBackend> = Arc::new(FileSystemStorage::new(dir.path()));
    let source = GitHubStream::new(client(addr), storage.clone(), "r42", slug(), "c1").with_max_blob_size(100);

    let err = expect_err(source.get_file_content(&FileRef::new("src/lib.rs", None)).await);
    assert!(matches!(err, Error::FileShaMissing(ref p) if p == "src/lib.rs"), "{:?}", err);

    let err = expect_err(source.get_file_content(&FileRef::new("big.bin", Some("b-big".to_string()))).await);
    assert!(matches!(err, Error::FileTooLarge(_)), "{:?}", err);

    let err = expect_err(source.get_file_content(&FileRef::new("gone.txt", Some("b-gone".to_string()))).await);
    assert!(matches!(err, Error::FileNotAccessible(_)), "{:?}", err);

    assert_eq!(storage.exists("r42", "big.bin").await, EntryStatus::NotFound);
    assert_eq!(storage.exists("r42", "gone.txt").await, EntryStatus::NotFound);
}

#[tokio::test]
async fn test_all_sources_list_the_same_tree() {
    let (addr, fx, _handle) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn StorageBackend> = Arc::new(FileSystemStorage::new(dir.path()));

    let stream = GitHubStream::new(client(addr), storage.clone(), "streamed", slug(), "c1");
    let streamed = stream.get_files(None).await.unwrap();

    let download = GitHubDownload::new(client(addr), storage.clone(), "downloaded", slug(), "c1");
    let downloaded = download.get_files(None).await.unwrap();
    download.get_files(None).await.unwrap();
    assert_eq!(fx.zipball_calls.load(Ordering::SeqCst), 1);

    let upload = ZipSource::new(storage.clone(), "uploaded");
    let summary = upload.ingest(Box::pin(Cursor::new(zipball()))).await.unwrap();
    assert_eq!(summary.files, FILES.len());
    let uploaded = upload.get_files(None).await.unwrap();

    assert_eq!(shape(&downloaded), shape(&uploaded));
    assert_eq!(shape(&streamed), shape(&uploaded));
    assert_eq!(
        streamed.get("src/lib.rs").and_then(|n| n.as_file()).unwrap().sha,
        "b-lib"
    );

    let content = read_string(
        download
            .get_file_content(&FileRef::new("src/$cfg.toml", None))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(content, "x = 1\n");
    let err = expect_err(upload.get_file_content(&FileRef::new("src", None)).await);
    assert!(matches!(err, Error::FileNotAccessible(_)));
}

#[tokio::test]
async fn test_ingest_replaces_previous_upload() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn StorageBackend> = Arc::new(FileSystemStorage::new(dir.path()));
    storage
        .write("uploaded", "stale.txt", Bytes::from_static(b"old"))
        .await
        .unwrap();

    let upload = ZipSource::new(storage.clone(), "uploaded");
    upload.ingest(Box::pin(Cursor::new(zipball()))).await.unwrap();
    assert_eq!(storage.exists("uploaded", "stale.txt").await, EntryStatus::NotFound);
    assert_eq!(storage.exists("uploaded", "README.md").await, EntryStatus::File);
}

#[tokio::test]
async fn test_repository_readme_is_fetched_once() {
    let (addr, fx, _handle) = start_server().await;
    let store: Arc<dyn RepositoryStore> = Arc::new(MemoryRepositoryStore::new());

    let mut handle = RepositoryHandle::open("r42", &slug(), client(addr), store.clone())
        .await
        .unwrap();
    assert_eq!(handle.repository().default_branch, "main");

    let branches = handle.branches(false).await.unwrap();
    assert_eq!(branches.len(), 2);

    assert_eq!(handle.readme("main", false).await.unwrap().as_deref(), Some("# Demo\n"));
    assert_eq!(handle.readme("main", false).await.unwrap().as_deref(), Some("# Demo\n"));
    assert_eq!(fx.readme_calls.load(Ordering::SeqCst), 1);

    // A branch refresh with an unchanged commit keeps the cached readme.
    handle.branches(true).await.unwrap();
    handle.readme("main", false).await.unwrap();
    assert_eq!(fx.readme_calls.load(Ordering::SeqCst), 1);

    handle.readme("main", true).await.unwrap();
    assert_eq!(fx.readme_calls.load(Ordering::SeqCst), 2);

    assert_eq!(handle.readme("bare", false).await.unwrap(), None);
    assert!(matches!(
        handle.readme("nope", false).await,
        Err(Error::RepoNotFound(_))
    ));

    let stored = store.get("r42").await.unwrap().unwrap();
    assert_eq!(stored.branch("main").unwrap().readme.as_deref(), Some("# Demo\n"));
}

#[tokio::test]
async fn test_open_uses_persisted_record() {
    let (addr, fx, _handle) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn RepositoryStore> = Arc::new(JsonRepositoryStore::new(dir.path()));

    RepositoryHandle::open("r42", &slug(), client(addr), store.clone())
        .await
        .unwrap();
    let handle = RepositoryHandle::open("r42", &slug(), client(addr), store.clone())
        .await
        .unwrap();
    assert_eq!(fx.repo_calls.load(Ordering::SeqCst), 1);
    assert_eq!(handle.repository().owner, "octo");

    let missing = RepositoryHandle::open("r7", &RepoSlug::new("octo", "ghost"), client(addr), store).await;
    assert!(matches!(missing, Err(Error::RepoNotFound(_))));
}

#[tokio::test]
async fn test_ensure_fresh_drops_stale_cache() {
    let (addr, _fx, _handle) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let cache = RepoCache::new(Arc::new(FileSystemStorage::new(dir.path())));
    let store: Arc<dyn RepositoryStore> = Arc::new(MemoryRepositoryStore::new());
    let mut handle = RepositoryHandle::open("r42", &slug(), client(addr), store)
        .await
        .unwrap();

    cache
        .storage()
        .write("r42", "old.txt", Bytes::from_static(b"old"))
        .await
        .unwrap();
    assert!(cache.ensure_fresh(&mut handle, "c1").await.unwrap());
    assert_eq!(cache.exists("r42", "old.txt").await, EntryStatus::NotFound);
    assert!(handle.is_up_to_date("c1"));

    cache
        .storage()
        .write("r42", "new.txt", Bytes::from_static(b"new"))
        .await
        .unwrap();
    assert!(!cache.ensure_fresh(&mut handle, "c1").await.unwrap());
    assert_eq!(cache.exists("r42", "new.txt").await, EntryStatus::File);
}

#[tokio::test]
async fn test_fetch_prefers_cached_copy() {
    let (addr, _fx, _handle) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let cache = RepoCache::new(Arc::new(FileSystemStorage::new(dir.path())));
    let source = GitHubStream::new(client(addr), Arc::clone(cache.storage()), "r42", slug(), "c1");

    cache
        .storage()
        .write("r42", "README.md", Bytes::from_static(b"local copy"))
        .await
        .unwrap();
    let file = FileRef::new("README.md", Some("b-readme".to_string()));
    assert_eq!(read_string(cache.fetch(&source, "r42", &file).await.unwrap()).await, "local copy");

    let file = FileRef::new("src/lib.rs", Some("b-lib".to_string()));
    assert_eq!(
        read_string(cache.fetch(&source, "r42", &file).await.unwrap()).await,
        "pub fn demo() {}\n"
    );
    assert_eq!(cache.exists("r42", "src/lib.rs").await, EntryStatus::File);
}
