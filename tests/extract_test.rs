use std::io::{Cursor, Write};
use std::sync::Arc;

use tokio::io::AsyncReadExt;

use anon_repo_cache::engine::cache::RepoCache;
use anon_repo_cache::storage::fs::FileSystemStorage;
use anon_repo_cache::storage::EntryStatus;

/// Build a zip in memory. Names ending in `/` become directory entries.
fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in entries {
        if name.ends_with('/') {
            zip.add_directory(name.trim_end_matches('/'), options).unwrap();
        } else {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
    }
    zip.finish().unwrap().into_inner()
}

fn cache(dir: &tempfile::TempDir) -> RepoCache {
    RepoCache::new(Arc::new(FileSystemStorage::new(dir.path())))
}

#[tokio::test]
async fn test_wrapper_directory_is_stripped() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir);
    let bytes = build_zip(&[
        ("wrapper/", ""),
        ("wrapper/a/", ""),
        ("wrapper/a/b.txt", "hello"),
        ("wrapper/README.md", "# readme"),
    ]);

    let summary = cache
        .extract_zip("r1", "", Box::pin(Cursor::new(bytes)))
        .await
        .unwrap();
    assert_eq!(summary.files, 2);
    assert_eq!(summary.dirs, 1);
    assert_eq!(summary.discarded, 1);

    assert_eq!(cache.exists("r1", "a/b.txt").await, EntryStatus::File);
    assert_eq!(cache.exists("r1", "README.md").await, EntryStatus::File);
    assert_eq!(cache.exists("r1", "wrapper").await, EntryStatus::NotFound);

    let mut content = String::new();
    cache
        .read("r1", "a/b.txt")
        .await
        .unwrap()
        .read_to_string(&mut content)
        .await
        .unwrap();
    assert_eq!(content, "hello");
}

#[tokio::test]
async fn test_extract_below_target_path() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir);
    let bytes = build_zip(&[("octo-demo-1234/src/lib.rs", "pub fn x() {}")]);

    cache
        .extract_zip("r1", "/imported/", Box::pin(Cursor::new(bytes)))
        .await
        .unwrap();
    assert_eq!(cache.exists("r1", "imported/src/lib.rs").await, EntryStatus::File);
    assert_eq!(cache.exists("r1", "src").await, EntryStatus::NotFound);
}

#[tokio::test]
async fn test_garbage_input_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir);

    let result = cache
        .extract_zip("r1", "", Box::pin(Cursor::new(b"definitely not a zip archive".to_vec())))
        .await;
    assert!(result.is_err());
    assert!(cache.list_files("r1", "").await.unwrap().is_empty());
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// A single stored entry whose zip64 extra field declares a huge size while
/// only `data` follows the header.
fn zip_with_declared_size(name: &str, data: &[u8], declared: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
    out.extend_from_slice(&45u16.to_le_bytes()); // version needed
    out.extend_from_slice(&0u16.to_le_bytes()); // flags
    out.extend_from_slice(&0u16.to_le_bytes()); // stored
    out.extend_from_slice(&0u16.to_le_bytes()); // time
    out.extend_from_slice(&0u16.to_le_bytes()); // date
    out.extend_from_slice(&crc32(data).to_le_bytes());
    out.extend_from_slice(&u32::MAX.to_le_bytes());
    out.extend_from_slice(&u32::MAX.to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&20u16.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&0x0001u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(&declared.to_le_bytes());
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
    // Central directory start ends the local header walk.
    out.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
    out.resize(out.len() + 42, 0);
    out
}

#[tokio::test]
async fn test_declared_entry_size_is_not_preallocated() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir);
    let bytes = zip_with_declared_size("wrapper/huge.bin", b"small", 1 << 44);

    let result = cache.extract_zip("r1", "", Box::pin(Cursor::new(bytes))).await;
    if result.is_ok() && cache.exists("r1", "huge.bin").await == EntryStatus::File {
        let info = cache.file_info("r1", "huge.bin").await.unwrap();
        assert!(info.size <= 5);
    }
}

#[tokio::test]
async fn test_multi_chunk_entry_is_written_whole() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache(&dir);
    let big: String = (0..300_000).map(|i| char::from(b'0' + (i % 10) as u8)).collect();
    let bytes = build_zip(&[("w/big.txt", big.as_str()), ("w/after.txt", "after")]);

    let summary = cache
        .extract_zip("r1", "", Box::pin(Cursor::new(bytes)))
        .await
        .unwrap();
    assert_eq!(summary.files, 2);

    let mut content = String::new();
    cache
        .read("r1", "big.txt")
        .await
        .unwrap()
        .read_to_string(&mut content)
        .await
        .unwrap();
    assert_eq!(content, big);
    assert_eq!(cache.exists("r1", "after.txt").await, EntryStatus::File);
}
