//! Shared data model: device announcements, directory metadata, file digests.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::frame::BufferPool;

/// Broadcast payload identifying a device. Recreated for every send, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAnnouncement {
    pub text: String,
}

impl DeviceAnnouncement {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
pub fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// One folder within a directory listing. `path` is the identity key the
/// remote side diffs against and is unique within a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderMeta {
    pub name: String,
    pub path: String,
    pub child_count: u64,
    pub last_modified_epoch_millis: i64,
}

/// One file within a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub last_modified_epoch_millis: i64,
}

/// JSON document answering a directory-listing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    pub path: String,
    pub children_folders: Vec<FolderMeta>,
    pub children_files: Vec<FileMeta>,
}

impl DirectoryListing {
    pub fn empty(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            children_folders: Vec::new(),
            children_files: Vec::new(),
        }
    }

    /// Every entry's `path` must appear exactly once.
    pub fn paths_are_unique(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.children_folders
            .iter()
            .map(|f| f.path.as_str())
            .chain(self.children_files.iter().map(|f| f.path.as_str()))
            .all(|path| seen.insert(path))
    }
}

/// A specific file version: metadata plus the SHA-256 of its content. The
/// transfer engine addresses files by this identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDigest {
    pub file: FileMeta,
    pub content_hash: [u8; 32],
}

/// Hash a byte slice.
pub fn digest_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Hash everything a reader yields, in pooled buffer-sized reads.
pub async fn digest_reader<R>(reader: &mut R, pool: &BufferPool) -> std::io::Result<[u8; 32]>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = pool.take();
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    pool.restore(buf);
    Ok(hasher.finalize().into())
}

/// Hash a file's content.
pub async fn digest_file(path: &Path) -> std::io::Result<[u8; 32]> {
    let mut file = tokio::fs::File::open(path).await?;
    digest_reader(&mut file, &BufferPool::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, path: &str) -> FileMeta {
        FileMeta {
            name: name.to_string(),
            path: path.to_string(),
            size: 10,
            last_modified_epoch_millis: 1_600_000_000_000,
        }
    }

    #[test]
    fn truncate_respects_char_boundary() {
        assert_eq!(truncate_utf8("hello", 1024), "hello");
        assert_eq!(truncate_utf8("hello", 3), "hel");
        // Multibyte: "é" is two bytes; cutting mid-sequence backs off.
        assert_eq!(truncate_utf8("aé", 2), "a");
        assert_eq!(truncate_utf8("aé", 3), "aé");
        assert_eq!(truncate_utf8("é", 1), "");
    }

    #[test]
    fn listing_json_shape() {
        let listing = DirectoryListing {
            path: "/music".to_string(),
            children_folders: vec![FolderMeta {
                name: "albums".to_string(),
                path: "/music/albums".to_string(),
                child_count: 3,
                last_modified_epoch_millis: 1_600_000_000_000,
            }],
            children_files: vec![file("a.mp3", "/music/a.mp3")],
        };
        let json = serde_json::to_value(&listing).unwrap();
        assert_eq!(json["path"], "/music");
        assert_eq!(json["childrenFolders"][0]["childCount"], 3);
        assert_eq!(json["childrenFiles"][0]["lastModifiedEpochMillis"], 1_600_000_000_000i64);
        let back: DirectoryListing = serde_json::from_value(json).unwrap();
        assert_eq!(back, listing);
    }

    #[test]
    fn unique_paths_detects_duplicates() {
        let mut listing = DirectoryListing::empty("/");
        listing.children_files.push(file("a", "/a"));
        listing.children_files.push(file("b", "/b"));
        assert!(listing.paths_are_unique());
        listing.children_files.push(file("a2", "/a"));
        assert!(!listing.paths_are_unique());
    }

    #[tokio::test]
    async fn digest_matches_bytes_and_reader() {
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let by_bytes = digest_bytes(&data);
        let mut cursor = std::io::Cursor::new(data.clone());
        let by_reader = digest_reader(&mut cursor, &BufferPool::new()).await.unwrap();
        assert_eq!(by_bytes, by_reader);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        tokio::fs::write(&path, &data).await.unwrap();
        assert_eq!(digest_file(&path).await.unwrap(), by_bytes);
    }
}
