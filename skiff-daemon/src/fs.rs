//! Filesystem collaborator: answers directory listings and range reads
//! for the share root, with remote paths confined to that root.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use skiff_core::control::DirectoryProvider;
use skiff_core::model::{DirectoryListing, FileMeta, FolderMeta};
use skiff_core::transfer::ContentSource;

#[derive(Debug, Clone)]
pub struct ShareRoot {
    root: PathBuf,
}

impl ShareRoot {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Map a remote path such as `/music/albums` onto the share root.
    /// Parent components and absolute escapes are refused.
    fn resolve(&self, remote: &str) -> std::io::Result<PathBuf> {
        let mut out = self.root.clone();
        for component in Path::new(remote.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        format!("path escapes share root: {remote}"),
                    ))
                }
            }
        }
        Ok(out)
    }
}

fn modified_epoch_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn child_path(remote_dir: &str, name: &str) -> String {
    let base = remote_dir.trim_end_matches('/');
    format!("{base}/{name}")
}

impl DirectoryProvider for ShareRoot {
    async fn list(&self, path: &str) -> std::io::Result<DirectoryListing> {
        let local = self.resolve(path)?;
        let mut entries = tokio::fs::read_dir(&local).await?;
        let mut listing = DirectoryListing::empty(path);
        while let Some(entry) = entries.next_entry().await? {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                // Non-UTF-8 names cannot travel in the listing document.
                Err(_) => continue,
            };
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let modified = modified_epoch_millis(&metadata);
            if metadata.is_dir() {
                let child_count = count_children(&entry.path()).await;
                listing.children_folders.push(FolderMeta {
                    path: child_path(path, &name),
                    name,
                    child_count,
                    last_modified_epoch_millis: modified,
                });
            } else if metadata.is_file() {
                listing.children_files.push(FileMeta {
                    path: child_path(path, &name),
                    name,
                    size: metadata.len(),
                    last_modified_epoch_millis: modified,
                });
            }
        }
        listing.children_folders.sort_by(|a, b| a.name.cmp(&b.name));
        listing.children_files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }
}

async fn count_children(dir: &Path) -> u64 {
    let mut count = 0u64;
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(_)) = entries.next_entry().await {
            count += 1;
        }
    }
    count
}

impl ContentSource for ShareRoot {
    async fn read_at(&self, path: &str, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let local = self.resolve(path)?;
        let mut file = tokio::fs::File::open(local).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sample_root() -> (tempfile::TempDir, ShareRoot) {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("music")).await.unwrap();
        tokio::fs::write(dir.path().join("music/track.flac"), b"flac bytes")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"hello").await.unwrap();
        let root = ShareRoot::new(dir.path().to_path_buf());
        (dir, root)
    }

    #[tokio::test]
    async fn lists_folders_and_files_with_protocol_paths() {
        let (_dir, root) = sample_root().await;
        let listing = root.list("/").await.unwrap();
        assert_eq!(listing.path, "/");
        assert_eq!(listing.children_folders.len(), 1);
        assert_eq!(listing.children_folders[0].name, "music");
        assert_eq!(listing.children_folders[0].path, "/music");
        assert_eq!(listing.children_folders[0].child_count, 1);
        assert_eq!(listing.children_files.len(), 1);
        assert_eq!(listing.children_files[0].name, "notes.txt");
        assert_eq!(listing.children_files[0].size, 5);

        let nested = root.list("/music").await.unwrap();
        assert_eq!(nested.children_files[0].path, "/music/track.flac");
    }

    #[tokio::test]
    async fn parent_components_are_refused() {
        let (_dir, root) = sample_root().await;
        let listing = root.list("/../..").await;
        assert_eq!(
            listing.unwrap_err().kind(),
            std::io::ErrorKind::PermissionDenied
        );
        let read = root.read_at("/../etc/passwd", 0, &mut [0u8; 16]).await;
        assert_eq!(read.unwrap_err().kind(), std::io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let (_dir, root) = sample_root().await;
        assert!(root.list("/no/such/dir").await.is_err());
    }

    #[tokio::test]
    async fn read_at_returns_bytes_from_offset() {
        let (_dir, root) = sample_root().await;
        let mut buf = [0u8; 16];
        let n = root.read_at("/notes.txt", 2, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"llo");
        let n = root.read_at("/notes.txt", 5, &mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
