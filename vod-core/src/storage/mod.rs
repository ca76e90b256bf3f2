use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use url::Url;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::StorageSection;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        source: io::Error,
        path: PathBuf,
    },
    #[error("invalid object key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("object {key} not found")]
    NotFound { key: String },
    #[error("operation on {key} timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },
}

impl StorageError {
    /// Failures a retry can plausibly fix.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Timeout { .. } => true,
            StorageError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Minimal object-store surface used by the publisher. Keys are relative,
/// `/`-separated paths such as `assets/a1/720p/segment_000.ts`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_file(&self, key: &str, source: &Path) -> StorageResult<()>;
    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()>;
    async fn get_bytes(&self, key: &str) -> StorageResult<Vec<u8>>;
    /// Moves an object; the destination becomes visible in one step.
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;
    /// Removes every key under `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize>;
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
    async fn exists(&self, key: &str) -> StorageResult<bool>;
    fn url_for(&self, key: &str) -> String;
}

/// Filesystem-backed store rooted at `storage_root`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>, public_base_url: Option<String>) -> StorageResult<Self> {
        let root = root.as_ref();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|source| StorageError::Io {
                    source,
                    path: root.to_path_buf(),
                })?
                .join(root)
        };
        std::fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            source,
            path: root.clone(),
        })?;
        Ok(Self {
            root,
            public_base_url: public_base_url.filter(|base| !base.trim().is_empty()),
        })
    }

    pub fn from_config(root: impl AsRef<Path>, section: &StorageSection) -> StorageResult<Self> {
        Self::new(root, section.public_base_url.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key onto the filesystem, rejecting anything that would escape
    /// the root.
    pub fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        let invalid = |reason: &str| StorageError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = key.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(invalid("empty key"));
        }
        if trimmed.starts_with('/') || trimmed.contains('\\') {
            return Err(invalid("keys are relative and use '/' separators"));
        }
        let relative = Path::new(trimmed);
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(invalid("parent or root components are not allowed"));
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        Ok(())
    }

    fn staging_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(format!(".part-{}", Uuid::new_v4().simple()));
        path.with_file_name(name)
    }

    async fn commit_staged(staged: &Path, target: &Path) -> StorageResult<()> {
        if let Err(source) = fs::rename(staged, target).await {
            let _ = fs::remove_file(staged).await;
            return Err(StorageError::Io {
                source,
                path: target.to_path_buf(),
            });
        }
        Ok(())
    }

    fn walk_files(&self, dir: PathBuf) -> StorageResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(false) {
            let entry = entry.map_err(|err| {
                let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| dir.clone());
                StorageError::Io {
                    source: err
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk failed")),
                    path,
                }
            })?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().to_string())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_file(&self, key: &str, source: &Path) -> StorageResult<()> {
        let target = self.path_for(key)?;
        Self::ensure_parent(&target).await?;
        let staged = Self::staging_path(&target);
        fs::copy(source, &staged)
            .await
            .map_err(|err| StorageError::Io {
                source: err,
                path: source.to_path_buf(),
            })?;
        Self::commit_staged(&staged, &target).await?;
        debug!(key, "stored object");
        Ok(())
    }

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()> {
        let target = self.path_for(key)?;
        Self::ensure_parent(&target).await?;
        let staged = Self::staging_path(&target);
        fs::write(&staged, bytes)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: staged.clone(),
            })?;
        Self::commit_staged(&staged, &target).await?;
        debug!(key, "stored object");
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(source) => Err(StorageError::Io { source, path }),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let source = self.path_for(from)?;
        let target = self.path_for(to)?;
        Self::ensure_parent(&target).await?;
        match fs::rename(&source, &target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: from.to_string(),
            }),
            Err(err) => Err(StorageError::Io {
                source: err,
                path: target,
            }),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { source, path }),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let path = self.path_for(prefix)?;
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(StorageError::Io { source, path }),
        };
        if metadata.is_file() {
            self.delete(prefix).await?;
            return Ok(1);
        }
        let files = self.walk_files(path.clone())?;
        fs::remove_dir_all(&path)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: path.clone(),
            })?;
        debug!(prefix, removed = files.len(), "deleted prefix");
        Ok(files.len())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let path = self.path_for(prefix)?;
        if fs::metadata(&path).await.is_err() {
            return Ok(Vec::new());
        }
        let mut keys: Vec<String> = self
            .walk_files(path)?
            .iter()
            .filter_map(|file| self.key_for(file))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StorageError::Io { source, path }),
        }
    }

    fn url_for(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => {
                let path = self.root.join(key);
                Url::from_file_path(&path)
                    .map(|url| url.to_string())
                    .unwrap_or_else(|_| format!("file://{}", path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().join("storage"), None).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_list_and_delete_prefix() {
        let (_dir, store) = store();
        store
            .put_bytes("assets/a1/360p/playlist.m3u8", b"#EXTM3U\n".to_vec())
            .await
            .unwrap();
        store
            .put_bytes("assets/a1/360p/segment_000.ts", vec![0u8; 16])
            .await
            .unwrap();
        store
            .put_bytes("assets/a2/master.m3u8", b"#EXTM3U\n".to_vec())
            .await
            .unwrap();

        let keys = store.list("assets/a1/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "assets/a1/360p/playlist.m3u8".to_string(),
                "assets/a1/360p/segment_000.ts".to_string()
            ]
        );
        assert_eq!(store.delete_prefix("assets/a1/").await.unwrap(), 2);
        assert!(store.list("assets/a1/").await.unwrap().is_empty());
        assert!(store.exists("assets/a2/master.m3u8").await.unwrap());
        assert_eq!(store.delete_prefix("assets/missing/").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rename_commits_under_new_key() {
        let (dir, store) = store();
        let source = dir.path().join("thumb.jpg");
        std::fs::write(&source, b"jpeg").unwrap();
        store.put_file("assets/a1/.master.tmp", &source).await.unwrap();
        store
            .rename("assets/a1/.master.tmp", "assets/a1/master.m3u8")
            .await
            .unwrap();
        assert!(!store.exists("assets/a1/.master.tmp").await.unwrap());
        assert_eq!(store.get_bytes("assets/a1/master.m3u8").await.unwrap(), b"jpeg");
        assert!(matches!(
            store.rename("assets/a1/nope", "assets/a1/x").await,
            Err(StorageError::NotFound { .. })
        ));
        store.delete("assets/a1/never-written").await.unwrap();
    }

    #[test]
    fn keys_cannot_escape_root() {
        let (_dir, store) = store();
        for key in ["", "/etc/passwd", "assets/../../x", "assets\\a1", "./assets"] {
            assert!(
                matches!(store.path_for(key), Err(StorageError::InvalidKey { .. })),
                "{key} accepted"
            );
        }
        assert!(store.path_for("assets/a1/master.m3u8").is_ok());
    }

    #[test]
    fn urls_use_public_base_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            LocalObjectStore::new(dir.path(), Some("https://cdn.example/vod/".into())).unwrap();
        assert_eq!(
            store.url_for("assets/a1/master.m3u8"),
            "https://cdn.example/vod/assets/a1/master.m3u8"
        );
        let local = LocalObjectStore::new(dir.path(), None).unwrap();
        assert!(local.url_for("assets/a1/master.m3u8").starts_with("file://"));
    }
}
