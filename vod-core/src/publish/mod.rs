mod manifest;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::asset::{ErrorKind, Rendition};
use crate::planner::Quality;
use crate::retry::{retry_transient, RetryPolicy};
use crate::storage::{ObjectStore, StorageError};
use crate::transcode::{RenditionOutput, PLAYLIST_NAME};

pub use manifest::{parse_master, render_master, MasterVariant, VariantEntry, MASTER_CODECS};

pub const MASTER_NAME: &str = "master.m3u8";
pub const THUMBNAIL_NAME: &str = "thumb.jpg";

const SEGMENT_UPLOAD_CONCURRENCY: usize = 4;

pub fn asset_prefix(asset_id: &str) -> String {
    format!("assets/{asset_id}/")
}

pub fn master_key(asset_id: &str) -> String {
    format!("assets/{asset_id}/{MASTER_NAME}")
}

pub fn rendition_key(asset_id: &str, label: Quality, file_name: &str) -> String {
    format!("assets/{asset_id}/{label}/{file_name}")
}

fn staging_master_key(asset_id: &str) -> String {
    format!("assets/{asset_id}/.{MASTER_NAME}.tmp")
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("upload of {key} failed: {source}")]
    Upload { key: String, source: StorageError },
    #[error("rendition {label} has no file name for {path}")]
    InvalidOutput { label: Quality, path: String },
    #[error("no rendition available to publish")]
    NothingToPublish,
    #[error("publish cancelled")]
    Cancelled,
}

impl PublishError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PublishFailed
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PublishError::Cancelled)
    }
}

pub type PublishResult<T> = std::result::Result<T, PublishError>;

/// A rendition that finished transcoding, paired with its scratch output.
#[derive(Debug, Clone)]
pub struct ReadyRendition {
    pub rendition: Rendition,
    pub output: RenditionOutput,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedRendition {
    pub label: Quality,
    pub playlist_key: String,
    pub playlist_url: String,
    pub segment_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedAsset {
    pub master_key: String,
    pub master_url: String,
    pub thumbnail_url: Option<String>,
    pub renditions: Vec<PublishedRendition>,
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub upload_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Copies rendition outputs into the object store and commits the master
/// playlist last.
#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn ObjectStore>,
    settings: PublishSettings,
}

impl Publisher {
    pub fn new(store: Arc<dyn ObjectStore>, settings: PublishSettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Uploads every ready rendition, the optional thumbnail, and finally the
    /// master. A failed or cancelled publish may leave partial uploads; the
    /// caller purges them with [`Publisher::purge`] once it knows it still
    /// owns the asset.
    pub async fn publish(
        &self,
        asset_id: &str,
        ready: &[ReadyRendition],
        thumbnail: Option<&Path>,
        cancel: &CancellationToken,
    ) -> PublishResult<PublishedAsset> {
        match self.publish_all(asset_id, ready, thumbnail, cancel).await {
            Ok(published) => {
                info!(
                    asset_id,
                    renditions = published.renditions.len(),
                    master = %published.master_url,
                    "published master manifest"
                );
                Ok(published)
            }
            Err(err) => {
                warn!(asset_id, error = %err, "publish aborted");
                Err(err)
            }
        }
    }

    async fn publish_all(
        &self,
        asset_id: &str,
        ready: &[ReadyRendition],
        thumbnail: Option<&Path>,
        cancel: &CancellationToken,
    ) -> PublishResult<PublishedAsset> {
        if ready.is_empty() {
            return Err(PublishError::NothingToPublish);
        }

        let mut renditions = Vec::with_capacity(ready.len());
        for item in ready {
            let label = item.rendition.label;
            let uploads = item
                .output
                .segments
                .iter()
                .map(|segment| {
                    let file_name = segment
                        .file_name()
                        .and_then(|name| name.to_str())
                        .ok_or_else(|| PublishError::InvalidOutput {
                            label,
                            path: segment.display().to_string(),
                        })?;
                    Ok((rendition_key(asset_id, label, file_name), segment.as_path()))
                })
                .collect::<PublishResult<Vec<_>>>()?;
            // Every upload in a batch settles before the first error is returned.
            for batch in uploads.chunks(SEGMENT_UPLOAD_CONCURRENCY) {
                let mut pending = Vec::with_capacity(batch.len());
                for (key, path) in batch {
                    pending.push(self.upload_file(key, path, cancel));
                }
                join_all(pending)
                    .await
                    .into_iter()
                    .collect::<PublishResult<Vec<()>>>()?;
            }
            // The playlist goes after its segments so it never names a missing file.
            let playlist_key = rendition_key(asset_id, label, PLAYLIST_NAME);
            self.upload_file(&playlist_key, &item.output.playlist, cancel)
                .await?;
            renditions.push(PublishedRendition {
                label,
                playlist_url: self.store.url_for(&playlist_key),
                playlist_key,
                segment_count: item.output.segment_count(),
            });
        }

        let mut thumbnail_url = None;
        if let Some(path) = thumbnail {
            let key = format!("{}{THUMBNAIL_NAME}", asset_prefix(asset_id));
            match self.upload_file(&key, path, cancel).await {
                Ok(()) => thumbnail_url = Some(self.store.url_for(&key)),
                Err(PublishError::Cancelled) => return Err(PublishError::Cancelled),
                Err(err) => warn!(asset_id, error = %err, "thumbnail upload failed; continuing"),
            }
        }

        let entries: Vec<VariantEntry> = ready
            .iter()
            .map(|item| VariantEntry {
                label: item.rendition.label,
                bandwidth: item.rendition.bandwidth,
                width: item.rendition.width,
                height: item.rendition.height,
            })
            .collect();
        let master = render_master(&entries);
        let staging_key = staging_master_key(asset_id);
        let master_key = master_key(asset_id);
        self.upload_bytes(&staging_key, master.into_bytes(), cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }
        self.store
            .rename(&staging_key, &master_key)
            .await
            .map_err(|source| PublishError::Upload {
                key: master_key.clone(),
                source,
            })?;

        Ok(PublishedAsset {
            master_url: self.store.url_for(&master_key),
            master_key,
            thumbnail_url,
            renditions,
        })
    }

    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> PublishResult<()> {
        self.with_retry(key, cancel, || async move {
            debug!(key, path = %path.display(), "uploading");
            self.store.put_file(key, path).await
        })
        .await
    }

    async fn upload_bytes(
        &self,
        key: &str,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
    ) -> PublishResult<()> {
        self.with_retry(key, cancel, || {
            let bytes = bytes.clone();
            async move { self.store.put_bytes(key, bytes).await }
        })
        .await
    }

    async fn with_retry<F, Fut>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> PublishResult<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), StorageError>>,
    {
        if cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }
        let limit = self.settings.upload_timeout;
        let result = retry_transient(
            &self.settings.retry,
            "upload",
            cancel,
            StorageError::is_transient,
            || {
                let attempt = operation();
                async move {
                    match timeout(limit, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(StorageError::Timeout {
                            key: key.to_string(),
                            timeout: limit,
                        }),
                    }
                }
            },
        )
        .await;
        if cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }
        result.map_err(|source| PublishError::Upload {
            key: key.to_string(),
            source,
        })
    }

    /// Removes every object under the asset prefix. Failures are logged.
    pub async fn purge(&self, asset_id: &str) -> usize {
        match self.store.delete_prefix(&asset_prefix(asset_id)).await {
            Ok(removed) => {
                if removed > 0 {
                    debug!(asset_id, removed, "purged asset storage");
                }
                removed
            }
            Err(err) => {
                warn!(asset_id, error = %err, "failed to purge asset storage");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::storage::{LocalObjectStore, StorageResult};

    /// Delegates to a local store but fails one key a fixed number of times.
    struct FlakyStore {
        inner: LocalObjectStore,
        failing_key_suffix: &'static str,
        failures_left: AtomicU32,
        transient: bool,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put_file(&self, key: &str, source: &Path) -> StorageResult<()> {
            if key.ends_with(self.failing_key_suffix)
                && self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                    .is_ok()
            {
                let kind = if self.transient {
                    std::io::ErrorKind::TimedOut
                } else {
                    std::io::ErrorKind::PermissionDenied
                };
                return Err(StorageError::Io {
                    source: std::io::Error::new(kind, "injected"),
                    path: source.to_path_buf(),
                });
            }
            self.inner.put_file(key, source).await
        }
        async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()> {
            self.inner.put_bytes(key, bytes).await
        }
        async fn get_bytes(&self, key: &str) -> StorageResult<Vec<u8>> {
            self.inner.get_bytes(key).await
        }
        async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
            self.inner.rename(from, to).await
        }
        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }
        async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
            self.inner.delete_prefix(prefix).await
        }
        async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
            self.inner.list(prefix).await
        }
        async fn exists(&self, key: &str) -> StorageResult<bool> {
            self.inner.exists(key).await
        }
        fn url_for(&self, key: &str) -> String {
            self.inner.url_for(key)
        }
    }

    fn settings() -> PublishSettings {
        PublishSettings {
            upload_timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(2, Duration::ZERO, Duration::ZERO),
        }
    }

    fn ready_rendition(scratch: &Path, label: Quality, segments: usize) -> ReadyRendition {
        let dir = scratch.join(label.label());
        std::fs::create_dir_all(&dir).unwrap();
        let mut playlist = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:6\n");
        let mut paths = Vec::new();
        for index in 0..segments {
            let name = format!("segment_{index:03}.ts");
            std::fs::write(dir.join(&name), b"ts").unwrap();
            playlist.push_str(&format!("#EXTINF:6.0,\n{name}\n"));
            paths.push(dir.join(name));
        }
        playlist.push_str("#EXT-X-ENDLIST\n");
        std::fs::write(dir.join(PLAYLIST_NAME), playlist).unwrap();

        let target = label.target();
        let mut rendition = Rendition::skipped(label, 0);
        rendition.status = crate::asset::RenditionStatus::Done;
        rendition.bandwidth = (target.video_kbps + target.audio_kbps) * 1_100;
        rendition.failure = None;
        ReadyRendition {
            rendition,
            output: RenditionOutput {
                label,
                dir: dir.clone(),
                playlist: dir.join(PLAYLIST_NAME),
                segments: paths,
                avg_segment_seconds: 6.0,
            },
        }
    }

    #[tokio::test]
    async fn publishes_layout_and_commits_master() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path().join("storage"), None).unwrap());
        let publisher = Publisher::new(store.clone(), settings());
        let scratch = dir.path().join("scratch");
        let ready = vec![
            ready_rendition(&scratch, Quality::P720, 2),
            ready_rendition(&scratch, Quality::P360, 3),
        ];
        let thumb = scratch.join("thumb.jpg");
        std::fs::write(&thumb, b"jpeg").unwrap();

        let published = publisher
            .publish("a1", &ready, Some(&thumb), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(published.master_key, "assets/a1/master.m3u8");
        assert!(published.thumbnail_url.is_some());

        let keys = store.list("assets/a1/").await.unwrap();
        assert!(keys.contains(&"assets/a1/360p/segment_002.ts".to_string()));
        assert!(keys.contains(&"assets/a1/720p/playlist.m3u8".to_string()));
        assert!(keys.contains(&"assets/a1/thumb.jpg".to_string()));
        assert!(!keys.iter().any(|key| key.ends_with(".tmp")));

        let master = String::from_utf8(store.get_bytes("assets/a1/master.m3u8").await.unwrap()).unwrap();
        let variants = parse_master(&master).unwrap();
        let uris: Vec<_> = variants.iter().map(|v| v.uri.as_str()).collect();
        assert_eq!(uris, vec!["360p/playlist.m3u8", "720p/playlist.m3u8"]);
    }

    #[tokio::test]
    async fn transient_upload_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore {
            inner: LocalObjectStore::new(dir.path().join("storage"), None).unwrap(),
            failing_key_suffix: "segment_000.ts",
            failures_left: AtomicU32::new(2),
            transient: true,
        });
        let publisher = Publisher::new(store.clone(), settings());
        let ready = vec![ready_rendition(&dir.path().join("scratch"), Quality::P360, 1)];
        publisher
            .publish("a2", &ready, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(store.exists("assets/a2/master.m3u8").await.unwrap());
    }

    #[tokio::test]
    async fn permanent_failure_leaves_purge_to_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore {
            inner: LocalObjectStore::new(dir.path().join("storage"), None).unwrap(),
            failing_key_suffix: "720p/segment_001.ts",
            failures_left: AtomicU32::new(1),
            transient: false,
        });
        let publisher = Publisher::new(store.clone(), settings());
        let scratch = dir.path().join("scratch");
        let ready = vec![
            ready_rendition(&scratch, Quality::P360, 2),
            ready_rendition(&scratch, Quality::P720, 2),
        ];
        let err = publisher
            .publish("a3", &ready, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Upload { .. }));
        assert_eq!(err.kind(), ErrorKind::PublishFailed);
        let keys = store.list("assets/a3/").await.unwrap();
        assert!(!keys.contains(&"assets/a3/master.m3u8".to_string()));
        assert!(!keys.contains(&"assets/a3/720p/playlist.m3u8".to_string()));

        assert!(publisher.purge("a3").await > 0);
        assert!(store.list("assets/a3/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path().join("storage"), None).unwrap());
        let publisher = Publisher::new(store.clone(), settings());
        let ready = vec![ready_rendition(&dir.path().join("scratch"), Quality::P360, 1)];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = publisher.publish("a4", &ready, None, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(store.list("assets/a4/").await.unwrap().is_empty());
    }
}
