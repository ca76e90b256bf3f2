use std::sync::{Arc, OnceLock};

use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};

use crate::asset::{Asset, AssetStatus, AssetView, CreateOutcome, ErrorKind, SqliteAssetStore, StoreError};
use crate::planner::{LadderRequest, Quality};
use crate::probe::{ProbeError, SourceHandle};
use crate::publish::asset_prefix;
use crate::storage::ObjectStore;

const ASSET_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$";

fn asset_id_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(ASSET_ID_PATTERN).expect("valid asset id pattern"))
}

pub fn is_valid_asset_id(asset_id: &str) -> bool {
    asset_id_regex().is_match(asset_id)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid asset id {asset_id:?}")]
    InvalidAssetId { asset_id: String },
    #[error("invalid source: {0}")]
    InvalidSource(#[from] ProbeError),
    #[error("requested ladder is empty")]
    EmptyLadder,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    /// Taxonomy kind, or `None` for request validation failures.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ServiceError::InvalidAssetId { .. } | ServiceError::EmptyLadder => None,
            ServiceError::InvalidSource(err) => Some(err.kind()),
            ServiceError::Store(err) => Some(err.kind()),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ServiceError::InvalidAssetId { .. }
                | ServiceError::InvalidSource(_)
                | ServiceError::EmptyLadder
        )
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Caller-facing operations over the asset store and object storage.
#[derive(Clone)]
pub struct IngestService {
    store: SqliteAssetStore,
    objects: Arc<dyn ObjectStore>,
    default_ladder: Vec<Quality>,
}

impl IngestService {
    pub fn new(
        store: SqliteAssetStore,
        objects: Arc<dyn ObjectStore>,
        default_ladder: Vec<Quality>,
    ) -> Self {
        Self {
            store,
            objects,
            default_ladder,
        }
    }

    pub fn store(&self) -> &SqliteAssetStore {
        &self.store
    }

    /// Queues a new asset. An identical submit while the asset is still
    /// QUEUED returns the existing record.
    pub fn submit(
        &self,
        asset_id: &str,
        source_handle: &str,
        ladder: Option<Vec<Quality>>,
    ) -> ServiceResult<CreateOutcome> {
        if !is_valid_asset_id(asset_id) {
            return Err(ServiceError::InvalidAssetId {
                asset_id: asset_id.to_string(),
            });
        }
        let handle = SourceHandle::new(source_handle.trim());
        handle.resolve()?;
        let ladder = match ladder {
            Some(qualities) => LadderRequest::explicit(qualities),
            None => LadderRequest::default_ladder(self.default_ladder.clone()),
        };
        if ladder.normalized().is_empty() {
            return Err(ServiceError::EmptyLadder);
        }
        let asset = Asset::new(asset_id, handle, ladder);
        Ok(self.store.create(&asset)?)
    }

    pub fn get_status(&self, asset_id: &str) -> ServiceResult<AssetView> {
        Ok(self.store.fetch(asset_id)?.view())
    }

    /// Requests cancellation. Terminal assets are returned unchanged.
    pub async fn cancel(&self, asset_id: &str) -> ServiceResult<AssetView> {
        let asset = self.store.request_cancel_async(asset_id).await?;
        if asset.status == AssetStatus::Cancelled {
            self.purge(asset_id).await;
        }
        Ok(asset.view())
    }

    /// Removes a terminal asset's record and every stored object.
    pub async fn delete(&self, asset_id: &str) -> ServiceResult<AssetView> {
        let asset = self.store.delete_async(asset_id).await?;
        let removed = self.purge(asset_id).await;
        info!(asset_id, removed, "asset purged");
        Ok(asset.view())
    }

    async fn purge(&self, asset_id: &str) -> usize {
        match self.objects.delete_prefix(&asset_prefix(asset_id)).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(asset_id, error = %err, "failed to purge asset storage");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::storage::LocalObjectStore;

    fn service(dir: &std::path::Path) -> IngestService {
        let store = SqliteAssetStore::new(dir.join("assets.db")).expect("store");
        store.initialize().expect("schema");
        let objects = LocalObjectStore::new(dir.join("storage"), None).expect("objects");
        IngestService::new(
            store,
            Arc::new(objects),
            vec![Quality::P360, Quality::P720],
        )
    }

    #[test]
    fn asset_ids_follow_the_allowed_pattern() {
        assert!(is_valid_asset_id("movie-01"));
        assert!(is_valid_asset_id("A.b_c-9"));
        assert!(!is_valid_asset_id(""));
        assert!(!is_valid_asset_id("-leading"));
        assert!(!is_valid_asset_id("has/slash"));
        assert!(!is_valid_asset_id("../escape"));
        assert!(!is_valid_asset_id(&"x".repeat(129)));
        assert!(is_valid_asset_id(&"x".repeat(128)));
    }

    #[test]
    fn submit_rejects_bad_requests() {
        let dir = tempdir().expect("tempdir");
        let service = service(dir.path());

        let err = service.submit("bad id", "/tmp/a.mp4", None).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.kind(), None);

        let err = service.submit("ok", "", None).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.kind(), Some(ErrorKind::SourceUnreadable));

        let err = service.submit("ok", "/tmp/a.mp4", Some(Vec::new())).unwrap_err();
        assert!(matches!(err, ServiceError::EmptyLadder));
    }

    #[test]
    fn submit_applies_default_ladder_and_is_idempotent_while_queued() {
        let dir = tempdir().expect("tempdir");
        let service = service(dir.path());

        let first = service.submit("a1", "/media/a.mp4", None).expect("submit");
        assert!(matches!(first, CreateOutcome::Created(_)));
        assert!(!first.asset().ladder.explicit);
        assert_eq!(first.asset().ladder.qualities, vec![Quality::P360, Quality::P720]);

        let again = service.submit("a1", "/media/a.mp4", None).expect("resubmit");
        assert!(matches!(again, CreateOutcome::Existing(_)));

        let err = service
            .submit("a1", "/media/other.mp4", None)
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::AssetAlreadyExists));
    }

    #[tokio::test]
    async fn cancel_and_delete_follow_status_rules() {
        let dir = tempdir().expect("tempdir");
        let service = service(dir.path());
        service.submit("a1", "/media/a.mp4", None).expect("submit");

        let err = service.delete("a1").await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::AssetBusy));

        let view = service.cancel("a1").await.expect("cancel");
        assert_eq!(view.status, AssetStatus::Cancelled);
        let again = service.cancel("a1").await.expect("cancel twice");
        assert_eq!(again.status, AssetStatus::Cancelled);

        service.delete("a1").await.expect("delete");
        let err = service.get_status("a1").unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::UnknownAsset));
    }
}
