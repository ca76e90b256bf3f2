mod error;
mod models;
mod store;

pub use error::{StoreError, StoreResult};
pub use models::{
    bounded_detail, Asset, AssetStatus, AssetView, ErrorKind, Job, PlaybackView, Rendition,
    RenditionStatus, RenditionView, Transition, MAX_ERROR_DETAIL_BYTES,
};
pub use store::{ClaimedJob, CreateOutcome, SqliteAssetStore, SqliteAssetStoreBuilder};
