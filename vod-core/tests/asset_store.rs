use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use vod_core::asset::{
    Asset, AssetStatus, CreateOutcome, ErrorKind, Rendition, RenditionStatus, SqliteAssetStore,
    StoreError,
};
use vod_core::planner::{LadderRequest, Quality};
use vod_core::probe::SourceHandle;

const LEASE: Duration = Duration::from_secs(300);

fn setup_store() -> (TempDir, SqliteAssetStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteAssetStore::builder()
        .path(dir.path().join("data/assets.sqlite"))
        .create_if_missing(true)
        .build()
        .unwrap();
    store.initialize().unwrap();
    (dir, store)
}

fn new_asset(asset_id: &str, source: &str) -> Asset {
    Asset::new(
        asset_id,
        SourceHandle::new(source),
        LadderRequest::explicit(vec![Quality::P360, Quality::P720]),
    )
}

fn done_rendition() -> Rendition {
    let mut rendition = Rendition::skipped(Quality::P360, 1080);
    rendition.status = RenditionStatus::Done;
    rendition.failure = None;
    rendition
}

#[test]
fn claim_and_compare_and_set_transitions() {
    let (_dir, store) = setup_store();
    store.create(&new_asset("a1", "/media/a.mp4")).unwrap();

    let claimed = store.claim_next("w1", LEASE).unwrap().unwrap();
    assert_eq!(claimed.asset.asset_id, "a1");
    assert!(claimed.previous_job_id.is_none());
    assert_eq!(claimed.job.attempts, 1);
    assert!(store.claim_next("w2", LEASE).unwrap().is_none());

    let mut asset = claimed.asset.clone();
    asset.status = AssetStatus::Probing;
    let saved = store
        .save(&asset, AssetStatus::Queued, "w1", Some("probing"))
        .unwrap();
    assert_eq!(saved.status, AssetStatus::Probing);

    // stale expectation
    let err = store
        .save(&asset, AssetStatus::Queued, "w1", None)
        .unwrap_err();
    assert!(matches!(err, StoreError::StatusConflict { .. }));

    // not the lease owner
    asset.status = AssetStatus::Planned;
    let err = store
        .save(&asset, AssetStatus::Probing, "w2", None)
        .unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost { .. }));

    // skipping stages is illegal
    asset.status = AssetStatus::Publishing;
    let err = store
        .save(&asset, AssetStatus::Probing, "w1", None)
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));

    let transitions = store.transitions("a1").unwrap();
    let path: Vec<_> = transitions.iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        path,
        vec![
            (None, AssetStatus::Queued),
            (Some(AssetStatus::Queued), AssetStatus::Probing),
        ]
    );
}

#[test]
fn ready_requires_master_and_a_done_rendition() {
    let (_dir, store) = setup_store();
    store.create(&new_asset("a1", "/media/a.mp4")).unwrap();
    let mut asset = store.claim_next("w1", LEASE).unwrap().unwrap().asset;

    for (from, to) in [
        (AssetStatus::Queued, AssetStatus::Probing),
        (AssetStatus::Probing, AssetStatus::Planned),
        (AssetStatus::Planned, AssetStatus::Transcoding),
        (AssetStatus::Transcoding, AssetStatus::Publishing),
    ] {
        asset.status = to;
        asset = store.save(&asset, from, "w1", None).unwrap();
    }

    asset.status = AssetStatus::Ready;
    let err = store
        .save(&asset, AssetStatus::Publishing, "w1", None)
        .unwrap_err();
    assert!(matches!(err, StoreError::Rejected { .. }));

    asset.renditions = vec![done_rendition()];
    asset.master_manifest_url = Some("file:///tmp/assets/a1/master.m3u8".into());
    let err = store
        .save(&asset, AssetStatus::Transcoding, "w1", None)
        .unwrap_err();
    assert!(matches!(err, StoreError::StatusConflict { .. }));

    let ready = store
        .save(&asset, AssetStatus::Publishing, "w1", Some("published"))
        .unwrap();
    assert_eq!(ready.status, AssetStatus::Ready);
    assert!(ready.view().playback.is_some());

    // terminal save clears the lease
    let job = store.fetch_job("a1").unwrap();
    assert!(job.worker_id.is_none());
    assert!(store.claim_next("w2", LEASE).unwrap().is_none());
}

#[test]
fn expired_lease_is_taken_over() {
    let (_dir, store) = setup_store();
    store.create(&new_asset("a1", "/media/a.mp4")).unwrap();

    let first = store.claim_next("w1", Duration::ZERO).unwrap().unwrap();
    thread::sleep(Duration::from_millis(10));

    let second = store.claim_next("w2", LEASE).unwrap().unwrap();
    assert_eq!(second.previous_job_id.as_deref(), Some(first.job.job_id.as_str()));
    assert_ne!(second.job.job_id, first.job.job_id);
    assert_eq!(second.job.attempts, 2);

    let err = store.renew_lease("a1", "w1", LEASE).unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost { .. }));
    store.renew_lease("a1", "w2", LEASE).unwrap();

    let mut asset = first.asset;
    asset.status = AssetStatus::Probing;
    let err = store
        .save(&asset, AssetStatus::Queued, "w1", None)
        .unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost { .. }));

    // releasing someone else's lease is a no-op
    store.release("a1", "w1").unwrap();
    assert_eq!(store.fetch_job("a1").unwrap().worker_id.as_deref(), Some("w2"));
}

#[test]
fn concurrent_submits_admit_exactly_one() {
    let (_dir, store) = setup_store();
    let handles: Vec<_> = (0..8)
        .map(|idx| {
            let store = store.clone();
            thread::spawn(move || store.create(&new_asset("shared", &format!("/media/{idx}.mp4"))))
        })
        .collect();

    let mut created = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(CreateOutcome::Created(_)) => created += 1,
            Err(err) => {
                assert_eq!(err.kind(), ErrorKind::AssetAlreadyExists);
                rejected += 1;
            }
            Ok(CreateOutcome::Existing(_)) => panic!("sources differ"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(rejected, 7);
}

#[test]
fn identical_submit_while_queued_returns_existing() {
    let (_dir, store) = setup_store();
    let first = store.create(&new_asset("a1", "/media/a.mp4")).unwrap();
    let second = store.create(&new_asset("a1", "/media/a.mp4")).unwrap();
    assert!(matches!(second, CreateOutcome::Existing(_)));
    assert_eq!(first.asset().created_at, second.asset().created_at);
    assert_eq!(store.transitions("a1").unwrap().len(), 1);

    store.claim_next("w1", LEASE).unwrap().unwrap();
    let mut asset = store.fetch("a1").unwrap();
    asset.status = AssetStatus::Probing;
    store.save(&asset, AssetStatus::Queued, "w1", None).unwrap();
    let err = store.create(&new_asset("a1", "/media/a.mp4")).unwrap_err();
    assert!(matches!(
        err,
        StoreError::AlreadyExists {
            status: AssetStatus::Probing,
            ..
        }
    ));
}

#[test]
fn cancel_rules_depend_on_lease_and_status() {
    let (_dir, store) = setup_store();

    store.create(&new_asset("idle", "/media/a.mp4")).unwrap();
    let cancelled = store.request_cancel("idle").unwrap();
    assert_eq!(cancelled.status, AssetStatus::Cancelled);
    assert_eq!(store.request_cancel("idle").unwrap().status, AssetStatus::Cancelled);

    store.create(&new_asset("busy", "/media/b.mp4")).unwrap();
    store.claim_next("w1", LEASE).unwrap().unwrap();
    let flagged = store.request_cancel("busy").unwrap();
    assert_eq!(flagged.status, AssetStatus::Queued);
    assert!(store.is_cancel_requested("busy").unwrap());

    let err = store.request_cancel("missing").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownAsset);
}

#[test]
fn failed_assets_can_be_resubmitted_and_deleted() {
    let (_dir, store) = setup_store();
    store.create(&new_asset("a1", "/media/a.mp4")).unwrap();
    let mut asset = store.claim_next("w1", LEASE).unwrap().unwrap().asset;

    let err = store.delete("a1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AssetBusy);

    asset.status = AssetStatus::Failed;
    let err = store
        .save(&asset, AssetStatus::Queued, "w1", None)
        .unwrap_err();
    assert!(matches!(err, StoreError::Rejected { .. }));

    asset.record_failure(ErrorKind::NoVideoStream, "no video stream");
    let failed = store
        .save(&asset, AssetStatus::Queued, "w1", Some("NoVideoStream"))
        .unwrap();
    assert_eq!(failed.error_kind, Some(ErrorKind::NoVideoStream));

    let replaced = store.create(&new_asset("a1", "/media/fixed.mp4")).unwrap();
    assert!(matches!(replaced, CreateOutcome::Created(_)));
    assert_eq!(replaced.asset().status, AssetStatus::Queued);
    assert!(replaced.asset().error_kind.is_none());
    let transitions = store.transitions("a1").unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].note.as_deref(), Some("resubmitted"));

    store.request_cancel("a1").unwrap();
    let removed = store.delete("a1").unwrap();
    assert_eq!(removed.status, AssetStatus::Cancelled);
    assert!(store.find("a1").unwrap().is_none());
    assert!(store.transitions("a1").unwrap().is_empty());
}

#[test]
fn list_and_counts_reflect_statuses() {
    let (_dir, store) = setup_store();
    store.create(&new_asset("a1", "/media/a.mp4")).unwrap();
    store.create(&new_asset("a2", "/media/b.mp4")).unwrap();
    store.request_cancel("a2").unwrap();

    assert_eq!(store.list(None).unwrap().len(), 2);
    let queued = store.list(Some(AssetStatus::Queued)).unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].asset_id, "a1");

    let counts = store.count_by_status().unwrap();
    assert!(counts.contains(&(AssetStatus::Queued, 1)));
    assert!(counts.contains(&(AssetStatus::Cancelled, 1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_entry_points_run_on_the_blocking_pool() {
    let (_dir, store) = setup_store();
    store.create(&new_asset("a1", "/media/a.mp4")).unwrap();

    let claimed = store.claim_next_async("w1", LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.asset.asset_id, "a1");
    assert!(store.claim_next_async("w2", LEASE).await.unwrap().is_none());
    assert!(!store.is_cancel_requested_async("a1").await.unwrap());

    let mut asset = claimed.asset;
    asset.status = AssetStatus::Probing;
    let saved = store
        .save_async(asset.clone(), AssetStatus::Queued, "w1", Some("probing"))
        .await
        .unwrap();
    assert_eq!(saved.status, AssetStatus::Probing);

    let err = store.renew_lease_async("a1", "w2", LEASE).await.unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost { .. }));
    store.renew_lease_async("a1", "w1", LEASE).await.unwrap();

    // a leased asset only gets the flag; the owner settles it
    let flagged = store.request_cancel_async("a1").await.unwrap();
    assert_eq!(flagged.status, AssetStatus::Probing);
    assert!(store.is_cancel_requested_async("a1").await.unwrap());

    store.release_async("a1", "w1").await.unwrap();
    assert!(store.fetch_job("a1").unwrap().worker_id.is_none());
}
