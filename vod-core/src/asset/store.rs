use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::sqlite::configure_connection;

use super::models::{Asset, AssetStatus, Job, RenditionStatus, Transition};
use super::{StoreError, StoreResult};

const ASSET_SCHEMA: &str = include_str!("../../../sql/assets.sql");

const NON_TERMINAL: &str = "('QUEUED','PROBING','PLANNED','TRANSCODING','PUBLISHING')";

#[derive(Debug, Clone)]
pub struct SqliteAssetStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteAssetStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteAssetStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteAssetStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteAssetStore { path, flags })
    }
}

/// Result of registering an asset.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Asset),
    /// Identical request for an asset that is still queued.
    Existing(Asset),
}

impl CreateOutcome {
    pub fn asset(&self) -> &Asset {
        match self {
            CreateOutcome::Created(asset) | CreateOutcome::Existing(asset) => asset,
        }
    }

    pub fn into_asset(self) -> Asset {
        match self {
            CreateOutcome::Created(asset) | CreateOutcome::Existing(asset) => asset,
        }
    }
}

/// A job handed to a worker together with its lease.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub asset: Asset,
    pub job: Job,
    /// Scratch id of an earlier attempt whose lease expired.
    pub previous_job_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SqliteAssetStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteAssetStore {
    pub fn builder() -> SqliteAssetStoreBuilder {
        SqliteAssetStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteAssetStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        let conn = self.open()?;
        conn.execute_batch(ASSET_SCHEMA)?;
        Ok(())
    }

    /// Registers a new asset and its job row in one transaction.
    pub fn create(&self, asset: &Asset) -> StoreResult<CreateOutcome> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT status, fingerprint FROM assets WHERE asset_id = ?1",
                [&asset.asset_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let mut replaced = false;
        if let Some((status, fingerprint)) = existing {
            let status = parse_status(&asset.asset_id, &status)?;
            match status {
                AssetStatus::Queued if fingerprint == asset.fingerprint => {
                    let current = select_asset(&tx, &asset.asset_id)?;
                    tx.commit()?;
                    debug!(asset_id = %asset.asset_id, "identical submit while queued");
                    return Ok(CreateOutcome::Existing(current));
                }
                AssetStatus::Failed | AssetStatus::Cancelled => {
                    purge_rows(&tx, &asset.asset_id)?;
                    replaced = true;
                }
                status => {
                    return Err(StoreError::AlreadyExists {
                        asset_id: asset.asset_id.clone(),
                        status,
                    })
                }
            }
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO assets (
                asset_id, source_handle, ladder, ladder_explicit, fingerprint, status,
                error_kind, error_detail, probe, renditions, master_manifest_url,
                thumbnail_url, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'QUEUED', NULL, NULL, NULL, '[]', NULL, NULL, ?6, ?6)",
            params![
                &asset.asset_id,
                asset.source_handle.as_str(),
                serde_json::to_string(&asset.ladder.qualities)?,
                asset.ladder.explicit,
                &asset.fingerprint,
                now,
            ],
        )?;
        tx.execute(
            "INSERT INTO jobs (asset_id, job_id, worker_id, lease_expires_at, attempts, cancel_requested, created_at)
             VALUES (?1, ?2, NULL, 0, 0, 0, ?3)",
            params![&asset.asset_id, Uuid::new_v4().to_string(), now],
        )?;
        let note = if replaced { "resubmitted" } else { "submitted" };
        insert_transition(&tx, &asset.asset_id, None, AssetStatus::Queued, Some(note), now)?;
        let created = select_asset(&tx, &asset.asset_id)?;
        tx.commit()?;
        info!(asset_id = %asset.asset_id, replaced, "asset queued");
        Ok(CreateOutcome::Created(created))
    }

    pub fn find(&self, asset_id: &str) -> StoreResult<Option<Asset>> {
        let conn = self.open()?;
        let asset = conn
            .query_row(
                "SELECT * FROM assets WHERE asset_id = ?1",
                [asset_id],
                Asset::from_row,
            )
            .optional()?;
        Ok(asset)
    }

    pub fn fetch(&self, asset_id: &str) -> StoreResult<Asset> {
        self.find(asset_id)?.ok_or_else(|| StoreError::NotFound {
            asset_id: asset_id.to_string(),
        })
    }

    pub fn fetch_job(&self, asset_id: &str) -> StoreResult<Job> {
        let conn = self.open()?;
        select_job(&conn, asset_id)
    }

    pub fn list(&self, status: Option<AssetStatus>) -> StoreResult<Vec<Asset>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM assets
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at ASC, asset_id ASC",
        )?;
        let rows = stmt.query_map([status.map(|value| value.as_str())], Asset::from_row)?;
        let mut assets = Vec::new();
        for asset in rows {
            assets.push(asset?);
        }
        Ok(assets)
    }

    /// Leases the oldest unowned non-terminal job to `worker_id`.
    pub fn claim_next(&self, worker_id: &str, ttl: Duration) -> StoreResult<Option<ClaimedJob>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let candidate: Option<(String, String, i64)> = tx
            .query_row(
                &format!(
                    "SELECT j.asset_id, j.job_id, j.attempts
                     FROM jobs j JOIN assets a ON a.asset_id = j.asset_id
                     WHERE a.status IN {NON_TERMINAL}
                       AND (j.worker_id IS NULL OR j.lease_expires_at <= ?1)
                     ORDER BY a.created_at ASC, a.asset_id ASC
                     LIMIT 1"
                ),
                [now.timestamp_millis()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((asset_id, old_job_id, attempts)) = candidate else {
            tx.rollback()?;
            return Ok(None);
        };

        let previous_job_id = (attempts > 0).then_some(old_job_id);
        tx.execute(
            "UPDATE jobs
             SET job_id = ?2, worker_id = ?3, lease_expires_at = ?4, attempts = attempts + 1
             WHERE asset_id = ?1",
            params![
                &asset_id,
                Uuid::new_v4().to_string(),
                worker_id,
                lease_deadline(now, ttl),
            ],
        )?;
        let asset = select_asset(&tx, &asset_id)?;
        let job = select_job(&tx, &asset_id)?;
        tx.commit()?;
        info!(
            asset_id = %asset_id,
            worker_id,
            attempt = job.attempts,
            takeover = previous_job_id.is_some(),
            "claimed job"
        );
        Ok(Some(ClaimedJob {
            asset,
            job,
            previous_job_id,
        }))
    }

    /// Extends the lease; fails with `LeaseLost` once another worker owns it.
    pub fn renew_lease(
        &self,
        asset_id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> StoreResult<DateTime<Utc>> {
        let conn = self.open()?;
        let now = Utc::now();
        let deadline = lease_deadline(now, ttl);
        let affected = conn.execute(
            "UPDATE jobs SET lease_expires_at = ?3 WHERE asset_id = ?1 AND worker_id = ?2",
            params![asset_id, worker_id, deadline],
        )?;
        if affected == 0 {
            return Err(StoreError::LeaseLost {
                asset_id: asset_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        Ok(super::models::from_epoch_millis(deadline))
    }

    pub fn release(&self, asset_id: &str, worker_id: &str) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE jobs SET worker_id = NULL, lease_expires_at = 0
             WHERE asset_id = ?1 AND worker_id = ?2",
            params![asset_id, worker_id],
        )?;
        Ok(())
    }

    /// Compare-and-set write of the whole record. The stored status must equal
    /// `expected` and `worker_id` must own the job; a status change must be a
    /// legal edge and is appended to the transition log.
    pub fn save(
        &self,
        asset: &Asset,
        expected: AssetStatus,
        worker_id: &str,
        note: Option<&str>,
    ) -> StoreResult<Asset> {
        check_invariants(asset)?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM assets WHERE asset_id = ?1",
                [&asset.asset_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = match current {
            Some(status) => parse_status(&asset.asset_id, &status)?,
            None => {
                return Err(StoreError::NotFound {
                    asset_id: asset.asset_id.clone(),
                })
            }
        };
        if current != expected {
            return Err(StoreError::StatusConflict {
                asset_id: asset.asset_id.clone(),
                expected,
                actual: current,
            });
        }
        let job = select_job(&tx, &asset.asset_id)?;
        if job.worker_id.as_deref() != Some(worker_id) {
            return Err(StoreError::LeaseLost {
                asset_id: asset.asset_id.clone(),
                worker_id: worker_id.to_string(),
            });
        }

        let now = Utc::now();
        if asset.status != current {
            if !current.can_transition_to(asset.status) {
                return Err(StoreError::InvalidTransition {
                    asset_id: asset.asset_id.clone(),
                    from: current,
                    to: asset.status,
                });
            }
            insert_transition(&tx, &asset.asset_id, Some(current), asset.status, note, now)?;
        }

        tx.execute(
            "UPDATE assets SET
                status = ?2,
                error_kind = ?3,
                error_detail = ?4,
                probe = ?5,
                renditions = ?6,
                master_manifest_url = ?7,
                thumbnail_url = ?8,
                updated_at = ?9
             WHERE asset_id = ?1",
            params![
                &asset.asset_id,
                asset.status.as_str(),
                asset.error_kind.map(|kind| kind.as_str()),
                &asset.error_detail,
                asset.probe.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&asset.renditions)?,
                &asset.master_manifest_url,
                &asset.thumbnail_url,
                now,
            ],
        )?;
        if asset.status.is_terminal() {
            tx.execute(
                "UPDATE jobs SET worker_id = NULL, lease_expires_at = 0 WHERE asset_id = ?1",
                [&asset.asset_id],
            )?;
        }
        let saved = select_asset(&tx, &asset.asset_id)?;
        tx.commit()?;
        if asset.status != current {
            info!(
                asset_id = %asset.asset_id,
                worker_id,
                from = %current,
                to = %asset.status,
                "asset transition"
            );
        }
        Ok(saved)
    }

    /// Flags the job for cancellation. A queued asset nobody holds is
    /// cancelled on the spot; terminal assets are returned untouched.
    pub fn request_cancel(&self, asset_id: &str) -> StoreResult<Asset> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let asset = select_asset(&tx, asset_id)?;
        if asset.status.is_terminal() {
            tx.rollback()?;
            return Ok(asset);
        }
        let now = Utc::now();
        let job = select_job(&tx, asset_id)?;
        tx.execute(
            "UPDATE jobs SET cancel_requested = 1 WHERE asset_id = ?1",
            [asset_id],
        )?;
        if asset.status == AssetStatus::Queued && !job.lease_live(now) {
            tx.execute(
                "UPDATE assets SET status = 'CANCELLED', updated_at = ?2 WHERE asset_id = ?1",
                params![asset_id, now],
            )?;
            tx.execute(
                "UPDATE jobs SET worker_id = NULL, lease_expires_at = 0 WHERE asset_id = ?1",
                [asset_id],
            )?;
            insert_transition(
                &tx,
                asset_id,
                Some(AssetStatus::Queued),
                AssetStatus::Cancelled,
                Some("cancelled before claim"),
                now,
            )?;
            info!(asset_id, "queued asset cancelled");
        } else {
            info!(asset_id, status = %asset.status, "cancel requested");
        }
        let updated = select_asset(&tx, asset_id)?;
        tx.commit()?;
        Ok(updated)
    }

    pub fn is_cancel_requested(&self, asset_id: &str) -> StoreResult<bool> {
        Ok(self.fetch_job(asset_id)?.cancel_requested)
    }

    /// Removes every row for a terminal asset and returns the removed record.
    pub fn delete(&self, asset_id: &str) -> StoreResult<Asset> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let asset = select_asset(&tx, asset_id)?;
        if !asset.status.is_terminal() {
            return Err(StoreError::Busy {
                asset_id: asset_id.to_string(),
                status: asset.status,
            });
        }
        purge_rows(&tx, asset_id)?;
        tx.commit()?;
        info!(asset_id, status = %asset.status, "asset deleted");
        Ok(asset)
    }

    pub fn transitions(&self, asset_id: &str) -> StoreResult<Vec<Transition>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT status_from, status_to, note, at FROM asset_transitions
             WHERE asset_id = ?1 ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([asset_id])?;
        let mut transitions = Vec::new();
        while let Some(row) = rows.next()? {
            let from: Option<String> = row.get(0)?;
            let to: String = row.get(1)?;
            transitions.push(Transition {
                from: from
                    .map(|value| parse_status(asset_id, &value))
                    .transpose()?,
                to: parse_status(asset_id, &to)?,
                note: row.get(2)?,
                at: row.get(3)?,
            });
        }
        Ok(transitions)
    }

    pub fn count_by_status(&self) -> StoreResult<Vec<(AssetStatus, i64)>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM assets GROUP BY status ORDER BY status")?;
        let mut rows = stmt.query([])?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            counts.push((parse_status("*", &status)?, row.get(1)?));
        }
        Ok(counts)
    }
}

/// Async entry points for callers on the runtime. Each call runs the
/// synchronous operation on the blocking pool.
impl SqliteAssetStore {
    async fn blocking<T, F>(&self, operation: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(SqliteAssetStore) -> StoreResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || operation(store))
            .await
            .map_err(|err| StoreError::Io {
                source: std::io::Error::other(err),
                path: self.path.clone(),
            })?
    }

    pub async fn claim_next_async(
        &self,
        worker_id: &str,
        ttl: Duration,
    ) -> StoreResult<Option<ClaimedJob>> {
        let worker_id = worker_id.to_string();
        self.blocking(move |store| store.claim_next(&worker_id, ttl))
            .await
    }

    pub async fn renew_lease_async(
        &self,
        asset_id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> StoreResult<DateTime<Utc>> {
        let asset_id = asset_id.to_string();
        let worker_id = worker_id.to_string();
        self.blocking(move |store| store.renew_lease(&asset_id, &worker_id, ttl))
            .await
    }

    pub async fn release_async(&self, asset_id: &str, worker_id: &str) -> StoreResult<()> {
        let asset_id = asset_id.to_string();
        let worker_id = worker_id.to_string();
        self.blocking(move |store| store.release(&asset_id, &worker_id))
            .await
    }

    pub async fn save_async(
        &self,
        asset: Asset,
        expected: AssetStatus,
        worker_id: &str,
        note: Option<&str>,
    ) -> StoreResult<Asset> {
        let worker_id = worker_id.to_string();
        let note = note.map(str::to_string);
        self.blocking(move |store| store.save(&asset, expected, &worker_id, note.as_deref()))
            .await
    }

    pub async fn is_cancel_requested_async(&self, asset_id: &str) -> StoreResult<bool> {
        let asset_id = asset_id.to_string();
        self.blocking(move |store| store.is_cancel_requested(&asset_id))
            .await
    }

    pub async fn request_cancel_async(&self, asset_id: &str) -> StoreResult<Asset> {
        let asset_id = asset_id.to_string();
        self.blocking(move |store| store.request_cancel(&asset_id))
            .await
    }

    pub async fn delete_async(&self, asset_id: &str) -> StoreResult<Asset> {
        let asset_id = asset_id.to_string();
        self.blocking(move |store| store.delete(&asset_id)).await
    }
}

fn select_asset(conn: &Connection, asset_id: &str) -> StoreResult<Asset> {
    conn.query_row(
        "SELECT * FROM assets WHERE asset_id = ?1",
        [asset_id],
        Asset::from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound {
        asset_id: asset_id.to_string(),
    })
}

fn select_job(conn: &Connection, asset_id: &str) -> StoreResult<Job> {
    conn.query_row(
        "SELECT * FROM jobs WHERE asset_id = ?1",
        [asset_id],
        Job::from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound {
        asset_id: asset_id.to_string(),
    })
}

fn purge_rows(conn: &Connection, asset_id: &str) -> StoreResult<()> {
    conn.execute("DELETE FROM jobs WHERE asset_id = ?1", [asset_id])?;
    conn.execute("DELETE FROM asset_transitions WHERE asset_id = ?1", [asset_id])?;
    conn.execute("DELETE FROM assets WHERE asset_id = ?1", [asset_id])?;
    Ok(())
}

fn insert_transition(
    conn: &Connection,
    asset_id: &str,
    from: Option<AssetStatus>,
    to: AssetStatus,
    note: Option<&str>,
    at: DateTime<Utc>,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO asset_transitions (asset_id, status_from, status_to, note, at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![asset_id, from.map(|status| status.as_str()), to.as_str(), note, at],
    )?;
    Ok(())
}

fn parse_status(asset_id: &str, raw: &str) -> StoreResult<AssetStatus> {
    raw.parse().map_err(|err: String| {
        StoreError::Database(rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("asset {asset_id}: {err}").into(),
        ))
    })
}

fn check_invariants(asset: &Asset) -> StoreResult<()> {
    let reject = |reason: &str| StoreError::Rejected {
        asset_id: asset.asset_id.clone(),
        reason: reason.to_string(),
    };
    match asset.status {
        AssetStatus::Ready => {
            if asset.master_manifest_url.is_none() {
                return Err(reject("READY requires a master manifest url"));
            }
            if !asset
                .renditions
                .iter()
                .any(|rendition| rendition.status == RenditionStatus::Done)
            {
                return Err(reject("READY requires at least one DONE rendition"));
            }
        }
        AssetStatus::Failed => {
            if asset.error_kind.is_none() {
                return Err(reject("FAILED requires an error kind"));
            }
            if asset.master_manifest_url.is_some() {
                return Err(reject("FAILED must not expose a master manifest"));
            }
        }
        _ => {
            if asset.master_manifest_url.is_some() {
                return Err(reject("only READY assets expose a master manifest"));
            }
        }
    }
    Ok(())
}

fn lease_deadline(now: DateTime<Utc>, ttl: Duration) -> i64 {
    now.timestamp_millis()
        .saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}
