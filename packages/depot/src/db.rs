// SQLite metadata database
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{DepotError, Result};
use crate::hash::Digest;
use crate::models::{
    to_millis, FileRecord, FileRecordRow, FileState, NewFileRecord, ObjectState, Page,
    StoreStats, StoredObject, StoredObjectRow,
};
use crate::storage::ObjectKey;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS stored_objects (
    digest      TEXT PRIMARY KEY,
    size        INTEGER NOT NULL CHECK (size >= 0),
    storage_key TEXT NOT NULL,
    ref_count   INTEGER NOT NULL DEFAULT 0 CHECK (ref_count >= 0),
    state       TEXT NOT NULL,
    claimed_by  TEXT,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    released_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_stored_objects_reclaim
    ON stored_objects(state, ref_count, released_at);

CREATE TABLE IF NOT EXISTS file_records (
    id          TEXT PRIMARY KEY,
    filename    TEXT,
    digest      TEXT NOT NULL,
    size        INTEGER NOT NULL CHECK (size >= 0),
    mime_type   TEXT NOT NULL,
    storage_key TEXT NOT NULL,
    state       TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    deleted_at  INTEGER
);

CREATE INDEX IF NOT EXISTS idx_file_records_digest ON file_records(digest);
CREATE INDEX IF NOT EXISTS idx_file_records_state_created ON file_records(state, created_at);
"#;

/// Result of trying to take the write claim on a digest
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Caller must write the physical object, then commit
    Claimed { took_over: bool },
    /// Object already stored; dedup path
    Existing(StoredObject),
    /// Another upload is writing it, or the reclaimer is removing it
    Busy(ObjectState),
    /// Same digest recorded with a different size
    SizeMismatch { stored: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed { record: FileRecord, ref_count: u64 },
    /// Object row no longer committable (reclaimed or claim lost)
    ObjectUnavailable,
    /// Pending record vanished (expired by the sweep)
    RecordMissing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    Deleted { record: FileRecord, ref_count: u64 },
    AlreadyDeleted(FileRecord),
    Pending,
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    Restored(FileRecord),
    NotDeleted(FileRecord),
    ObjectGone,
    NotFound,
}

/// Metadata database wrapper
///
/// All mutations go through a single-connection writer pool, so transactions
/// touching the same digest row are serialized. Reads use a separate pool.
#[derive(Clone)]
pub struct MetadataDb {
    writer: SqlitePool,
    reader: SqlitePool,
}

fn now() -> i64 {
    to_millis(Utc::now())
}

impl MetadataDb {
    /// Create or open database at path
    pub async fn new(db_path: &Path, config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let acquire_timeout = Duration::from_secs(config.acquire_timeout_secs);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(acquire_timeout)
            .connect_with(opts.clone())
            .await?;

        let db = Self {
            reader: writer.clone(),
            writer,
        };
        db.migrate().await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(config.max_read_connections)
            .acquire_timeout(acquire_timeout)
            .connect_with(opts)
            .await?;

        tracing::info!(path = %db_path.display(), "Metadata database ready");
        Ok(Self { reader, ..db })
    }

    /// Create schema if absent; safe to run repeatedly
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.writer).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.reader).await?;
        Ok(())
    }

    // --- file records ---

    /// Insert a PENDING record, reserving its identity
    pub async fn reserve_pending(&self, record: &NewFileRecord) -> Result<()> {
        let ts = now();
        let inserted = sqlx::query(
            r#"
            INSERT INTO file_records
                (id, filename, digest, size, mime_type, storage_key, state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.filename)
        .bind(record.digest.to_hex())
        .bind(record.size as i64)
        .bind(&record.mime_type)
        .bind(record.storage_key.as_str())
        .bind(FileState::Pending.as_str())
        .bind(ts)
        .bind(ts)
        .execute(&self.writer)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(DepotError::Conflict(format!(
                "file {} already exists or is being uploaded",
                record.id
            )));
        }
        Ok(())
    }

    /// Remove a PENDING record after a failed upload
    pub async fn discard_pending(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM file_records WHERE id = ? AND state = ?")
            .bind(id.to_string())
            .bind(FileState::Pending.as_str())
            .execute(&self.writer)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_record(&self, id: Uuid) -> Result<Option<FileRecord>> {
        let row: Option<FileRecordRow> = sqlx::query_as("SELECT * FROM file_records WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.reader)
            .await?;
        row.map(FileRecord::try_from).transpose()
    }

    /// ACTIVE records, newest first
    pub async fn list_active(&self, limit: u32, offset: u32) -> Result<Page<FileRecord>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_records WHERE state = ?")
            .bind(FileState::Active.as_str())
            .fetch_one(&self.reader)
            .await?;

        let rows: Vec<FileRecordRow> = sqlx::query_as(
            "SELECT * FROM file_records WHERE state = ? ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
        )
        .bind(FileState::Active.as_str())
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.reader)
        .await?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(FileRecord::try_from)
                .collect::<Result<Vec<_>>>()?,
            total: total.max(0) as u64,
            limit,
            offset,
        })
    }

    // --- stored objects ---

    pub async fn find_object(&self, digest: &Digest) -> Result<Option<StoredObject>> {
        let row: Option<StoredObjectRow> =
            sqlx::query_as("SELECT * FROM stored_objects WHERE digest = ?")
                .bind(digest.to_hex())
                .fetch_optional(&self.reader)
                .await?;
        row.map(StoredObject::try_from).transpose()
    }

    /// Dedup check and write claim in one serialized transaction
    pub async fn claim_object(
        &self,
        digest: &Digest,
        size: u64,
        key: &ObjectKey,
        upload_id: Uuid,
        claim_ttl: Duration,
    ) -> Result<ClaimOutcome> {
        let ts = now();
        let stale_before = ts - claim_ttl.as_millis() as i64;
        let mut tx = self.writer.begin().await?;

        let row: Option<StoredObjectRow> =
            sqlx::query_as("SELECT * FROM stored_objects WHERE digest = ?")
                .bind(digest.to_hex())
                .fetch_optional(&mut *tx)
                .await?;

        let outcome = match row.map(StoredObject::try_from).transpose()? {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO stored_objects
                        (digest, size, storage_key, ref_count, state, claimed_by, created_at, updated_at)
                    VALUES (?, ?, ?, 0, ?, ?, ?, ?)
                    "#,
                )
                .bind(digest.to_hex())
                .bind(size as i64)
                .bind(key.as_str())
                .bind(ObjectState::Uploading.as_str())
                .bind(upload_id.to_string())
                .bind(ts)
                .bind(ts)
                .execute(&mut *tx)
                .await?;
                ClaimOutcome::Claimed { took_over: false }
            }
            Some(existing) if existing.size != size => ClaimOutcome::SizeMismatch {
                stored: existing.size,
            },
            Some(existing) => match existing.state {
                ObjectState::Stored => ClaimOutcome::Existing(existing),
                ObjectState::Uploading if existing.claimed_by == Some(upload_id) => {
                    ClaimOutcome::Claimed { took_over: false }
                }
                ObjectState::Uploading if to_millis(existing.updated_at) <= stale_before => {
                    sqlx::query(
                        "UPDATE stored_objects SET claimed_by = ?, updated_at = ? WHERE digest = ?",
                    )
                    .bind(upload_id.to_string())
                    .bind(ts)
                    .bind(digest.to_hex())
                    .execute(&mut *tx)
                    .await?;
                    tracing::warn!(%digest, previous = ?existing.claimed_by, "Took over stale upload claim");
                    ClaimOutcome::Claimed { took_over: true }
                }
                state => ClaimOutcome::Busy(state),
            },
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Hand a claim this upload still holds over to the reclaimer
    ///
    /// The object is never deleted here: the row turns RECLAIMING and
    /// immediately eligible, and the reclaimer removes whatever was written.
    /// A claim that was taken over, or an object that got committed, is left
    /// untouched.
    pub async fn release_claim(&self, digest: &Digest, upload_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stored_objects
            SET state = ?, claimed_by = NULL, updated_at = 0
            WHERE digest = ? AND state = ? AND claimed_by = ? AND ref_count = 0
            "#,
        )
        .bind(ObjectState::Reclaiming.as_str())
        .bind(digest.to_hex())
        .bind(ObjectState::Uploading.as_str())
        .bind(upload_id.to_string())
        .execute(&self.writer)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Keep a claim fresh while its upload is still writing
    ///
    /// Returns false once the claim is no longer held by `upload_id`.
    pub async fn refresh_claim(&self, digest: &Digest, upload_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE stored_objects SET updated_at = ? WHERE digest = ? AND state = ? AND claimed_by = ?",
        )
        .bind(now())
        .bind(digest.to_hex())
        .bind(ObjectState::Uploading.as_str())
        .bind(upload_id.to_string())
        .execute(&self.writer)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically reference the object and activate the pending record
    pub async fn commit_upload(
        &self,
        record_id: Uuid,
        digest: &Digest,
        upload_id: Uuid,
    ) -> Result<CommitOutcome> {
        let ts = now();
        let mut tx = self.writer.begin().await?;

        let ref_count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE stored_objects
            SET state = ?, claimed_by = NULL, ref_count = ref_count + 1,
                released_at = NULL, updated_at = ?
            WHERE digest = ?
              AND (state = ? OR (state = ? AND claimed_by = ?))
            RETURNING ref_count
            "#,
        )
        .bind(ObjectState::Stored.as_str())
        .bind(ts)
        .bind(digest.to_hex())
        .bind(ObjectState::Stored.as_str())
        .bind(ObjectState::Uploading.as_str())
        .bind(upload_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(ref_count) = ref_count else {
            tx.rollback().await?;
            return Ok(CommitOutcome::ObjectUnavailable);
        };

        let activated = sqlx::query(
            "UPDATE file_records SET state = ?, updated_at = ? WHERE id = ? AND state = ?",
        )
        .bind(FileState::Active.as_str())
        .bind(ts)
        .bind(record_id.to_string())
        .bind(FileState::Pending.as_str())
        .execute(&mut *tx)
        .await?;

        if activated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(CommitOutcome::RecordMissing);
        }

        let row: FileRecordRow = sqlx::query_as("SELECT * FROM file_records WHERE id = ?")
            .bind(record_id.to_string())
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(CommitOutcome::Committed {
            record: FileRecord::try_from(row)?,
            ref_count: ref_count as u64,
        })
    }

    /// Mark a record DELETED and drop its object reference in one transaction
    pub async fn soft_delete(&self, id: Uuid) -> Result<DeleteOutcome> {
        let ts = now();
        let mut tx = self.writer.begin().await?;

        let row: Option<FileRecordRow> = sqlx::query_as("SELECT * FROM file_records WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(record) = row.map(FileRecord::try_from).transpose()? else {
            return Ok(DeleteOutcome::NotFound);
        };

        match record.state {
            FileState::Deleted => return Ok(DeleteOutcome::AlreadyDeleted(record)),
            FileState::Pending => return Ok(DeleteOutcome::Pending),
            FileState::Active => {}
        }

        sqlx::query(
            "UPDATE file_records SET state = ?, deleted_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(FileState::Deleted.as_str())
        .bind(ts)
        .bind(ts)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        let ref_count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE stored_objects
            SET ref_count = ref_count - 1,
                released_at = CASE WHEN ref_count - 1 = 0 THEN ? ELSE released_at END,
                updated_at = ?
            WHERE digest = ? AND ref_count > 0
            RETURNING ref_count
            "#,
        )
        .bind(ts)
        .bind(ts)
        .bind(record.digest.to_hex())
        .fetch_optional(&mut *tx)
        .await?;

        let ref_count = match ref_count {
            Some(count) => count as u64,
            None => {
                tracing::error!(id = %id, digest = %record.digest, "Active record had no referenced object");
                0
            }
        };

        let row: FileRecordRow = sqlx::query_as("SELECT * FROM file_records WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(DeleteOutcome::Deleted {
            record: FileRecord::try_from(row)?,
            ref_count,
        })
    }

    /// Undo a soft delete while the object has not been reclaimed
    pub async fn restore(&self, id: Uuid) -> Result<RestoreOutcome> {
        let ts = now();
        let mut tx = self.writer.begin().await?;

        let row: Option<FileRecordRow> = sqlx::query_as("SELECT * FROM file_records WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(record) = row.map(FileRecord::try_from).transpose()? else {
            return Ok(RestoreOutcome::NotFound);
        };
        if record.state != FileState::Deleted {
            return Ok(RestoreOutcome::NotDeleted(record));
        }

        let referenced = sqlx::query(
            r#"
            UPDATE stored_objects
            SET ref_count = ref_count + 1, released_at = NULL, updated_at = ?
            WHERE digest = ? AND state = ?
            "#,
        )
        .bind(ts)
        .bind(record.digest.to_hex())
        .bind(ObjectState::Stored.as_str())
        .execute(&mut *tx)
        .await?;

        if referenced.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(RestoreOutcome::ObjectGone);
        }

        sqlx::query(
            "UPDATE file_records SET state = ?, deleted_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(FileState::Active.as_str())
        .bind(ts)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        let row: FileRecordRow = sqlx::query_as("SELECT * FROM file_records WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(RestoreOutcome::Restored(FileRecord::try_from(row)?))
    }

    // --- reclamation ---

    /// Objects the reclaimer may remove: unreferenced past the grace period,
    /// or abandoned mid-upload / mid-reclaim past the claim TTL
    pub async fn reclaimable_objects(
        &self,
        released_before: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<StoredObject>> {
        let rows: Vec<StoredObjectRow> = sqlx::query_as(
            r#"
            SELECT * FROM stored_objects
            WHERE ref_count = 0
              AND ((state = ? AND released_at <= ?)
                OR (state IN (?, ?) AND updated_at <= ?))
            ORDER BY updated_at
            LIMIT ?
            "#,
        )
        .bind(ObjectState::Stored.as_str())
        .bind(to_millis(released_before))
        .bind(ObjectState::Uploading.as_str())
        .bind(ObjectState::Reclaiming.as_str())
        .bind(to_millis(stale_before))
        .bind(i64::from(limit))
        .fetch_all(&self.reader)
        .await?;

        rows.into_iter().map(StoredObject::try_from).collect()
    }

    /// Re-check eligibility and move the row to RECLAIMING
    ///
    /// Returns false when a concurrent upload or restore referenced the object
    /// since it was selected; the caller must then leave the object alone.
    pub async fn begin_reclaim(
        &self,
        digest: &Digest,
        released_before: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE stored_objects
            SET state = ?, claimed_by = NULL, updated_at = ?
            WHERE digest = ?
              AND ref_count = 0
              AND ((state = ? AND released_at <= ?)
                OR (state IN (?, ?) AND updated_at <= ?))
            "#,
        )
        .bind(ObjectState::Reclaiming.as_str())
        .bind(now())
        .bind(digest.to_hex())
        .bind(ObjectState::Stored.as_str())
        .bind(to_millis(released_before))
        .bind(ObjectState::Uploading.as_str())
        .bind(ObjectState::Reclaiming.as_str())
        .bind(to_millis(stale_before))
        .execute(&self.writer)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Forget an object whose physical copy is gone
    pub async fn finish_reclaim(&self, digest: &Digest) -> Result<bool> {
        let result = sqlx::query("DELETE FROM stored_objects WHERE digest = ? AND state = ?")
            .bind(digest.to_hex())
            .bind(ObjectState::Reclaiming.as_str())
            .execute(&self.writer)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Physical delete failed; make the row eligible again on the next sweep
    pub async fn abort_reclaim(&self, digest: &Digest) -> Result<()> {
        sqlx::query("UPDATE stored_objects SET updated_at = 0 WHERE digest = ? AND state = ?")
            .bind(digest.to_hex())
            .bind(ObjectState::Reclaiming.as_str())
            .execute(&self.writer)
            .await?;
        Ok(())
    }

    /// Hand claims of abandoned uploads over to the reclaimer
    ///
    /// The rows become RECLAIMING and immediately eligible, so a partially
    /// written object is removed before anyone can claim the digest again.
    pub async fn expire_claims(&self, stale_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE stored_objects
            SET state = ?, claimed_by = NULL, updated_at = 0
            WHERE state = ? AND ref_count = 0 AND updated_at <= ?
            "#,
        )
        .bind(ObjectState::Reclaiming.as_str())
        .bind(ObjectState::Uploading.as_str())
        .bind(to_millis(stale_before))
        .execute(&self.writer)
        .await?;
        Ok(result.rows_affected())
    }

    /// Drop PENDING records left behind by abandoned uploads
    pub async fn expire_pending(&self, created_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM file_records WHERE state = ? AND created_at <= ?")
            .bind(FileState::Pending.as_str())
            .bind(to_millis(created_before))
            .execute(&self.writer)
            .await?;
        Ok(result.rows_affected())
    }

    /// Purge DELETED records whose retention window has passed
    pub async fn purge_deleted(&self, deleted_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM file_records WHERE state = ? AND deleted_at <= ?")
            .bind(FileState::Deleted.as_str())
            .bind(to_millis(deleted_before))
            .execute(&self.writer)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let (active, pending, deleted): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN state = 'ACTIVE' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'PENDING' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'DELETED' THEN 1 ELSE 0 END), 0)
            FROM file_records
            "#,
        )
        .fetch_one(&self.reader)
        .await?;

        let (objects, bytes, unreferenced): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(size), 0),
                COALESCE(SUM(CASE WHEN ref_count = 0 THEN 1 ELSE 0 END), 0)
            FROM stored_objects
            WHERE state = 'STORED'
            "#,
        )
        .fetch_one(&self.reader)
        .await?;

        Ok(StoreStats {
            active_files: active as u64,
            pending_files: pending as u64,
            deleted_files: deleted as u64,
            stored_objects: objects as u64,
            stored_bytes: bytes as u64,
            unreferenced_objects: unreferenced as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_db() -> (MetadataDb, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = MetadataDb::new(&dir.path().join("meta.db"), &DatabaseConfig::default())
            .await
            .unwrap();
        (db, dir)
    }

    fn new_record(data: &[u8]) -> NewFileRecord {
        let digest = Digest::from_bytes(data);
        NewFileRecord {
            id: Uuid::new_v4(),
            filename: Some("file.bin".to_string()),
            digest,
            size: data.len() as u64,
            mime_type: "application/octet-stream".to_string(),
            storage_key: ObjectKey::for_digest(&digest),
        }
    }

    const TTL: Duration = Duration::from_secs(60);

    async fn upload(db: &MetadataDb, record: &NewFileRecord) -> u64 {
        let upload_id = Uuid::new_v4();
        db.reserve_pending(record).await.unwrap();
        let claim = db
            .claim_object(&record.digest, record.size, &record.storage_key, upload_id, TTL)
            .await
            .unwrap();
        assert!(matches!(claim, ClaimOutcome::Claimed { .. } | ClaimOutcome::Existing(_)));
        match db.commit_upload(record.id, &record.digest, upload_id).await.unwrap() {
            CommitOutcome::Committed { ref_count, .. } => ref_count,
            other => panic!("unexpected commit outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_db_creation_is_idempotent() {
        let (db, dir) = create_test_db().await;
        db.migrate().await.unwrap();
        db.health_check().await.unwrap();

        let reopened = MetadataDb::new(&dir.path().join("meta.db"), &DatabaseConfig::default()).await;
        assert!(reopened.is_ok());
    }

    #[tokio::test]
    async fn test_reserve_twice_conflicts() {
        let (db, _dir) = create_test_db().await;
        let record = new_record(b"reserve");

        db.reserve_pending(&record).await.unwrap();
        let err = db.reserve_pending(&record).await.unwrap_err();
        assert!(matches!(err, DepotError::Conflict(_)));

        let stored = db.find_record(record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, FileState::Pending);

        assert!(db.discard_pending(record.id).await.unwrap());
        assert!(db.find_record(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_counts_references() {
        let (db, _dir) = create_test_db().await;
        let first = new_record(b"shared content");
        let second = NewFileRecord {
            id: Uuid::new_v4(),
            ..first.clone()
        };

        assert_eq!(upload(&db, &first).await, 1);
        assert_eq!(upload(&db, &second).await, 2);

        let object = db.find_object(&first.digest).await.unwrap().unwrap();
        assert_eq!(object.ref_count, 2);
        assert_eq!(object.state, ObjectState::Stored);
        assert_eq!(object.claimed_by, None);

        let record = db.find_record(second.id).await.unwrap().unwrap();
        assert_eq!(record.state, FileState::Active);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_stale() {
        let (db, _dir) = create_test_db().await;
        let record = new_record(b"claimed");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = db
            .claim_object(&record.digest, record.size, &record.storage_key, a, TTL)
            .await
            .unwrap();
        assert_eq!(first, ClaimOutcome::Claimed { took_over: false });

        let second = db
            .claim_object(&record.digest, record.size, &record.storage_key, b, TTL)
            .await
            .unwrap();
        assert_eq!(second, ClaimOutcome::Busy(ObjectState::Uploading));

        let takeover = db
            .claim_object(&record.digest, record.size, &record.storage_key, b, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(takeover, ClaimOutcome::Claimed { took_over: true });

        // The original holder lost the claim and cannot commit
        db.reserve_pending(&record).await.unwrap();
        assert_eq!(
            db.commit_upload(record.id, &record.digest, a).await.unwrap(),
            CommitOutcome::ObjectUnavailable
        );
        assert!(!db.release_claim(&record.digest, a).await.unwrap());
        assert!(db.release_claim(&record.digest, b).await.unwrap());

        let object = db.find_object(&record.digest).await.unwrap().unwrap();
        assert_eq!(object.state, ObjectState::Reclaiming);
        assert_eq!(object.claimed_by, None);
        assert_eq!(
            db.claim_object(&record.digest, record.size, &record.storage_key, a, TTL)
                .await
                .unwrap(),
            ClaimOutcome::Busy(ObjectState::Reclaiming)
        );
    }

    #[tokio::test]
    async fn test_release_claim_spares_committed_object() {
        let (db, _dir) = create_test_db().await;
        let record = new_record(b"taken over then committed");
        db.reserve_pending(&record).await.unwrap();

        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        db.claim_object(&record.digest, record.size, &record.storage_key, a, TTL)
            .await
            .unwrap();
        db.claim_object(&record.digest, record.size, &record.storage_key, b, Duration::ZERO)
            .await
            .unwrap();
        assert!(matches!(
            db.commit_upload(record.id, &record.digest, b).await.unwrap(),
            CommitOutcome::Committed { ref_count: 1, .. }
        ));

        assert!(!db.release_claim(&record.digest, a).await.unwrap());
        assert!(!db.release_claim(&record.digest, b).await.unwrap());
        let object = db.find_object(&record.digest).await.unwrap().unwrap();
        assert_eq!(object.state, ObjectState::Stored);
        assert_eq!(object.ref_count, 1);
    }

    #[tokio::test]
    async fn test_refresh_claim_keeps_claim_fresh() {
        let (db, _dir) = create_test_db().await;
        let record = new_record(b"slow writer");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        db.claim_object(&record.digest, record.size, &record.storage_key, a, TTL)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let cutoff = Utc::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(db.refresh_claim(&record.digest, a).await.unwrap());
        assert!(!db.refresh_claim(&record.digest, b).await.unwrap());

        assert_eq!(db.expire_claims(cutoff).await.unwrap(), 0);
        let object = db.find_object(&record.digest).await.unwrap().unwrap();
        assert_eq!(object.state, ObjectState::Uploading);
        assert_eq!(object.claimed_by, Some(a));
    }

    #[tokio::test]
    async fn test_claim_size_mismatch() {
        let (db, _dir) = create_test_db().await;
        let record = new_record(b"sized");
        upload(&db, &record).await;

        let outcome = db
            .claim_object(&record.digest, record.size + 1, &record.storage_key, Uuid::new_v4(), TTL)
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::SizeMismatch { stored: record.size });
    }

    #[tokio::test]
    async fn test_commit_without_pending_record_rolls_back() {
        let (db, _dir) = create_test_db().await;
        let record = new_record(b"orphan");
        let upload_id = Uuid::new_v4();

        db.claim_object(&record.digest, record.size, &record.storage_key, upload_id, TTL)
            .await
            .unwrap();
        assert_eq!(
            db.commit_upload(record.id, &record.digest, upload_id).await.unwrap(),
            CommitOutcome::RecordMissing
        );

        let object = db.find_object(&record.digest).await.unwrap().unwrap();
        assert_eq!(object.ref_count, 0);
        assert_eq!(object.state, ObjectState::Uploading);
    }

    #[tokio::test]
    async fn test_soft_delete_releases_at_zero() {
        let (db, _dir) = create_test_db().await;
        let first = new_record(b"");
        let second = NewFileRecord {
            id: Uuid::new_v4(),
            ..first.clone()
        };
        upload(&db, &first).await;
        upload(&db, &second).await;

        match db.soft_delete(first.id).await.unwrap() {
            DeleteOutcome::Deleted { record, ref_count } => {
                assert_eq!(ref_count, 1);
                assert_eq!(record.state, FileState::Deleted);
                assert!(record.deleted_at.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
        let object = db.find_object(&first.digest).await.unwrap().unwrap();
        assert!(object.released_at.is_none());

        match db.soft_delete(second.id).await.unwrap() {
            DeleteOutcome::Deleted { ref_count, .. } => assert_eq!(ref_count, 0),
            other => panic!("unexpected {:?}", other),
        }
        let object = db.find_object(&first.digest).await.unwrap().unwrap();
        assert_eq!(object.ref_count, 0);
        assert!(object.released_at.is_some());

        assert!(matches!(
            db.soft_delete(second.id).await.unwrap(),
            DeleteOutcome::AlreadyDeleted(_)
        ));
    }

    #[tokio::test]
    async fn test_soft_delete_unknown_and_pending() {
        let (db, _dir) = create_test_db().await;
        assert_eq!(db.soft_delete(Uuid::new_v4()).await.unwrap(), DeleteOutcome::NotFound);

        let record = new_record(b"pending");
        db.reserve_pending(&record).await.unwrap();
        assert_eq!(db.soft_delete(record.id).await.unwrap(), DeleteOutcome::Pending);
    }

    #[tokio::test]
    async fn test_restore_rereferences_object() {
        let (db, _dir) = create_test_db().await;
        let record = new_record(b"restore me");
        upload(&db, &record).await;
        db.soft_delete(record.id).await.unwrap();

        match db.restore(record.id).await.unwrap() {
            RestoreOutcome::Restored(restored) => {
                assert_eq!(restored.state, FileState::Active);
                assert!(restored.deleted_at.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        let object = db.find_object(&record.digest).await.unwrap().unwrap();
        assert_eq!(object.ref_count, 1);
        assert!(object.released_at.is_none());

        assert!(matches!(
            db.restore(record.id).await.unwrap(),
            RestoreOutcome::NotDeleted(_)
        ));
    }

    #[tokio::test]
    async fn test_reclaim_lifecycle() {
        let (db, _dir) = create_test_db().await;
        let record = new_record(b"reclaim");
        upload(&db, &record).await;
        db.soft_delete(record.id).await.unwrap();

        let long_ago = Utc::now() - chrono::Duration::hours(1);
        assert!(db
            .reclaimable_objects(long_ago, long_ago, 10)
            .await
            .unwrap()
            .is_empty());

        let now = Utc::now();
        let candidates = db.reclaimable_objects(now, long_ago, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);

        assert!(db.begin_reclaim(&record.digest, now, long_ago).await.unwrap());
        // A restore now finds the object being reclaimed
        assert_eq!(db.restore(record.id).await.unwrap(), RestoreOutcome::ObjectGone);

        assert!(db.finish_reclaim(&record.digest).await.unwrap());
        assert!(db.find_object(&record.digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_begin_reclaim_loses_to_new_reference() {
        let (db, _dir) = create_test_db().await;
        let record = new_record(b"raced");
        upload(&db, &record).await;
        db.soft_delete(record.id).await.unwrap();

        let now = Utc::now();
        let past = now - chrono::Duration::hours(1);
        assert_eq!(db.reclaimable_objects(now, past, 10).await.unwrap().len(), 1);

        let again = NewFileRecord {
            id: Uuid::new_v4(),
            ..record.clone()
        };
        upload(&db, &again).await;

        assert!(!db.begin_reclaim(&record.digest, now, past).await.unwrap());
        let object = db.find_object(&record.digest).await.unwrap().unwrap();
        assert_eq!(object.ref_count, 1);
        assert_eq!(object.state, ObjectState::Stored);
    }

    #[tokio::test]
    async fn test_expire_claims_hands_over_to_reclaimer() {
        let (db, _dir) = create_test_db().await;
        let record = new_record(b"abandoned upload");
        db.claim_object(&record.digest, record.size, &record.storage_key, Uuid::new_v4(), TTL)
            .await
            .unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(db.expire_claims(past).await.unwrap(), 0);
        assert_eq!(db.expire_claims(Utc::now()).await.unwrap(), 1);

        let object = db.find_object(&record.digest).await.unwrap().unwrap();
        assert_eq!(object.state, ObjectState::Reclaiming);
        assert_eq!(object.claimed_by, None);

        // New uploads wait until the reclaimer is done
        let outcome = db
            .claim_object(&record.digest, record.size, &record.storage_key, Uuid::new_v4(), TTL)
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Busy(ObjectState::Reclaiming));

        let candidates = db.reclaimable_objects(past, past, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_expire_and_purge() {
        let (db, _dir) = create_test_db().await;
        let pending = new_record(b"abandoned");
        db.reserve_pending(&pending).await.unwrap();

        let deleted = new_record(b"old");
        upload(&db, &deleted).await;
        db.soft_delete(deleted.id).await.unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(db.expire_pending(past).await.unwrap(), 0);
        assert_eq!(db.purge_deleted(past).await.unwrap(), 0);

        let now = Utc::now();
        assert_eq!(db.expire_pending(now).await.unwrap(), 1);
        assert_eq!(db.purge_deleted(now).await.unwrap(), 1);
        assert!(db.find_record(pending.id).await.unwrap().is_none());
        assert!(db.find_record(deleted.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_active_paginates() {
        let (db, _dir) = create_test_db().await;
        let mut ids = Vec::new();
        for i in 0..5u8 {
            let record = new_record(&[i]);
            upload(&db, &record).await;
            ids.push(record.id);
        }
        db.soft_delete(ids[0]).await.unwrap();

        let page = db.list_active(2, 0).await.unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.items.len(), 2);

        let rest = db.list_active(10, 2).await.unwrap();
        assert_eq!(rest.items.len(), 2);
        assert!(rest.items.iter().all(|r| r.is_active()));
        assert!(!rest.items.iter().any(|r| r.id == ids[0]));
    }

    #[tokio::test]
    async fn test_stats() {
        let (db, _dir) = create_test_db().await;
        let kept = new_record(b"kept");
        let dropped = new_record(b"dropped!");
        upload(&db, &kept).await;
        upload(&db, &dropped).await;
        db.soft_delete(dropped.id).await.unwrap();
        db.reserve_pending(&new_record(b"pending")).await.unwrap();

        let stats = db.stats().await.unwrap();
        assert_eq!(
            stats,
            StoreStats {
                active_files: 1,
                pending_files: 1,
                deleted_files: 1,
                stored_objects: 2,
                stored_bytes: 12,
                unreferenced_objects: 1,
            }
        );
    }
}
