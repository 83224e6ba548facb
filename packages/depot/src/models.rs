//! Records persisted by the metadata store.
//!
//! Rows are read into the `*Row` structs with sqlx and converted into the
//! typed domain structs; timestamps are stored as Unix milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::DepotError;
use crate::hash::Digest;
use crate::storage::ObjectKey;

/// Lifecycle of a logical file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    /// Identity reserved, content not yet committed
    Pending,
    Active,
    /// Soft-deleted; kept until the retention window expires
    Deleted,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Pending => "PENDING",
            FileState::Active => "ACTIVE",
            FileState::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileState {
    type Err = DepotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(FileState::Pending),
            "ACTIVE" => Ok(FileState::Active),
            "DELETED" => Ok(FileState::Deleted),
            other => Err(DepotError::Internal(format!("unknown file state {}", other))),
        }
    }
}

/// Lifecycle of a physical object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectState {
    /// An upload holds the write claim
    Uploading,
    Stored,
    /// The reclaimer is removing the physical object
    Reclaiming,
}

impl ObjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectState::Uploading => "UPLOADING",
            ObjectState::Stored => "STORED",
            ObjectState::Reclaiming => "RECLAIMING",
        }
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectState {
    type Err = DepotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOADING" => Ok(ObjectState::Uploading),
            "STORED" => Ok(ObjectState::Stored),
            "RECLAIMING" => Ok(ObjectState::Reclaiming),
            other => Err(DepotError::Internal(format!("unknown object state {}", other))),
        }
    }
}

/// Logical, user-facing file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub digest: Digest,
    pub size: u64,
    pub mime_type: String,
    pub storage_key: String,
    pub state: FileState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::from_stored(self.storage_key.clone())
    }

    pub fn is_active(&self) -> bool {
        self.state == FileState::Active
    }
}

/// Physical object shared by every record with the same digest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredObject {
    pub digest: Digest,
    pub size: u64,
    pub storage_key: String,
    pub ref_count: u64,
    pub state: ObjectState,
    pub claimed_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When `ref_count` last dropped to zero
    pub released_at: Option<DateTime<Utc>>,
}

impl StoredObject {
    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::from_stored(self.storage_key.clone())
    }
}

/// Fields known once an upload has been spooled and hashed
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub id: Uuid,
    pub filename: Option<String>,
    pub digest: Digest,
    pub size: u64,
    pub mime_type: String,
    pub storage_key: ObjectKey,
}

/// Direct download link for an active file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresignedUrl {
    pub id: Uuid,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// One page of a listing
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

/// Counters reported by `depot gc --dry-run` and `/health`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub active_files: u64,
    pub pending_files: u64,
    pub deleted_files: u64,
    pub stored_objects: u64,
    pub stored_bytes: u64,
    pub unreferenced_objects: u64,
}

#[derive(Debug, FromRow)]
pub(crate) struct FileRecordRow {
    pub id: String,
    pub filename: Option<String>,
    pub digest: String,
    pub size: i64,
    pub mime_type: String,
    pub storage_key: String,
    pub state: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, FromRow)]
pub(crate) struct StoredObjectRow {
    pub digest: String,
    pub size: i64,
    pub storage_key: String,
    pub ref_count: i64,
    pub state: String,
    pub claimed_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub released_at: Option<i64>,
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>, DepotError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| DepotError::Internal(format!("timestamp out of range: {}", millis)))
}

fn parse_uuid(s: &str) -> Result<Uuid, DepotError> {
    Uuid::parse_str(s).map_err(|e| DepotError::Internal(format!("corrupt id {}: {}", s, e)))
}

fn parse_digest(s: &str) -> Result<Digest, DepotError> {
    Digest::from_str(s).map_err(|e| DepotError::Internal(format!("corrupt digest {}: {}", s, e)))
}

fn to_u64(value: i64, column: &str) -> Result<u64, DepotError> {
    u64::try_from(value).map_err(|_| DepotError::Internal(format!("negative {}: {}", column, value)))
}

impl TryFrom<FileRecordRow> for FileRecord {
    type Error = DepotError;

    fn try_from(row: FileRecordRow) -> Result<Self, Self::Error> {
        Ok(FileRecord {
            id: parse_uuid(&row.id)?,
            filename: row.filename,
            digest: parse_digest(&row.digest)?,
            size: to_u64(row.size, "size")?,
            mime_type: row.mime_type,
            storage_key: row.storage_key,
            state: row.state.parse()?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            deleted_at: row.deleted_at.map(from_millis).transpose()?,
        })
    }
}

impl TryFrom<StoredObjectRow> for StoredObject {
    type Error = DepotError;

    fn try_from(row: StoredObjectRow) -> Result<Self, Self::Error> {
        Ok(StoredObject {
            digest: parse_digest(&row.digest)?,
            size: to_u64(row.size, "size")?,
            storage_key: row.storage_key,
            ref_count: to_u64(row.ref_count, "ref_count")?,
            state: row.state.parse()?,
            claimed_by: row.claimed_by.as_deref().map(parse_uuid).transpose()?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            released_at: row.released_at.map(from_millis).transpose()?,
        })
    }
}
