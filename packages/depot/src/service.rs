// Retrieval, listing and deletion of stored files
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::db::{DeleteOutcome, MetadataDb, RestoreOutcome};
use crate::error::{DepotError, Result};
use crate::models::{FileRecord, FileState, Page, PresignedUrl};
use crate::storage::{ByteStream, StorageBackend, StoreError};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 1000;

pub struct FileService {
    db: Arc<MetadataDb>,
    store: Arc<dyn StorageBackend>,
    reclaim: Arc<Notify>,
}

impl FileService {
    /// `reclaim` is signalled whenever an object loses its last reference
    pub fn new(db: Arc<MetadataDb>, store: Arc<dyn StorageBackend>, reclaim: Arc<Notify>) -> Self {
        Self { db, store, reclaim }
    }

    /// Metadata and body of an active file
    pub async fn get(&self, id: Uuid) -> Result<(FileRecord, ByteStream)> {
        let record = self
            .db
            .find_record(id)
            .await?
            .filter(FileRecord::is_active)
            .ok_or_else(|| DepotError::not_found(id))?;

        match self.store.get(&record.object_key()).await {
            Ok(body) => Ok((record, body)),
            Err(StoreError::NotFound(key)) => {
                tracing::error!(%id, %key, "Active record points at a missing object");
                Err(DepotError::not_found(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Signed URL that downloads an active file straight from the backend
    pub async fn presign(&self, id: Uuid, expires_in: Duration) -> Result<PresignedUrl> {
        let record = self
            .db
            .find_record(id)
            .await?
            .filter(FileRecord::is_active)
            .ok_or_else(|| DepotError::not_found(id))?;

        let issued_at = Utc::now();
        let url = self
            .store
            .presign(&record.object_key(), expires_in)
            .await?
            .ok_or_else(|| {
                DepotError::Unsupported(format!(
                    "{} backend does not issue presigned URLs",
                    self.store.name()
                ))
            })?;

        let expires_at = chrono::Duration::from_std(expires_in)
            .ok()
            .and_then(|ttl| issued_at.checked_add_signed(ttl))
            .unwrap_or(issued_at);
        tracing::debug!(%id, expires_in_secs = expires_in.as_secs(), "Issued presigned URL");

        Ok(PresignedUrl { id, url, expires_at })
    }

    /// Record in any state, so deleted files stay queryable until purged
    pub async fn describe(&self, id: Uuid) -> Result<FileRecord> {
        self.db
            .find_record(id)
            .await?
            .ok_or_else(|| DepotError::not_found(id))
    }

    pub async fn list(&self, limit: Option<u32>, offset: Option<u32>) -> Result<Page<FileRecord>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        self.db.list_active(limit, offset.unwrap_or(0)).await
    }

    /// Soft delete; the physical object is left to the reclaimer
    pub async fn delete(&self, id: Uuid) -> Result<FileRecord> {
        match self.db.soft_delete(id).await? {
            DeleteOutcome::Deleted { record, ref_count } => {
                tracing::info!(%id, digest = %record.digest, ref_count, "Deleted file");
                if ref_count == 0 {
                    self.reclaim.notify_one();
                }
                Ok(record)
            }
            DeleteOutcome::AlreadyDeleted(record) => {
                tracing::warn!(%id, "File already deleted");
                Ok(record)
            }
            DeleteOutcome::Pending => Err(DepotError::Conflict(format!(
                "file {} is still being uploaded",
                id
            ))),
            DeleteOutcome::NotFound => Err(DepotError::not_found(id)),
        }
    }

    /// Undo a delete while the object has not been reclaimed
    pub async fn restore(&self, id: Uuid) -> Result<FileRecord> {
        match self.db.restore(id).await? {
            RestoreOutcome::Restored(record) => {
                tracing::info!(%id, digest = %record.digest, "Restored file");
                Ok(record)
            }
            RestoreOutcome::NotDeleted(record) if record.state == FileState::Active => Ok(record),
            RestoreOutcome::NotDeleted(_) | RestoreOutcome::NotFound => {
                Err(DepotError::not_found(id))
            }
            RestoreOutcome::ObjectGone => {
                tracing::warn!(%id, "Restore requested after content was reclaimed");
                Err(DepotError::not_found(id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Digest;
    use crate::models::NewFileRecord;
    use crate::pipeline::UploadRequest;
    use crate::storage::{collect, ObjectKey, RemoteStorage};
    use crate::testing::{body, TestDepot};

    async fn put(depot: &TestDepot, data: &[u8]) -> FileRecord {
        depot
            .pipeline
            .upload(UploadRequest::default(), body(data))
            .await
            .unwrap()
            .record
    }

    async fn notified(depot: &TestDepot) -> bool {
        tokio::time::timeout(Duration::from_millis(100), depot.notify.notified())
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn test_get_streams_body() {
        let depot = TestDepot::new().await;
        let record = put(&depot, b"streamed back").await;

        let (meta, stream) = depot.files.get(record.id).await.unwrap();
        assert_eq!(meta, record);
        assert_eq!(collect(stream).await.unwrap(), b"streamed back");
    }

    #[tokio::test]
    async fn test_get_unknown_and_deleted() {
        let depot = TestDepot::new().await;
        assert!(matches!(
            depot.files.get(Uuid::new_v4()).await,
            Err(DepotError::NotFound(_))
        ));

        let record = put(&depot, b"soon gone").await;
        depot.files.delete(record.id).await.unwrap();
        assert!(matches!(depot.files.get(record.id).await, Err(DepotError::NotFound(_))));

        let described = depot.files.describe(record.id).await.unwrap();
        assert_eq!(described.state, FileState::Deleted);
    }

    #[tokio::test]
    async fn test_empty_upload_then_delete_schedules_cleanup() {
        let depot = TestDepot::new().await;
        let record = put(&depot, b"").await;

        let deleted = depot.files.delete(record.id).await.unwrap();
        assert_eq!(deleted.state, FileState::Deleted);
        assert!(notified(&depot).await);

        let object = depot.db.find_object(&record.digest).await.unwrap().unwrap();
        assert_eq!(object.ref_count, 0);
        assert!(object.released_at.is_some());

        // Physical removal is deferred
        assert_eq!(depot.store.stat(&record.object_key()).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_delete_shared_object_keeps_it_referenced() {
        let depot = TestDepot::new().await;
        let first = put(&depot, b"shared").await;
        let second = put(&depot, b"shared").await;

        depot.files.delete(first.id).await.unwrap();
        assert!(!notified(&depot).await);

        let (_, stream) = depot.files.get(second.id).await.unwrap();
        assert_eq!(collect(stream).await.unwrap(), b"shared");
        let object = depot.db.find_object(&first.digest).await.unwrap().unwrap();
        assert_eq!(object.ref_count, 1);
    }

    #[tokio::test]
    async fn test_delete_unknown_has_no_side_effects() {
        let depot = TestDepot::new().await;
        let record = put(&depot, b"bystander").await;
        let before = depot.db.find_object(&record.digest).await.unwrap();

        let err = depot.files.delete(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DepotError::NotFound(_)));

        assert_eq!(depot.db.find_object(&record.digest).await.unwrap(), before);
        assert_eq!(depot.db.stats().await.unwrap().deleted_files, 0);
    }

    #[tokio::test]
    async fn test_delete_twice_is_idempotent() {
        let depot = TestDepot::new().await;
        let record = put(&depot, b"twice").await;

        depot.files.delete(record.id).await.unwrap();
        let again = depot.files.delete(record.id).await.unwrap();
        assert_eq!(again.state, FileState::Deleted);

        let object = depot.db.find_object(&record.digest).await.unwrap().unwrap();
        assert_eq!(object.ref_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_delete_and_get() {
        let depot = TestDepot::new().await;
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 241) as u8).collect();

        for _ in 0..10 {
            let record = put(&depot, &data).await;
            let read = async {
                match depot.files.get(record.id).await {
                    Ok((_, stream)) => Some(collect(stream).await.unwrap()),
                    Err(DepotError::NotFound(_)) => None,
                    Err(e) => panic!("unexpected error {}", e),
                }
            };
            let (body, deleted) = tokio::join!(read, depot.files.delete(record.id));
            deleted.unwrap();
            if let Some(body) = body {
                assert_eq!(body, data);
            }
        }
    }

    #[tokio::test]
    async fn test_restore() {
        let depot = TestDepot::new().await;
        let record = put(&depot, b"come back").await;

        depot.files.delete(record.id).await.unwrap();
        let restored = depot.files.restore(record.id).await.unwrap();
        assert_eq!(restored.state, FileState::Active);

        let (_, stream) = depot.files.get(record.id).await.unwrap();
        assert_eq!(collect(stream).await.unwrap(), b"come back");

        // Restoring an active file is a no-op
        assert_eq!(depot.files.restore(record.id).await.unwrap().state, FileState::Active);
        assert!(matches!(
            depot.files.restore(Uuid::new_v4()).await,
            Err(DepotError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_pages_newest_first() {
        let depot = TestDepot::new().await;
        let mut ids = Vec::new();
        for i in 0..3u8 {
            ids.push(put(&depot, &[i, i, i]).await.id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let page = depot.files.list(Some(2), None).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[2], ids[1]]);

        let clamped = depot.files.list(Some(0), Some(2)).await.unwrap();
        assert_eq!(clamped.limit, 1);
        assert_eq!(clamped.items[0].id, ids[0]);
    }

    #[tokio::test]
    async fn test_presign_needs_a_signing_backend() {
        let depot = TestDepot::new().await;
        let record = put(&depot, b"local bytes").await;

        assert!(matches!(
            depot.files.presign(record.id, Duration::from_secs(60)).await,
            Err(DepotError::Unsupported(_))
        ));
        assert!(matches!(
            depot.files.presign(Uuid::new_v4(), Duration::from_secs(60)).await,
            Err(DepotError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_presign_active_file_on_s3() {
        let s3 = RemoteStorage::s3("http://127.0.0.1:9000", "files", "us-east-1", "minio", "minio123")
            .unwrap();
        let depot = TestDepot::with_store(Arc::new(s3)).await;

        // Metadata only; signing never touches the bucket
        let data = b"signed download";
        let digest = Digest::from_bytes(data);
        let record = NewFileRecord {
            id: Uuid::new_v4(),
            filename: Some("report.txt".to_string()),
            digest,
            size: data.len() as u64,
            mime_type: "text/plain".to_string(),
            storage_key: ObjectKey::for_digest(&digest),
        };
        let upload_id = Uuid::new_v4();
        depot.db.reserve_pending(&record).await.unwrap();
        depot
            .db
            .claim_object(&digest, record.size, &record.storage_key, upload_id, Duration::from_secs(60))
            .await
            .unwrap();
        depot.db.commit_upload(record.id, &digest, upload_id).await.unwrap();

        let before = Utc::now();
        let signed = depot.files.presign(record.id, Duration::from_secs(300)).await.unwrap();
        assert_eq!(signed.id, record.id);
        assert!(signed.url.contains(record.storage_key.as_str()));
        assert!(signed.url.contains("X-Amz-Expires=300"));
        assert!(signed.expires_at >= before + chrono::Duration::seconds(299));

        depot.files.delete(record.id).await.unwrap();
        assert!(matches!(
            depot.files.presign(record.id, Duration::from_secs(300)).await,
            Err(DepotError::NotFound(_))
        ));
    }
}
