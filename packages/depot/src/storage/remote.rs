//! Remote object storage through Apache OpenDAL.
//!
//! One [`RemoteStorage`] wraps an [`Operator`] for any S3-compatible endpoint
//! (MinIO, R2, AWS) or the in-memory service used by tests and throwaway runs.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use opendal::{services, ErrorKind, Operator};
use std::io;
use std::time::Duration;

use super::{ByteStream, ObjectKey, Payload, StorageBackend, StoreError};

/// Size of each ranged read when streaming an object back
const READ_CHUNK: u64 = 4 * 1024 * 1024;

pub struct RemoteStorage {
    operator: Operator,
    name: &'static str,
}

impl RemoteStorage {
    /// S3-compatible bucket
    pub fn s3(
        endpoint: &str,
        bucket: &str,
        region: &str,
        access_key_id: &str,
        secret_access_key: &str,
    ) -> Result<Self, StoreError> {
        let builder = services::S3::default()
            .endpoint(endpoint)
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key_id)
            .secret_access_key(secret_access_key);

        let operator = Operator::new(builder)
            .map_err(|e| StoreError::Permanent(format!("s3 configuration: {}", e)))?
            .finish();

        Ok(Self {
            operator,
            name: "s3",
        })
    }

    /// Process-local store; contents vanish with the process
    pub fn memory() -> Result<Self, StoreError> {
        let operator = Operator::new(services::Memory::default())
            .map_err(|e| StoreError::Permanent(format!("memory configuration: {}", e)))?
            .finish();

        Ok(Self {
            operator,
            name: "memory",
        })
    }
}

impl From<opendal::Error> for StoreError {
    fn from(err: opendal::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => StoreError::NotFound(err.to_string()),
            _ if err.is_temporary() => StoreError::Transient(err.to_string()),
            ErrorKind::RateLimited => StoreError::Transient(err.to_string()),
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

#[async_trait]
impl StorageBackend for RemoteStorage {
    async fn put(&self, key: &ObjectKey, payload: &Payload) -> Result<(), StoreError> {
        if let Some(existing) = self.stat(key).await? {
            if existing == payload.len() {
                tracing::debug!(%key, backend = self.name, "Object already present");
                return Ok(());
            }
        }

        let mut writer = self.operator.writer(key.as_str()).await?;
        let mut body = payload.open().await?;

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(StoreError::Io(e));
                }
            };
            if let Err(e) = writer.write(chunk).await {
                let _ = writer.abort().await;
                return Err(e.into());
            }
        }
        writer.close().await?;

        tracing::info!(%key, backend = self.name, bytes = payload.len(), "Stored object");
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> Result<ByteStream, StoreError> {
        let len = self
            .stat(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let operator = self.operator.clone();
        let path = key.as_str().to_string();

        let chunks = stream::try_unfold(0u64, move |offset| {
            let operator = operator.clone();
            let path = path.clone();
            async move {
                if offset >= len {
                    return Ok(None);
                }
                let end = (offset + READ_CHUNK).min(len);
                let buffer = operator
                    .read_with(&path)
                    .range(offset..end)
                    .await
                    .map_err(|e| io::Error::other(e.to_string()))?;
                let bytes: Bytes = buffer.to_bytes();
                if bytes.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("object {} ended at {} of {} bytes", path, offset, len),
                    ));
                }
                let next = offset + bytes.len() as u64;
                Ok(Some((bytes, next)))
            }
        });

        Ok(chunks.boxed())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.operator.delete(key.as_str()).await?;
        tracing::info!(%key, backend = self.name, "Deleted object");
        Ok(())
    }

    async fn stat(&self, key: &ObjectKey) -> Result<Option<u64>, StoreError> {
        match self.operator.stat(key.as_str()).await {
            Ok(meta) => Ok(Some(meta.content_length())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn presign(&self, key: &ObjectKey, expires_in: Duration) -> Result<Option<String>, StoreError> {
        if !self.operator.info().full_capability().presign_read {
            return Ok(None);
        }
        let request = self.operator.presign_read(key.as_str(), expires_in).await?;
        tracing::debug!(%key, backend = self.name, expires_in_secs = expires_in.as_secs(), "Presigned read");
        Ok(Some(request.uri().to_string()))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
