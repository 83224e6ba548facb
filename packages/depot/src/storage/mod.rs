// Object store client contract and backends
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;

use crate::config::{BackendConfig, Config};
use crate::hash::Digest;

pub mod local;
pub mod remote;
pub mod retry;

pub use local::LocalStorage;
pub use remote::RemoteStorage;
pub use retry::{RetryPolicy, Retrying};

/// Body of a stored object, delivered in chunks
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    /// Worth retrying: timeouts, throttling, connection resets
    #[error("transient object store failure: {0}")]
    Transient(String),

    #[error("object store failure: {0}")]
    Permanent(String),

    #[error("object store io error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Backend locator of a physical object, derived from its digest
///
/// Layout: `{hex[..2]}/{hex[2..4]}/{hex}`, which keeps directory fan-out low on
/// filesystems and prefix-partitioned on S3.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn for_digest(digest: &Digest) -> Self {
        let hex = digest.to_hex();
        ObjectKey(format!("{}/{}/{}", &hex[..2], &hex[2..4], hex))
    }

    /// Wrap a key read back from the metadata store
    pub fn from_stored(key: impl Into<String>) -> Self {
        ObjectKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replayable upload body; retries reopen it from the start
#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Bytes),
    File { path: PathBuf, len: u64 },
}

impl Payload {
    pub fn len(&self) -> u64 {
        match self {
            Payload::Bytes(b) => b.len() as u64,
            Payload::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a fresh chunk stream over the payload
    pub async fn open(&self) -> io::Result<ByteStream> {
        match self {
            Payload::Bytes(b) => {
                let chunk = b.clone();
                Ok(stream::once(async move { Ok(chunk) }).boxed())
            }
            Payload::File { path, .. } => {
                let file = tokio::fs::File::open(path).await?;
                Ok(ReaderStream::with_capacity(file, 64 * 1024).boxed())
            }
        }
    }
}

/// Storage backend contract for content-addressed objects
///
/// Every operation is idempotent: writing an existing key is a no-op and
/// deleting a missing key succeeds.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store the payload under `key`
    async fn put(&self, key: &ObjectKey, payload: &Payload) -> Result<(), StoreError>;

    /// Open a stream over the object at `key`
    async fn get(&self, key: &ObjectKey) -> Result<ByteStream, StoreError>;

    /// Remove the object at `key`
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Size of the object at `key`, or `None` when absent
    async fn stat(&self, key: &ObjectKey) -> Result<Option<u64>, StoreError>;

    /// Time-limited URL that reads `key` without going through the gateway
    ///
    /// `None` when the backend has no way to sign URLs.
    async fn presign(&self, _key: &ObjectKey, _expires_in: Duration) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// Build the configured backend wrapped in the retry policy
pub async fn from_config(config: &Config) -> Result<Arc<dyn StorageBackend>, StoreError> {
    let policy = RetryPolicy::from(&config.retry);

    let backend: Arc<dyn StorageBackend> = match &config.backend {
        BackendConfig::Local => {
            let local = LocalStorage::with_root(config.objects_path());
            local.initialize().await?;
            Arc::new(Retrying::new(local, policy))
        }
        BackendConfig::Memory => Arc::new(Retrying::new(RemoteStorage::memory()?, policy)),
        BackendConfig::S3 {
            endpoint,
            bucket,
            region,
            access_key_id,
            secret_access_key,
        } => Arc::new(Retrying::new(
            RemoteStorage::s3(endpoint, bucket, region, access_key_id, secret_access_key)?,
            policy,
        )),
    };

    tracing::info!(backend = backend.name(), "Object store ready");
    Ok(backend)
}

/// Drain a stream into memory; for tests and small objects only
pub async fn collect(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
