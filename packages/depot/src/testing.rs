// Shared fixtures for unit tests
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::config::{BackendConfig, Config};
use crate::db::MetadataDb;
use crate::pipeline::UploadPipeline;
use crate::service::FileService;
use crate::storage::{ByteStream, LocalStorage, ObjectKey, Payload, StorageBackend, StoreError};

pub fn test_config() -> Config {
    let mut config = Config::with_root("/nonexistent");
    config.backend = BackendConfig::Local;
    config
}

/// Whole body in one chunk
pub fn body(data: &[u8]) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin {
    stream::iter(vec![Ok(Bytes::copy_from_slice(data))])
}

pub fn chunked_body(data: &[u8], chunk: usize) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin {
    let chunks: Vec<io::Result<Bytes>> = data
        .chunks(chunk.max(1))
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks)
}

/// Metadata store, object store, pipeline and service rooted in a temp dir
pub struct TestDepot {
    pub config: Config,
    pub db: Arc<MetadataDb>,
    pub store: Arc<dyn StorageBackend>,
    pub pipeline: Arc<UploadPipeline>,
    pub files: Arc<FileService>,
    pub notify: Arc<Notify>,
    _dir: TempDir,
}

impl TestDepot {
    pub async fn new() -> Self {
        Self::build(test_config(), None).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self::build(config, None).await
    }

    pub async fn with_store(store: Arc<dyn StorageBackend>) -> Self {
        Self::build(test_config(), Some(store)).await
    }

    async fn build(config: Config, store: Option<Arc<dyn StorageBackend>>) -> Self {
        let dir = TempDir::new().unwrap();
        let config = Config {
            root: dir.path().to_path_buf(),
            ..config
        };

        let db = Arc::new(MetadataDb::new(&config.db_path(), &config.database).await.unwrap());
        let store = match store {
            Some(store) => store,
            None => {
                let local = LocalStorage::with_root(config.objects_path());
                local.initialize().await.unwrap();
                Arc::new(local) as Arc<dyn StorageBackend>
            }
        };
        let notify = Arc::new(Notify::new());

        Self {
            pipeline: Arc::new(UploadPipeline::new(
                db.clone(),
                store.clone(),
                notify.clone(),
                &config,
            )),
            files: Arc::new(FileService::new(db.clone(), store.clone(), notify.clone())),
            config,
            db,
            store,
            notify,
            _dir: dir,
        }
    }
}

/// Object store that refuses every operation
pub struct FailingStore {
    transient: bool,
}

impl FailingStore {
    pub fn permanent() -> Self {
        Self { transient: false }
    }

    pub fn transient() -> Self {
        Self { transient: true }
    }

    fn fail(&self) -> StoreError {
        if self.transient {
            StoreError::Transient("service unavailable".into())
        } else {
            StoreError::Permanent("access denied".into())
        }
    }
}

#[async_trait]
impl StorageBackend for FailingStore {
    async fn put(&self, _key: &ObjectKey, _payload: &Payload) -> Result<(), StoreError> {
        Err(self.fail())
    }
    async fn get(&self, _key: &ObjectKey) -> Result<ByteStream, StoreError> {
        Err(self.fail())
    }
    async fn delete(&self, _key: &ObjectKey) -> Result<(), StoreError> {
        Err(self.fail())
    }
    async fn stat(&self, _key: &ObjectKey) -> Result<Option<u64>, StoreError> {
        Err(self.fail())
    }
    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Holds every put for `delay` before handing it to `inner`, or failing it
pub struct SlowStore {
    inner: Arc<dyn StorageBackend>,
    delay: Duration,
    fail_puts: bool,
}

impl SlowStore {
    pub fn new(inner: Arc<dyn StorageBackend>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            fail_puts: false,
        }
    }

    pub fn failing(inner: Arc<dyn StorageBackend>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            fail_puts: true,
        }
    }
}

#[async_trait]
impl StorageBackend for SlowStore {
    async fn put(&self, key: &ObjectKey, payload: &Payload) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        if self.fail_puts {
            return Err(StoreError::Permanent("write rejected".into()));
        }
        self.inner.put(key, payload).await
    }
    async fn get(&self, key: &ObjectKey) -> Result<ByteStream, StoreError> {
        self.inner.get(key).await
    }
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
    async fn stat(&self, key: &ObjectKey) -> Result<Option<u64>, StoreError> {
        self.inner.stat(key).await
    }
    fn name(&self) -> &'static str {
        "slow"
    }
}
