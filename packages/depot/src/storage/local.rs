// Local filesystem storage backend
use super::{ByteStream, ObjectKey, Payload, StorageBackend, StoreError};
use async_trait::async_trait;
use futures::StreamExt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Local filesystem storage backend
///
/// Objects live at `root/{key}`, where keys already carry the
/// `{hash[:2]}/{hash[2:4]}/{full_hash}` fan-out.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn key_to_path(&self, key: &ObjectKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if it doesn't exist
    pub async fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Clean up empty parent directories after file deletion
    async fn cleanup_empty_dirs(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            if parent.starts_with(&self.root) && parent != self.root {
                // Only succeeds if empty
                let _ = fs::remove_dir(parent).await;

                if let Some(grandparent) = parent.parent() {
                    if grandparent.starts_with(&self.root) && grandparent != self.root {
                        let _ = fs::remove_dir(grandparent).await;
                    }
                }
            }
        }
    }

    async fn write_atomically(&self, path: &Path, payload: &Payload) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Readers never observe a half-written object: write beside it, then rename
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            let mut body = payload.open().await?;
            while let Some(chunk) = body.next().await {
                file.write_all(&chunk?).await?;
            }
            file.sync_all().await?;
            fs::rename(&tmp, path).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }
}

fn map_not_found(err: io::Error, key: &ObjectKey) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Io(err)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn put(&self, key: &ObjectKey, payload: &Payload) -> Result<(), StoreError> {
        let path = self.key_to_path(key);

        // Content-addressed: an object of the right size is already this content
        if let Ok(meta) = fs::metadata(&path).await {
            if meta.len() == payload.len() {
                tracing::debug!(%key, "Object already present");
                return Ok(());
            }
            tracing::warn!(%key, found = meta.len(), expected = payload.len(), "Replacing truncated object");
        }

        self.write_atomically(&path, payload).await?;
        tracing::info!(%key, bytes = payload.len(), "Stored object");
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> Result<ByteStream, StoreError> {
        let path = self.key_to_path(key);
        // An open handle keeps reading after a concurrent unlink
        let file = fs::File::open(&path)
            .await
            .map_err(|e| map_not_found(e, key))?;
        Ok(ReaderStream::with_capacity(file, 64 * 1024).boxed())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let path = self.key_to_path(key);

        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(%key, "Deleted object");
                self.cleanup_empty_dirs(&path).await;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(%key, "Object already gone");
                Ok(())
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn stat(&self, key: &ObjectKey) -> Result<Option<u64>, StoreError> {
        match fs::metadata(self.key_to_path(key)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
