//! Upload pipeline: validate, spool while hashing, sniff, reserve, claim,
//! store and commit.
//!
//! The body is spooled to a temporary file so the object store receives a
//! replayable [`Payload`] and retries never re-read the client stream. Any
//! failure before commit removes the `PENDING` record and hands the upload's
//! claim to the reclaimer, so no record survives a failed upload and the
//! pipeline itself never deletes objects.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::{Config, LimitsConfig};
use crate::db::{ClaimOutcome, CommitOutcome, MetadataDb};
use crate::error::{DepotError, Result};
use crate::hash::{ContentHasher, Digest};
use crate::mime::MimeSniffer;
use crate::models::{FileRecord, NewFileRecord};
use crate::storage::{ObjectKey, Payload, StorageBackend};

/// Claim/commit rounds before giving up on a digest that keeps disappearing
const MAX_COMMIT_ATTEMPTS: u32 = 3;

const CLAIM_POLL_START: Duration = Duration::from_millis(25);
const CLAIM_POLL_MAX: Duration = Duration::from_millis(500);

/// Floor for the claim refresh period while an object is being written
const MIN_HEARTBEAT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Caller-chosen identity; generated when absent
    pub id: Option<Uuid>,
    pub filename: Option<String>,
    pub declared_content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub record: FileRecord,
    /// True when the content was already stored and no bytes were written
    pub deduplicated: bool,
    pub ref_count: u64,
}

pub struct UploadPipeline {
    db: Arc<MetadataDb>,
    store: Arc<dyn StorageBackend>,
    reclaim: Arc<Notify>,
    sniffer: MimeSniffer,
    limits: LimitsConfig,
    claim_ttl: Duration,
    claim_wait: Duration,
    spool_dir: PathBuf,
}

/// Spooled upload body; the file is removed when this is dropped
struct Spool {
    path: PathBuf,
    digest: Digest,
    len: u64,
    prefix: Vec<u8>,
}

impl Spool {
    fn payload(&self) -> Payload {
        Payload::File {
            path: self.path.clone(),
            len: self.len,
        }
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove spool file");
            }
        }
    }
}

/// Removes a partially written spool file if spooling is abandoned
struct SpoolGuard(Option<PathBuf>);

impl SpoolGuard {
    fn disarm(mut self) -> PathBuf {
        self.0.take().unwrap_or_default()
    }
}

impl Drop for SpoolGuard {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl UploadPipeline {
    /// `reclaim` is signalled when a failed upload leaves a claim behind
    pub fn new(
        db: Arc<MetadataDb>,
        store: Arc<dyn StorageBackend>,
        reclaim: Arc<Notify>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            store,
            reclaim,
            sniffer: MimeSniffer::from_limits(&config.limits),
            limits: config.limits.clone(),
            claim_ttl: config.reclaim.claim_ttl(),
            claim_wait: config.reclaim.claim_wait(),
            spool_dir: config.spool_path(),
        }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Store a stream as a new file
    pub async fn upload<S>(&self, request: UploadRequest, body: S) -> Result<UploadOutcome>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
    {
        let filename = self.validate_filename(request.filename.as_deref())?;
        let spool = self.spool(body).await?;

        let mime_type = self.sniffer.detect(
            &spool.prefix,
            filename.as_deref(),
            request.declared_content_type.as_deref(),
        );

        let record = NewFileRecord {
            id: request.id.unwrap_or_else(Uuid::new_v4),
            filename,
            digest: spool.digest,
            size: spool.len,
            mime_type,
            storage_key: ObjectKey::for_digest(&spool.digest),
        };

        self.db.reserve_pending(&record).await?;

        let upload_id = Uuid::new_v4();
        let mut held_claim = false;

        match self.store_and_commit(&record, &spool, upload_id, &mut held_claim).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::warn!(id = %record.id, digest = %record.digest, error = %e, "Upload failed, rolling back");
                self.abandon(&record, upload_id, held_claim).await;
                Err(e)
            }
        }
    }

    /// Filename checks; returns the trimmed name, or None when absent
    pub fn validate_filename(&self, filename: Option<&str>) -> Result<Option<String>> {
        let Some(name) = filename.map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(None);
        };

        if name.chars().count() > self.limits.max_filename_len {
            return Err(DepotError::Validation(format!(
                "filename longer than {} characters",
                self.limits.max_filename_len
            )));
        }

        if name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
            return Err(DepotError::Validation(format!("invalid filename {:?}", name)));
        }

        if let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str()) {
            let blocked = self
                .limits
                .blocked_extensions
                .iter()
                .any(|b| b.trim_start_matches('.').eq_ignore_ascii_case(ext));
            if blocked {
                return Err(DepotError::Validation(format!(
                    "file extension .{} is not allowed",
                    ext.to_ascii_lowercase()
                )));
            }
        }

        Ok(Some(name.to_string()))
    }

    /// Copy the body to a spool file while hashing and capturing the sniff prefix
    async fn spool<S>(&self, mut body: S) -> Result<Spool>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
    {
        tokio::fs::create_dir_all(&self.spool_dir).await?;

        let path = self.spool_dir.join(format!("{}.part", Uuid::new_v4()));
        let guard = SpoolGuard(Some(path.clone()));
        let mut file = tokio::fs::File::create(&path).await?;

        let limit = self.limits.max_file_size;
        let prefix_len = self.sniffer.prefix_len();
        let mut hasher = ContentHasher::new();
        let mut prefix = Vec::with_capacity(prefix_len.min(64 * 1024));

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if hasher.len() + chunk.len() as u64 > limit {
                return Err(DepotError::PayloadTooLarge { limit });
            }
            if prefix.len() < prefix_len {
                let take = (prefix_len - prefix.len()).min(chunk.len());
                prefix.extend_from_slice(&chunk[..take]);
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        drop(file);

        let spool = Spool {
            path: guard.disarm(),
            digest: hasher.finalize(),
            len: hasher.len(),
            prefix,
        };
        tracing::debug!(digest = %spool.digest, bytes = spool.len, "Spooled upload");
        Ok(spool)
    }

    async fn store_and_commit(
        &self,
        record: &NewFileRecord,
        spool: &Spool,
        upload_id: Uuid,
        held_claim: &mut bool,
    ) -> Result<UploadOutcome> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let deduplicated = self.claim(record, upload_id).await?;

            if !deduplicated {
                *held_claim = true;
                self.put_object(record, spool, upload_id).await?;
            }

            match self
                .db
                .commit_upload(record.id, &record.digest, upload_id)
                .await?
            {
                CommitOutcome::Committed {
                    record: committed,
                    ref_count,
                } => {
                    tracing::info!(
                        id = %committed.id,
                        digest = %committed.digest,
                        bytes = committed.size,
                        mime = %committed.mime_type,
                        deduplicated,
                        ref_count,
                        "Stored file"
                    );
                    return Ok(UploadOutcome {
                        record: committed,
                        deduplicated,
                        ref_count,
                    });
                }
                CommitOutcome::ObjectUnavailable => {
                    tracing::warn!(
                        digest = %record.digest,
                        attempt,
                        "Object changed state before commit, claiming again"
                    );
                    *held_claim = false;
                }
                CommitOutcome::RecordMissing => {
                    return Err(DepotError::Conflict(format!(
                        "pending record {} expired before commit",
                        record.id
                    )));
                }
            }
        }

        Err(DepotError::Conflict(format!(
            "object {} kept changing state; retry the upload",
            record.digest
        )))
    }

    /// Dedup check and claim; returns true when the object already exists
    ///
    /// Polls while another upload or the reclaimer holds the digest, up to
    /// the configured claim wait.
    async fn claim(&self, record: &NewFileRecord, upload_id: Uuid) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.claim_wait;
        let mut delay = CLAIM_POLL_START;

        loop {
            let outcome = self
                .db
                .claim_object(
                    &record.digest,
                    record.size,
                    &record.storage_key,
                    upload_id,
                    self.claim_ttl,
                )
                .await?;

            match outcome {
                ClaimOutcome::Claimed { .. } => return Ok(false),
                ClaimOutcome::Existing(_) => return Ok(true),
                ClaimOutcome::SizeMismatch { stored } => {
                    tracing::error!(
                        digest = %record.digest,
                        stored,
                        uploaded = record.size,
                        "Digest recorded with a different size"
                    );
                    return Err(DepotError::Conflict(format!(
                        "object {} is recorded with size {}",
                        record.digest, stored
                    )));
                }
                ClaimOutcome::Busy(state) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Err(DepotError::Conflict(format!(
                            "object {} is {}; retry the upload",
                            record.digest, state
                        )));
                    }
                    tracing::debug!(digest = %record.digest, %state, "Waiting for digest claim");
                    tokio::time::sleep(delay.min(deadline - now)).await;
                    delay = (delay * 2).min(CLAIM_POLL_MAX);
                }
            }
        }
    }

    /// Write the object, refreshing the claim until the put finishes
    ///
    /// A put that outlives the claim TTL would otherwise look abandoned to
    /// other uploads and to the reclaimer.
    async fn put_object(&self, record: &NewFileRecord, spool: &Spool, upload_id: Uuid) -> Result<()> {
        let payload = spool.payload();
        let put = self.store.put(&record.storage_key, &payload);
        tokio::pin!(put);

        let period = (self.claim_ttl / 3).max(MIN_HEARTBEAT);
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut put => return result.map_err(DepotError::from),
                _ = heartbeat.tick() => {
                    match self.db.refresh_claim(&record.digest, upload_id).await {
                        Ok(true) => tracing::trace!(digest = %record.digest, "Refreshed upload claim"),
                        Ok(false) => tracing::warn!(digest = %record.digest, "Upload claim lost while writing"),
                        Err(e) => tracing::warn!(digest = %record.digest, error = %e, "Failed to refresh upload claim"),
                    }
                }
            }
        }
    }

    /// Best-effort rollback; the object itself is left to the reclaimer
    async fn abandon(&self, record: &NewFileRecord, upload_id: Uuid, held_claim: bool) {
        if held_claim {
            match self.db.release_claim(&record.digest, upload_id).await {
                Ok(true) => self.reclaim.notify_one(),
                Ok(false) => {
                    tracing::debug!(digest = %record.digest, "Claim already passed on, leaving object alone")
                }
                Err(e) => {
                    tracing::warn!(digest = %record.digest, error = %e, "Failed to release upload claim")
                }
            }
        }

        if let Err(e) = self.db.discard_pending(record.id).await {
            tracing::warn!(id = %record.id, error = %e, "Failed to discard pending record");
        }
    }
}
