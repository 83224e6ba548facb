//! Deferred physical cleanup.
//!
//! A sweep hands abandoned upload claims over for removal, drops stale
//! `PENDING` records, deletes objects that stayed unreferenced past the grace
//! period, and purges `DELETED` records past retention. Each step is
//! idempotent, so a crashed or failed sweep is simply repeated.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ReclaimConfig;
use crate::db::MetadataDb;
use crate::error::Result;
use crate::storage::StorageBackend;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub expired_claims: u64,
    pub expired_pending: u64,
    /// Objects removed, or eligible for removal on a dry run
    pub reclaimed_objects: u64,
    pub reclaimed_bytes: u64,
    /// Lost to a concurrent upload or restore
    pub skipped_objects: u64,
    pub failed_objects: u64,
    pub purged_records: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_claims == 0
            && self.expired_pending == 0
            && self.reclaimed_objects == 0
            && self.skipped_objects == 0
            && self.failed_objects == 0
            && self.purged_records == 0
    }
}

pub struct Reclaimer {
    db: Arc<MetadataDb>,
    store: Arc<dyn StorageBackend>,
    notify: Arc<Notify>,
    config: ReclaimConfig,
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Reclaimer {
    pub fn new(
        db: Arc<MetadataDb>,
        store: Arc<dyn StorageBackend>,
        notify: Arc<Notify>,
        config: ReclaimConfig,
    ) -> Self {
        Self {
            db,
            store,
            notify,
            config,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.run_once(false).await
    }

    /// One sweep; with `dry_run` nothing is changed and eligible objects are only counted
    pub async fn run_once(&self, dry_run: bool) -> Result<SweepReport> {
        let now = Utc::now();
        let released_before = cutoff(now, self.config.grace());
        let stale_before = cutoff(now, self.config.claim_ttl());
        let pending_before = cutoff(now, self.config.pending_ttl());
        let mut report = SweepReport {
            dry_run,
            ..Default::default()
        };

        if !dry_run {
            report.expired_claims = self.db.expire_claims(stale_before).await?;
            report.expired_pending = self.db.expire_pending(pending_before).await?;
        }

        let candidates = self
            .db
            .reclaimable_objects(released_before, stale_before, self.config.batch_size)
            .await?;

        for object in candidates {
            if dry_run {
                report.reclaimed_objects += 1;
                report.reclaimed_bytes += object.size;
                continue;
            }

            if !self
                .db
                .begin_reclaim(&object.digest, released_before, stale_before)
                .await?
            {
                tracing::debug!(digest = %object.digest, "Object referenced again, skipping");
                report.skipped_objects += 1;
                continue;
            }

            match self.store.delete(&object.object_key()).await {
                Ok(()) => {
                    self.db.finish_reclaim(&object.digest).await?;
                    tracing::info!(digest = %object.digest, bytes = object.size, "Reclaimed object");
                    report.reclaimed_objects += 1;
                    report.reclaimed_bytes += object.size;
                }
                Err(e) => {
                    tracing::error!(digest = %object.digest, error = %e, "Failed to delete object, will retry");
                    self.db.abort_reclaim(&object.digest).await?;
                    report.failed_objects += 1;
                }
            }
        }

        if !dry_run {
            if let Some(retention) = self.config.record_retention() {
                report.purged_records = self.db.purge_deleted(cutoff(now, retention)).await?;
            }
        }

        Ok(report)
    }

    /// Sweep on every interval tick and whenever woken, until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.config.interval_secs,
            grace_secs = self.config.grace_secs,
            "Reclaimer started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {
                    tracing::debug!("Reclaimer woken");
                }
            }

            match self.sweep().await {
                Ok(report) if report.is_empty() => tracing::debug!("Nothing to reclaim"),
                Ok(report) => tracing::info!(?report, "Sweep finished"),
                Err(e) => tracing::warn!(error = %e, "Sweep failed"),
            }
        }

        tracing::info!("Reclaimer stopped");
    }
}
