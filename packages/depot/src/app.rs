// Wiring: builds every component from a Config
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::MetadataDb;
use crate::error::{DepotError, Result};
use crate::http::{self, AppState};
use crate::pipeline::UploadPipeline;
use crate::reclaim::Reclaimer;
use crate::service::FileService;
use crate::storage::{self, StorageBackend};

/// Handles to an opened depot
pub struct Depot {
    pub config: Config,
    pub db: Arc<MetadataDb>,
    pub store: Arc<dyn StorageBackend>,
    pub pipeline: Arc<UploadPipeline>,
    pub files: Arc<FileService>,
    pub reclaimer: Arc<Reclaimer>,
}

impl Depot {
    pub async fn open(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| DepotError::Validation(e.to_string()))?;

        let db = Arc::new(MetadataDb::new(&config.db_path(), &config.database).await?);
        let store = storage::from_config(&config).await?;
        let notify = Arc::new(Notify::new());

        let pipeline = Arc::new(UploadPipeline::new(
            db.clone(),
            store.clone(),
            notify.clone(),
            &config,
        ));
        let files = Arc::new(FileService::new(db.clone(), store.clone(), notify.clone()));
        let reclaimer = Arc::new(Reclaimer::new(
            db.clone(),
            store.clone(),
            notify,
            config.reclaim.clone(),
        ));

        tracing::info!(root = %config.root.display(), backend = store.name(), "Depot opened");

        Ok(Self {
            config,
            db,
            store,
            pipeline,
            files,
            reclaimer,
        })
    }

    pub fn router(&self) -> axum::Router {
        http::router(AppState {
            pipeline: self.pipeline.clone(),
            files: self.files.clone(),
            db: self.db.clone(),
            server: self.config.server.clone(),
        })
    }

    /// Serve HTTP and run the reclaimer until `shutdown` is cancelled
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.server.bind).await?;
        tracing::info!(addr = %listener.local_addr()?, "Listening");

        let reclaimer = self.reclaimer.clone();
        let reclaim_cancel = shutdown.child_token();
        let reclaim_task = tokio::spawn({
            let cancel = reclaim_cancel.clone();
            async move { reclaimer.run(cancel).await }
        });

        let server_shutdown = shutdown.clone();
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;

        reclaim_cancel.cancel();
        if let Err(e) = reclaim_task.await {
            tracing::warn!(error = %e, "Reclaimer task ended abnormally");
        }

        served.map_err(DepotError::Io)
    }
}
