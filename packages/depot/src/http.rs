// HTTP surface
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::db::MetadataDb;
use crate::error::DepotError;
use crate::models::{FileRecord, Page, PresignedUrl, StoreStats};
use crate::pipeline::{UploadPipeline, UploadRequest};
use crate::service::FileService;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<UploadPipeline>,
    pub files: Arc<FileService>,
    pub db: Arc<MetadataDb>,
    pub server: ServerConfig,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/files", post(upload_file).get(list_files))
        .route(
            "/files/batch",
            // Per-file size limits are enforced by the pipeline
            post(upload_batch).layer(DefaultBodyLimit::disable()),
        )
        .route("/files/{id}", get(download_file).delete(delete_file))
        .route("/files/{id}/metadata", get(file_metadata))
        .route("/files/{id}/url", get(presigned_url))
        .route("/files/{id}/restore", post(restore_file))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    error: &'static str,
    message: String,
}

/// Seconds a client should wait before retrying a conflict or outage
const RETRY_AFTER_SECS: &str = "1";

impl DepotError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            DepotError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            DepotError::PayloadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            DepotError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            DepotError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            DepotError::Unsupported(_) => (StatusCode::NOT_IMPLEMENTED, "unsupported"),
            DepotError::BackendRejected(msg) => {
                tracing::error!("Backend rejected request: {}", msg);
                (StatusCode::BAD_GATEWAY, "backend_rejected")
            }
            DepotError::BackendUnavailable(msg) => {
                tracing::error!("Backend unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable")
            }
            DepotError::Io(e) => {
                tracing::error!("IO error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "io")
            }
            DepotError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }

    fn body(&self) -> ErrorBody {
        let (status, error) = self.status();
        ErrorBody {
            code: status.as_u16(),
            error,
            message: self.to_string(),
        }
    }
}

impl IntoResponse for DepotError {
    fn into_response(self) -> Response {
        let body = self.body();
        let status = StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut response = (status, Json(body)).into_response();
        if self.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    filename: Option<String>,
    id: Option<Uuid>,
}

/// POST /files
async fn upload_file(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<FileRecord>), DepotError> {
    let limit = state.pipeline.limits().max_file_size;
    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared_len.is_some_and(|len| len > limit) {
        return Err(DepotError::PayloadTooLarge { limit });
    }

    let request = UploadRequest {
        id: params.id,
        filename: params.filename,
        declared_content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    let stream = Box::pin(body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other)));
    let outcome = state.pipeline.upload(request, stream).await?;

    Ok((StatusCode::CREATED, Json(outcome.record)))
}

#[derive(Serialize)]
struct BatchItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<FileRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

/// POST /files/batch
///
/// Every multipart field is stored as its own file. A failing file does not
/// abort the others; the response is 207 when any of them failed.
async fn upload_batch(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<BatchItem>>), DepotError> {
    let max_files = state.pipeline.limits().max_batch_files;
    let mut items = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| DepotError::Validation(format!("malformed multipart body: {}", e)))?
    {
        if items.len() == max_files {
            return Err(DepotError::Validation(format!(
                "at most {} files per batch",
                max_files
            )));
        }

        let request = UploadRequest {
            id: None,
            filename: field.file_name().map(str::to_string),
            declared_content_type: field.content_type().map(str::to_string),
        };
        let filename = request.filename.clone();

        let stream = Box::pin(field.map(|chunk| chunk.map_err(io::Error::other)));
        let item = match state.pipeline.upload(request, stream).await {
            Ok(outcome) => BatchItem {
                filename,
                record: Some(outcome.record),
                error: None,
            },
            Err(e) => {
                tracing::warn!(filename = ?filename, error = %e, "Batch item failed");
                BatchItem {
                    filename,
                    record: None,
                    error: Some(e.body()),
                }
            }
        };
        items.push(item);
    }

    if items.is_empty() {
        return Err(DepotError::Validation("no files in multipart body".into()));
    }

    let status = if items.iter().all(|item| item.error.is_none()) {
        StatusCode::CREATED
    } else {
        StatusCode::MULTI_STATUS
    };
    Ok((status, Json(items)))
}

/// GET /files/{id}
async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, DepotError> {
    let (record, stream) = state.files.get(id).await?;

    let content_type = HeaderValue::from_str(&record.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, record.size)
        .header(header::CONTENT_DISPOSITION, content_disposition(&record))
        .header(header::ETAG, format!("\"{}\"", record.digest))
        .body(Body::from_stream(stream))
        .map_err(|e| DepotError::Internal(format!("Failed to build response: {}", e)))
}

fn content_disposition(record: &FileRecord) -> String {
    match &record.filename {
        Some(name) => {
            let fallback: String = name
                .chars()
                .map(|c| match c {
                    '"' | '\\' => '_',
                    c if c.is_ascii() && !c.is_ascii_control() => c,
                    _ => '_',
                })
                .collect();
            format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                fallback,
                urlencoding::encode(name)
            )
        }
        None => "attachment".to_string(),
    }
}

/// GET /files/{id}/metadata
async fn file_metadata(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<FileRecord>, DepotError> {
    Ok(Json(state.files.describe(id).await?))
}

#[derive(Debug, Deserialize)]
struct PresignParams {
    expires_in: Option<u64>,
}

/// GET /files/{id}/url
async fn presigned_url(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<PresignParams>,
) -> Result<Json<PresignedUrl>, DepotError> {
    let expires_in = state.server.clamp_presign_expiry(params.expires_in);
    Ok(Json(state.files.presign(id, expires_in).await?))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<u32>,
    offset: Option<u32>,
}

/// GET /files
async fn list_files(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Page<FileRecord>>, DepotError> {
    Ok(Json(state.files.list(params.limit, params.offset).await?))
}

/// DELETE /files/{id}
async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, DepotError> {
    state.files.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /files/{id}/restore
async fn restore_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<FileRecord>, DepotError> {
    Ok(Json(state.files.restore(id).await?))
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    stats: StoreStats,
}

/// GET /health
async fn health(State(state): State<AppState>) -> Result<Json<HealthBody>, DepotError> {
    state.db.health_check().await?;
    let stats = state.db.stats().await?;
    Ok(Json(HealthBody { status: "ok", stats }))
}
