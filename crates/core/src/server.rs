use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, State},
    http::{
        header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::{IngestError, QueryError, StorageError};
use crate::ingest::{mime_from_name, IngestionPipeline, TempUpload, UploadedFile};
use crate::models::{DelegatedCredential, FileOutcome, QueryResolution, StorageSession};
use crate::resolver::QueryResolver;
use crate::storage::StorageConnector;
use crate::traits::MetadataIndex;

const TEXT_FIELDS: [&str; 4] = ["text", "text-input", "query", "message"];

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind: String,
    pub max_upload_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: IngestionPipeline,
    pub resolver: QueryResolver,
    pub storage: Arc<StorageConnector>,
    pub index: Arc<dyn MetadataIndex>,
}

pub fn router(state: AppState, options: &ServerOptions) -> Router {
    Router::new()
        .route("/upload", post(handle_upload))
        .route("/query", post(handle_query))
        .route("/file/{id}", get(handle_file))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(options.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(options: &ServerOptions, state: AppState) -> std::io::Result<()> {
    let app = router(state, options);
    let listener = tokio::net::TcpListener::bind(&options.bind).await?;
    info!(bind = %options.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

// ============ Errors ============

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<IngestError> for AppError {
    fn from(value: IngestError) -> Self {
        match value {
            IngestError::Validation(message) => bad_request(message),
            IngestError::Auth => AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", value.to_string()),
            IngestError::IndexUnavailable(_) => {
                error!(error = %value, "upload batch could not be recorded");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "index_unavailable", value.to_string())
            }
            IngestError::Io(_) => {
                error!(error = %value, "upload failed");
                internal(value.to_string())
            }
        }
    }
}

impl From<QueryError> for AppError {
    fn from(value: QueryError) -> Self {
        match value {
            QueryError::Validation(message) => bad_request(message),
            QueryError::Labeling(_) => {
                AppError::new(StatusCode::BAD_GATEWAY, "labeling_unavailable", value.to_string())
            }
            QueryError::Index(_) => {
                error!(error = %value, "query lookup failed");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "index_unavailable", value.to_string())
            }
        }
    }
}

impl From<StorageError> for AppError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(_) | StorageError::ContainerNotFound(_) => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", value.to_string())
            }
            StorageError::Unauthorized { .. } => {
                AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", value.to_string())
            }
            other => {
                error!(error = %other, "storage read failed");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", other.to_string())
            }
        }
    }
}

fn credential_from(headers: &HeaderMap) -> Result<DelegatedCredential, AppError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(DelegatedCredential::from_authorization)
        .ok_or_else(|| AppError::from(IngestError::Auth))
}

async fn open_session(state: &AppState, headers: &HeaderMap) -> Result<StorageSession, AppError> {
    let credential = credential_from(headers)?;
    Ok(state.storage.open_session(&credential).await?)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /upload ============

#[skip_serializing_none]
#[derive(Serialize)]
struct UploadResponse {
    success: bool,
    results: Vec<FileOutcome>,
    query: Option<UploadQuery>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum UploadQuery {
    Resolved(QueryResolution),
    Failed { error: String },
}

async fn handle_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let session = open_session(&state, &headers).await?;
    let upload_dir = state.pipeline.options().upload_dir.clone();

    let mut files = Vec::new();
    let mut text: Option<String> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|error| bad_request(format!("invalid multipart payload: {error}")))?
    {
        let file_name = field.file_name().map(str::to_string);
        match file_name {
            Some(original_name) => {
                let mime_type = field
                    .content_type()
                    .filter(|mime| !mime.is_empty() && *mime != "application/octet-stream")
                    .map(str::to_string)
                    .unwrap_or_else(|| mime_from_name(&original_name).to_string());

                let mut temp = TempUpload::begin(&upload_dir).await?;
                let mut written = 0usize;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|error| bad_request(format!("invalid file field: {error}")))?
                {
                    written += chunk.len();
                    temp.write_chunk(&chunk).await?;
                }
                temp.finish().await?;

                // Browsers send an empty, nameless part when no file was picked.
                if original_name.trim().is_empty() && written == 0 {
                    temp.remove().await;
                    continue;
                }

                files.push(UploadedFile {
                    original_name,
                    mime_type,
                    temp,
                });
            }
            None if field.name().is_some_and(|name| TEXT_FIELDS.contains(&name)) => {
                let value = field
                    .text()
                    .await
                    .map_err(|error| bad_request(format!("invalid text field: {error}")))?;
                if !value.trim().is_empty() {
                    text = Some(value.trim().to_string());
                }
            }
            None => {}
        }
    }

    if files.is_empty() && text.is_none() {
        return Err(bad_request("no files or text provided"));
    }

    let text_only = files.is_empty();
    let results = if text_only {
        Vec::new()
    } else {
        state.pipeline.ingest(&session, files).await?.results
    };

    // Once files are stored their results are returned even if the text fails.
    let query = match text {
        Some(text) if text_only => Some(UploadQuery::Resolved(
            state.resolver.resolve(&session.owner, &text).await?,
        )),
        Some(text) => match state.resolver.resolve(&session.owner, &text).await {
            Ok(resolution) => Some(UploadQuery::Resolved(resolution)),
            Err(error) => {
                warn!(error = %error, "upload text could not be resolved");
                Some(UploadQuery::Failed {
                    error: error.to_string(),
                })
            }
        },
        None => None,
    };

    Ok(Json(UploadResponse {
        success: true,
        results,
        query,
    }))
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    #[serde(alias = "message", alias = "query")]
    text: String,
}

#[derive(Serialize)]
struct QueryResponse {
    success: bool,
    #[serde(flatten)]
    resolution: QueryResolution,
}

async fn handle_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let session = open_session(&state, &headers).await?;
    let Json(request) = payload.map_err(|rejection| bad_request(rejection.body_text()))?;

    let resolution = state.resolver.resolve(&session.owner, &request.text).await?;
    Ok(Json(QueryResponse {
        success: true,
        resolution,
    }))
}

// ============ GET /file/{id} ============

fn disposition(original_name: &str) -> String {
    let safe: String = original_name
        .chars()
        .map(|ch| if ch == '"' || ch == '\\' || ch.is_control() { '_' } else { ch })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

async fn handle_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let session = open_session(&state, &headers).await?;

    let record = state
        .index
        .find_by_object_id(&session.owner, &id)
        .await
        .map_err(|error| internal(error.to_string()))?
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "not_found", format!("no stored file with id {id}")))?;

    let download = state
        .storage
        .read_object(&session.credential, &record.storage_ref)
        .await?;

    let mut response = Response::new(Body::from_stream(download.body));
    if let Ok(content_type) = HeaderValue::from_str(&record.mime_type) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    if let Ok(value) = HeaderValue::from_str(&disposition(&record.original_name)) {
        response.headers_mut().insert(CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
