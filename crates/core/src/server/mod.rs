use std::sync::Arc;
use std::time::Instant;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{InferenceEngine, ModelSummary, PredictOptions, PredictionRecord};
use crate::error::ChdError;
use crate::history::{HistoryEntry, HistoryStore, InMemoryHistory};
use crate::logging;

/// Radiographs are routinely several megabytes; axum's default is 2 MiB.
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;
pub const UPLOAD_FIELD: &str = "file";

#[derive(Clone)]
pub struct AppState {
    engine: Arc<InferenceEngine>,
    history: Arc<dyn HistoryStore>,
}

impl AppState {
    pub fn new(engine: InferenceEngine) -> Self {
        Self::with_history(Arc::new(engine), Arc::new(InMemoryHistory::new()))
    }

    pub fn with_history(engine: Arc<InferenceEngine>, history: Arc<dyn HistoryStore>) -> Self {
        Self { engine, history }
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    pub fn history(&self) -> &dyn HistoryStore {
        self.history.as_ref()
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PredictQuery {
    pub explain: Option<bool>,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/model", get(model_summary))
        .route("/predict", post(predict))
        .route("/history", get(list_history))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn model_summary(State(state): State<AppState>) -> Json<ModelSummary> {
    Json(state.engine().summary().clone())
}

async fn list_history(State(state): State<AppState>) -> Json<Vec<HistoryEntry>> {
    Json(state.history().list())
}

async fn predict(
    State(state): State<AppState>,
    Query(query): Query<PredictQuery>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionRecord>, AppError> {
    let request_id = Uuid::new_v4();
    let started = Instant::now();

    let multipart = multipart.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let bytes = read_upload(multipart).await?;

    let mut options = state.engine().default_options();
    if let Some(explain) = query.explain {
        options.explain = explain;
    }

    logging::record_crash_context("server.last_request_id", request_id.to_string());
    let engine = Arc::clone(&state.engine);
    let record = tokio::task::spawn_blocking(move || predict_blocking(&engine, &bytes, options))
        .await
        .map_err(|e| AppError::Internal(format!("task join error: {e}")))??;

    state
        .history()
        .append(HistoryEntry::now(record.label, record.confidence));

    info!(
        %request_id,
        label = %record.label,
        confidence = record.confidence,
        overlay = record.overlay.is_some(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Prediction served"
    );
    Ok(Json(record))
}

fn predict_blocking(
    engine: &InferenceEngine,
    bytes: &[u8],
    options: PredictOptions,
) -> Result<PredictionRecord, ChdError> {
    engine.predict_bytes(bytes, options)
}

async fn read_upload(mut multipart: Multipart) -> Result<Vec<u8>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("malformed multipart body: {}", e.body_text())))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("failed to read upload: {}", e.body_text())))?;
        if data.is_empty() {
            return Err(AppError::BadRequest("uploaded file is empty".to_string()));
        }
        return Ok(data.to_vec());
    }
    Err(AppError::BadRequest(format!(
        "missing multipart field '{UPLOAD_FIELD}'"
    )))
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<ChdError> for AppError {
    fn from(err: ChdError) -> Self {
        match err {
            ChdError::InvalidImage(_) => AppError::BadRequest(err.to_string()),
            other => {
                warn!(error = %other, code = other.code(), "Prediction failed");
                AppError::Internal(other.to_string())
            }
        }
    }
}
