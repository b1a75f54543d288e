//! HTTP surface: ingestion, questions, per-drug status and maintenance.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    error_handling::HandleErrorLayer,
    extract::{Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    BoxError, Json, Router,
};
use chrono::Utc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{PipelineError, StageError};
use crate::models::{
    normalize_drug_name, AnswerResponse, AskRequest, ClearResponse, DrugStatusResponse,
    ErrorResponse, IngestRequest, IngestResponse,
};
use crate::rag::RagEngine;

const DRUG_NAME_CHARS: (usize, usize) = (2, 100);
const QUESTION_CHARS: (usize, usize) = (5, 500);

pub type AppState = Arc<RagEngine>;

/// JSON error with the status derived from the failure kind.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, error: &str, stage: Option<&str>, detail: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.to_string(),
                stage: stage.map(str::to_string),
                detail: detail.into(),
            },
        }
    }

    fn invalid(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_input", None, detail)
    }
}

pub fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::IngestInProgress(_) => StatusCode::CONFLICT,
        PipelineError::UpstreamRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        PipelineError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::UpstreamUnavailable(_)
        | PipelineError::MalformedUpstreamData(_)
        | PipelineError::EmbeddingProvider { .. }
        | PipelineError::Generation { .. } => StatusCode::BAD_GATEWAY,
        PipelineError::DimensionMismatch { .. } | PipelineError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<StageError> for ApiError {
    fn from(err: StageError) -> Self {
        let status = status_for(&err.source);
        if status.is_server_error() {
            tracing::error!("{}", err);
        } else {
            tracing::warn!("{}", err);
        }
        Self::new(status, err.source.kind(), Some(err.stage.as_str()), err.source.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        tracing::error!("Request failed: {}", err);
        Self::new(status_for(&err), err.kind(), None, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn check_length(field: &str, value: &str, (min, max): (usize, usize)) -> Result<(), ApiError> {
    let len = value.trim().chars().count();
    if len < min || len > max {
        return Err(ApiError::invalid(format!(
            "{} must be between {} and {} characters (got {})",
            field, min, max, len
        )));
    }
    Ok(())
}

pub fn router(engine: AppState, allowed_origins: &[String], request_timeout: Duration) -> Router {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };
    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/rag/ingest", post(ingest_handler))
        .route("/api/v1/rag/ask", post(ask_handler))
        .route("/api/v1/rag/drugs/:name", get(drug_status_handler))
        .route("/api/v1/rag/clear", delete(clear_handler))
        .route("/api/health", get(health_check))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout))
                .timeout(request_timeout),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn handle_timeout(err: BoxError) -> (StatusCode, Json<ErrorResponse>) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            Json(ErrorResponse {
                error: "request_timeout".to_string(),
                stage: None,
                detail: "request took too long".to_string(),
            }),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "internal_error".to_string(),
                stage: None,
                detail: err.to_string(),
            }),
        )
    }
}

async fn ingest_handler(
    State(engine): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    check_length("drug_name", &request.drug_name, DRUG_NAME_CHARS)?;
    let drug_name = normalize_drug_name(&request.drug_name);

    let summary = engine.ingest(&drug_name).await?;
    if summary.facts_fetched == 0 {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            Some("fetching"),
            format!("No information found for drug: {}", drug_name),
        ));
    }

    Ok(Json(IngestResponse {
        message: format!(
            "Successfully ingested {} chunks for {}",
            summary.records_written, summary.drug_name
        ),
        drug_name: summary.drug_name,
        facts_fetched: summary.facts_fetched,
        chunks_indexed: summary.records_written,
    }))
}

async fn ask_handler(
    State(engine): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AnswerResponse>, ApiError> {
    check_length("question", &request.question, QUESTION_CHARS)?;
    let drug_name = request
        .drug_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());

    let answer = engine.ask(request.question.trim(), drug_name).await?;
    Ok(Json(answer.into()))
}

async fn drug_status_handler(
    State(engine): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DrugStatusResponse>, ApiError> {
    let drug_name = normalize_drug_name(&name);
    let records = engine.count(Some(&drug_name)).await?;
    let last_ingest_state = engine
        .state_of(&drug_name)
        .await
        .map(|state| state.as_str().to_string());
    Ok(Json(DrugStatusResponse {
        drug_name,
        records,
        last_ingest_state,
    }))
}

async fn clear_handler(State(engine): State<AppState>) -> Result<Json<ClearResponse>, ApiError> {
    let removed = engine.clear().await?;
    Ok(Json(ClearResponse {
        message: format!("Removed {} records", removed),
        records_removed: removed,
    }))
}

async fn health_check(State(engine): State<AppState>) -> Json<serde_json::Value> {
    let records = match engine.count(None).await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!("Health check could not count records: {}", e);
            None
        }
    };
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "records": records,
    }))
}
