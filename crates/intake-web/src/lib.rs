//! HTTP surface for vendor submissions, batch status polling and dead-letter
//! triage.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use intake_adapters::RegistryError;
use intake_core::{ExistingKeyPolicy, ExportFormat, ResolutionError, WarningPolicy};
use intake_pipeline::{IngestPipeline, PipelineError, Submission};
use intake_storage::{JobQueue, StoreError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "intake-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitQuery {
    source: String,
    vendor_reference: Option<String>,
    filename: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StatusQuery {
    error_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    #[serde(default)]
    resolved_by: String,
    notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub source: String,
    pub display_name: String,
    pub format: ExportFormat,
    pub error_threshold_percent: f64,
    pub warning_policy: WarningPolicy,
    pub on_existing: ExistingKeyPolicy,
}

pub fn app(state: AppState) -> Router {
    let body_limit = state.pipeline.options().max_payload_bytes;
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/v1/sources", get(sources_handler))
        .route("/v1/batches", post(submit_handler))
        .route("/v1/batches/{id}", get(batch_status_handler))
        .route("/v1/batches/{id}/failed-rows", get(failed_rows_handler))
        .route("/v1/failed-rows/{id}/resolve", post(resolve_handler))
        .route("/v1/jobs/{id}", get(job_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(Arc::new(state))
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "intake api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving intake api")?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME })).into_response()
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    let sources = state
        .pipeline
        .registry()
        .enabled()
        .map(|s| SourceSummary {
            source: s.source.clone(),
            display_name: s.display_name.clone(),
            format: s.format,
            error_threshold_percent: s.error_threshold_percent,
            warning_policy: s.warning_policy,
            on_existing: s.on_existing,
        })
        .collect::<Vec<_>>();
    Json(sources).into_response()
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubmitQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let format = match state.pipeline.registry().get(&query.source) {
        Ok(source) => source.format,
        Err(err) => return pipeline_error(err.into()),
    };
    if let Some(value) = headers.get(header::CONTENT_TYPE) {
        let accepted = value
            .to_str()
            .map(|v| accepts_content_type(format, v))
            .unwrap_or(false);
        if !accepted {
            return error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("content type is not accepted for {format} exports"),
            );
        }
    }

    let mut submission = Submission::new(query.source, body.to_vec());
    submission.vendor_reference = query.vendor_reference;
    submission.filename = query.filename;
    match state.pipeline.submit(submission).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(err) => pipeline_error(err),
    }
}

async fn batch_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Query(query): Query<StatusQuery>,
) -> Response {
    match state.pipeline.status_report(id, query.error_limit).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => pipeline_error(err),
    }
}

async fn failed_rows_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.pipeline.failed_rows(id).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => pipeline_error(err),
    }
}

async fn resolve_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(request): Json<ResolveRequest>,
) -> Response {
    match state
        .pipeline
        .resolve_failed_row(id, &request.resolved_by, request.notes)
        .await
    {
        Ok(row) => Json(row).into_response(),
        Err(err) => pipeline_error(err),
    }
}

async fn job_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<Uuid>) -> Response {
    match state.pipeline.store().get_job(id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("job {id} not found")),
        Err(err) => pipeline_error(err.into()),
    }
}

/// Generic binary and text types are always accepted; typed ones must agree
/// with the source's declared format.
fn accepts_content_type(format: ExportFormat, value: &str) -> bool {
    let essence = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "" | "application/octet-stream" | "text/plain" => true,
        "text/csv" | "application/csv" => format == ExportFormat::Csv,
        "application/x-ndjson" | "application/jsonl" | "application/jsonlines" => {
            format == ExportFormat::JsonLines
        }
        "application/json" => matches!(format, ExportFormat::JsonLines | ExportFormat::JsonArray),
        _ => false,
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::Resolution(ResolutionError::AlreadyResolved(_)) => StatusCode::CONFLICT,
        StoreError::Resolution(ResolutionError::MissingResolver) => StatusCode::BAD_REQUEST,
        StoreError::LeaseMismatch { .. } | StoreError::Transition(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn pipeline_error(err: PipelineError) -> Response {
    let status = match &err {
        PipelineError::Registry(RegistryError::UnknownSource(_) | RegistryError::Disabled(_)) => {
            StatusCode::BAD_REQUEST
        }
        PipelineError::EmptyPayload => StatusCode::BAD_REQUEST,
        PipelineError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        PipelineError::BatchNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::Store(store) => store_status(store),
        PipelineError::Registry(_) | PipelineError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
