//! HTTP/JSON coordination protocol.
//!
//! Every stage-scoped call carries the stage identity as `?stage=<name>`.
//! Errors are returned as `{"kind": ..., "error": ...}` with a status code
//! derived from the error variant, so the client can rebuild the variant.

use crate::data_model::{ClaimToken, Document};
use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use crate::query::Query;
use crate::status::{PipelineStatus, StatusTracker};
use crate::store::{
    ArtifactRepository, AttachmentInfo, AttachmentRepository, CommitReceipt, DocumentStore,
};
use crate::utils::metrics_handler;
use crate::utils::prometheus_metrics::{HTTP_ERRORS_TOTAL, HTTP_REQUESTS_TOTAL};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query as QueryParams, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared state of all handlers.
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub artifacts: ArtifactRepository,
    pub attachments: AttachmentRepository,
    pub server_id: String,
    /// stage -> last heartbeat
    pub heartbeats: RwLock<HashMap<String, DateTime<Utc>>>,
    /// Woken when a new pipeline is deployed.
    pub redeploy: Arc<Notify>,
    /// Woken when a commit made a document archivable.
    pub rollover: Arc<Notify>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        artifacts: ArtifactRepository,
        attachments: AttachmentRepository,
    ) -> Self {
        AppState {
            store,
            artifacts,
            attachments,
            server_id: Uuid::new_v4().to_string(),
            heartbeats: RwLock::new(HashMap::new()),
            redeploy: Arc::new(Notify::new()),
            rollover: Arc::new(Notify::new()),
        }
    }
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
pub struct StageParam {
    pub stage: String,
}

impl StageParam {
    fn name(&self) -> Result<&str> {
        let stage = self.stage.trim();
        if stage.is_empty() {
            return Err(PipelineError::ProtocolError(
                "missing stage identity".to_string(),
            ));
        }
        Ok(stage)
    }
}

#[derive(Debug, Deserialize)]
pub struct ClaimParams {
    pub stage: String,
    /// Reissue documents this stage last claimed at least this many milliseconds ago.
    #[serde(default)]
    pub recurring_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub skip: usize,
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct LookupParams {
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub document: Option<Document>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdRequest {
    pub id: String,
}

/// Names one claim of the calling stage.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimRef {
    pub id: String,
    pub token: ClaimToken,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InsertResponse {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ArtifactResponse {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeployResponse {
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub server_id: String,
    /// The stage is part of the deployed pipeline and scheduled.
    pub stage_known: bool,
    pub status: PipelineStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub error: String,
}

// --- Error mapping ---

pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::MalformedQuery(_)
        | PipelineError::InvalidPipeline(_)
        | PipelineError::ConfigValidationError(_)
        | PipelineError::ProtocolError(_)
        | PipelineError::SerializationError { .. } => StatusCode::BAD_REQUEST,
        PipelineError::DuplicateId(_) | PipelineError::ClaimLost(_) => StatusCode::CONFLICT,
        PipelineError::DocumentNotFound(_)
        | PipelineError::ArtifactNotFound(_)
        | PipelineError::AttachmentNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        HTTP_ERRORS_TOTAL.inc();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            debug!(error = %self.0, "Request rejected");
        }
        // Messages travel without the variant's display prefix; `kind` carries the variant.
        let message = match &self.0 {
            PipelineError::MalformedQuery(m)
            | PipelineError::DuplicateId(m)
            | PipelineError::DocumentNotFound(m)
            | PipelineError::StoreUnavailable(m)
            | PipelineError::ArtifactNotFound(m)
            | PipelineError::AttachmentNotFound(m)
            | PipelineError::ClaimLost(m)
            | PipelineError::InvalidPipeline(m)
            | PipelineError::ConfigValidationError(m)
            | PipelineError::ProtocolError(m) => m.clone(),
            other => other.to_string(),
        };
        let body = ErrorBody {
            kind: self.0.kind().to_string(),
            error: message,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// --- Handlers ---

async fn insert_handler(
    State(state): State<Arc<AppState>>,
    Json(doc): Json<Document>,
) -> ApiResult<(StatusCode, Json<InsertResponse>)> {
    let id = state.store.insert(doc).await?;
    Ok((StatusCode::CREATED, Json(InsertResponse { id })))
}

async fn claim_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<ClaimParams>,
    Json(query): Json<Query>,
) -> ApiResult<Json<ClaimResponse>> {
    let stage = params.stage.trim();
    if stage.is_empty() {
        return Err(PipelineError::ProtocolError("missing stage identity".to_string()).into());
    }
    let document = match params.recurring_interval_ms {
        Some(ms) => {
            state
                .store
                .claim_recurring(&query, stage, Duration::from_millis(ms))
                .await?
        }
        None => state.store.claim_and_tag(&query, stage).await?,
    };
    Ok(Json(ClaimResponse { document }))
}

async fn commit_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<StageParam>,
    Json(doc): Json<Document>,
) -> ApiResult<Json<CommitReceipt>> {
    let stage = params.name()?;
    let receipt = state.store.mark_processed(doc, stage).await?;
    if receipt.archivable {
        state.rollover.notify_one();
    }
    Ok(Json(receipt))
}

async fn release_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<StageParam>,
    Json(req): Json<ClaimRef>,
) -> ApiResult<Json<Ack>> {
    let stage = params.name()?;
    state.store.release(&req.id, stage, req.token).await?;
    Ok(Json(Ack { ok: true }))
}

async fn pending_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<StageParam>,
    Json(req): Json<ClaimRef>,
) -> ApiResult<Json<Ack>> {
    let stage = params.name()?;
    state.store.mark_pending(&req.id, stage, req.token).await?;
    Ok(Json(Ack { ok: true }))
}

async fn write_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<StageParam>,
    Json(doc): Json<Document>,
) -> ApiResult<Json<Ack>> {
    let stage = params.name()?;
    state.store.write_partial(doc, stage).await?;
    Ok(Json(Ack { ok: true }))
}

async fn touch_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<StageParam>,
    Json(req): Json<IdRequest>,
) -> ApiResult<Json<Ack>> {
    let stage = params.name()?;
    state.store.mark_touched(&req.id, stage).await?;
    Ok(Json(Ack { ok: true }))
}

async fn discard_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<StageParam>,
    Json(doc): Json<Document>,
) -> ApiResult<Json<Ack>> {
    let stage = params.name()?;
    state.store.mark_discarded(doc, stage).await?;
    Ok(Json(Ack { ok: true }))
}

async fn fail_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<StageParam>,
    Json(doc): Json<Document>,
) -> ApiResult<Json<Ack>> {
    let stage = params.name()?;
    state.store.mark_failed(doc, stage).await?;
    Ok(Json(Ack { ok: true }))
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(page): QueryParams<PageParams>,
    Json(query): Json<Query>,
) -> ApiResult<Json<Vec<Document>>> {
    let docs = state.store.get_documents(&query, page.limit, page.skip).await?;
    Ok(Json(docs))
}

async fn get_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    QueryParams(params): QueryParams<LookupParams>,
) -> ApiResult<Json<Document>> {
    match state
        .store
        .get_document_by_id(&id, params.include_archived)
        .await?
    {
        Some(doc) => Ok(Json(doc)),
        None => Err(PipelineError::DocumentNotFound(id).into()),
    }
}

async fn upload_artifact_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ArtifactResponse>)> {
    if body.is_empty() {
        return Err(PipelineError::ProtocolError("empty artifact".to_string()).into());
    }
    let id = state.artifacts.put(&body).await?;
    Ok((StatusCode::CREATED, Json(ArtifactResponse { id })))
}

async fn get_artifact_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let bytes = state.artifacts.get(&id).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

async fn put_attachment_handler(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
    QueryParams(params): QueryParams<StageParam>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<AttachmentInfo>)> {
    let stage = params.name()?;
    if state.store.get_document_by_id(&id, false).await?.is_none() {
        return Err(PipelineError::DocumentNotFound(id).into());
    }
    let mimetype = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let info = state
        .attachments
        .put(&id, &name, Some(stage), mimetype, &body)
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn list_attachments_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<AttachmentInfo>>> {
    if state.store.get_document_by_id(&id, true).await?.is_none() {
        return Err(PipelineError::DocumentNotFound(id).into());
    }
    Ok(Json(state.attachments.list(&id).await?))
}

async fn get_attachment_handler(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (info, bytes) = state.attachments.get(&id, &name).await?;
    let mimetype = info
        .mimetype
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok(([(header::CONTENT_TYPE, mimetype)], bytes).into_response())
}

async fn delete_attachment_handler(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
    QueryParams(params): QueryParams<StageParam>,
) -> ApiResult<Json<Ack>> {
    let stage = params.name()?;
    state.attachments.delete(&id, &name).await?;
    debug!(doc_id = %id, file = %name, stage = %stage, "Attachment deleted by stage");
    Ok(Json(Ack { ok: true }))
}

async fn get_pipeline_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Pipeline>> {
    match state.store.load_pipeline().await? {
        Some(p) => Ok(Json(p)),
        None => Err(PipelineError::DocumentNotFound("pipeline".to_string()).into()),
    }
}

async fn put_pipeline_handler(
    State(state): State<Arc<AppState>>,
    Json(pipeline): Json<Pipeline>,
) -> ApiResult<Json<DeployResponse>> {
    let name = pipeline.name.clone();
    let version = state.store.save_pipeline(pipeline).await?;
    info!(pipeline = %name, version, "Pipeline deployed, notifying supervisor");
    state.redeploy.notify_one();
    Ok(Json(DeployResponse { version }))
}

async fn stage_properties_handler(
    State(state): State<Arc<AppState>>,
    Path(stage): Path<String>,
) -> ApiResult<Json<Map<String, Value>>> {
    let pipeline = state.store.load_pipeline().await?;
    match pipeline
        .as_ref()
        .and_then(|p| p.stage(&stage))
        .filter(|s| s.mode.is_scheduled())
    {
        Some(s) => Ok(Json(s.properties.clone())),
        None => Err(PipelineError::DocumentNotFound(format!("stage '{}'", stage)).into()),
    }
}

async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<StageParam>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let stage = params.name()?.to_string();
    let stage_known = state
        .store
        .load_pipeline()
        .await?
        .and_then(|p| p.stage(&stage).map(|s| s.mode.is_scheduled()))
        .unwrap_or(false);
    if stage_known {
        state.heartbeats.write().await.insert(stage, Utc::now());
    } else {
        // Unscheduled names are not recorded, so the map stays bounded by the pipeline.
        warn!(stage = %stage, "Heartbeat from a stage that is not scheduled");
    }
    let status = StatusTracker::snapshot(state.store.as_ref()).await?;
    Ok(Json(HeartbeatResponse {
        server_id: state.server_id.clone(),
        stage_known,
        status,
    }))
}

async fn heartbeats_handler(
    State(state): State<Arc<AppState>>,
) -> Json<HashMap<String, DateTime<Utc>>> {
    Json(state.heartbeats.read().await.clone())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<PipelineStatus>> {
    Ok(Json(StatusTracker::snapshot(state.store.as_ref()).await?))
}

async fn count_requests(req: Request, next: Next) -> Response {
    HTTP_REQUESTS_TOTAL.inc();
    next.run(req).await
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/heartbeat", post(heartbeat_handler))
        .route("/heartbeats", get(heartbeats_handler))
        .route("/documents", post(insert_handler))
        .route("/documents/claim", post(claim_handler))
        .route("/documents/commit", post(commit_handler))
        .route("/documents/release", post(release_handler))
        .route("/documents/pending", post(pending_handler))
        .route("/documents/write", post(write_handler))
        .route("/documents/touch", post(touch_handler))
        .route("/documents/discard", post(discard_handler))
        .route("/documents/fail", post(fail_handler))
        .route("/documents/query", post(query_handler))
        .route("/documents/:id", get(get_document_handler))
        .route("/documents/:id/files", get(list_attachments_handler))
        .route(
            "/documents/:id/files/:name",
            put(put_attachment_handler)
                .get(get_attachment_handler)
                .delete(delete_attachment_handler),
        )
        .route("/artifacts", post(upload_artifact_handler))
        .route("/artifacts/:id", get(get_artifact_handler))
        .route(
            "/pipeline",
            get(get_pipeline_handler).put(put_pipeline_handler),
        )
        .route("/stages/:stage/properties", get(stage_properties_handler))
        .layer(middleware::from_fn(count_requests))
        .layer(DefaultBodyLimit::max(256 * 1024 * 1024))
        .with_state(state)
}

/// Serves the protocol on `listener` until `shutdown` is cancelled.
pub async fn run_server(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Coordination protocol listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Coordination protocol stopped");
    Ok(())
}
