//! Sandbox endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use islet_db::{SandboxFilter, SandboxLogRecord, SandboxRecord, SandboxStatus};
use islet_kernel::{ContainerMetrics, ContainerRuntime, CreateSandbox, ReplicateSandbox};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::environments::PortBody;
use crate::server::{require_bearer, ApiError, ApiErrorBody, AppState, Envelope};

const LOGS_PREVIEW: u32 = 10;
const LOGS_DEFAULT_TAIL: u32 = 100;
const LOGS_MAX_TAIL: u32 = 1000;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxBody {
    pub environment_id: Uuid,
    #[serde(default)]
    pub environment_version_id: Option<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
    #[serde(default)]
    pub ports: Option<Vec<PortBody>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicateBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ports: Option<Vec<PortBody>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ExecBody {
    pub command: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecResponse {
    pub exit_code: Option<i64>,
    pub output: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub environment_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResponse {
    pub id: Uuid,
    pub environment_id: Uuid,
    pub environment_version_id: Uuid,
    pub name: String,
    pub status: String,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_ref: Option<String>,
    pub ports: Vec<PortBody>,
    pub provision_progress: u8,
    pub provision_status: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl From<SandboxRecord> for SandboxResponse {
    fn from(record: SandboxRecord) -> Self {
        Self {
            id: record.id,
            environment_id: record.environment_id,
            environment_version_id: record.environment_version_id,
            name: record.name,
            status: record.status.as_str().to_string(),
            phase: record.phase.as_str().to_string(),
            container_ref: record.container_ref,
            ports: record.ports.into_iter().map(PortBody::from).collect(),
            provision_progress: record.provision_progress,
            provision_status: record.provision_status,
            created_at: record.created_at.to_rfc3339(),
            started_at: record.started_at.map(|ts| ts.to_rfc3339()),
            stopped_at: record.stopped_at.map(|ts| ts.to_rfc3339()),
            expires_at: record.expires_at.map(|ts| ts.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogEntryResponse {
    pub stream: String,
    pub text: String,
    pub timestamp: String,
}

impl From<SandboxLogRecord> for LogEntryResponse {
    fn from(record: SandboxLogRecord) -> Self {
        Self {
            stream: record.stream.as_str().to_string(),
            text: record.text,
            timestamp: record.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxDetailResponse {
    #[serde(flatten)]
    pub sandbox: SandboxResponse,
    pub logs_preview: Vec<LogEntryResponse>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
}

impl From<ContainerMetrics> for MetricsResponse {
    fn from(metrics: ContainerMetrics) -> Self {
        Self {
            cpu_percent: metrics.cpu_percent,
            memory_usage_bytes: metrics.memory_usage_bytes,
            memory_limit_bytes: metrics.memory_limit_bytes,
            memory_percent: metrics.memory_percent,
            network_rx_bytes: metrics.network_rx_bytes,
            network_tx_bytes: metrics.network_tx_bytes,
            block_read_bytes: metrics.block_read_bytes,
            block_write_bytes: metrics.block_write_bytes,
        }
    }
}

#[utoipa::path(
    post,
    path = "/sandboxes",
    request_body = CreateSandboxBody,
    responses(
        (status = 201, description = "Sandbox accepted; provisioning runs asynchronously", body = SandboxResponse),
        (status = 400, description = "Invalid request", body = ApiErrorBody),
        (status = 404, description = "Unknown environment or version", body = ApiErrorBody),
        (status = 429, description = "Sandbox quota reached", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn create<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Json(body): Json<CreateSandboxBody>,
) -> Result<(StatusCode, Json<Envelope<SandboxResponse>>), ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let record = state
        .kernel
        .sandboxes()
        .create(
            identity.user_id,
            CreateSandbox {
                environment_id: body.environment_id,
                environment_version_id: body.environment_version_id,
                name: body.name,
                ttl_seconds: body.ttl_seconds,
                ports: body
                    .ports
                    .map(|ports| ports.into_iter().map(Into::into).collect()),
                env: body.env,
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Envelope::ok(SandboxResponse::from(record)),
    ))
}

#[utoipa::path(
    get,
    path = "/sandboxes",
    params(ListQuery),
    responses(
        (status = 200, description = "List sandboxes", body = [SandboxResponse]),
        (status = 400, description = "Invalid status filter", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn list<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Envelope<Vec<SandboxResponse>>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;

    let status = match query.status.as_deref() {
        Some(raw) => Some(
            SandboxStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status filter: {raw}")))?,
        ),
        None => None,
    };
    let filter = SandboxFilter {
        status,
        environment_id: query.environment_id,
    };

    let records = state.kernel.sandboxes().list(identity.user_id, &filter).await?;
    Ok(Envelope::ok(
        records.into_iter().map(SandboxResponse::from).collect(),
    ))
}

#[utoipa::path(
    get,
    path = "/sandboxes/{id}",
    params(("id" = Uuid, Path, description = "Sandbox identifier")),
    responses(
        (status = 200, description = "Sandbox details with a log preview", body = SandboxDetailResponse),
        (status = 404, description = "Unknown sandbox", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn fetch<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<SandboxDetailResponse>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let mut record = state.kernel.sandboxes().get(identity.user_id, id).await?;

    // Self-heal rows that claim to be running: reconcile with the runtime
    // before answering. A runtime hiccup falls back to the stored row.
    if record.status == SandboxStatus::Running {
        if let Ok(synced) = state.kernel.sandboxes().sync(identity.user_id, id).await {
            record = synced;
        }
    }

    let preview = state
        .kernel
        .sandboxes()
        .logs(identity.user_id, id, LOGS_PREVIEW)
        .await?;
    Ok(Envelope::ok(SandboxDetailResponse {
        sandbox: SandboxResponse::from(record),
        logs_preview: preview.into_iter().map(LogEntryResponse::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/sandboxes/{id}/start",
    params(("id" = Uuid, Path, description = "Sandbox identifier")),
    responses(
        (status = 200, description = "Sandbox state after the call", body = SandboxResponse),
        (status = 404, description = "Unknown sandbox", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn start<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<SandboxResponse>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let record = state.kernel.sandboxes().start(identity.user_id, id).await?;
    Ok(Envelope::ok(SandboxResponse::from(record)))
}

#[utoipa::path(
    post,
    path = "/sandboxes/{id}/stop",
    params(("id" = Uuid, Path, description = "Sandbox identifier")),
    responses(
        (status = 200, description = "Sandbox state after the call", body = SandboxResponse),
        (status = 404, description = "Unknown sandbox", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn stop<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<SandboxResponse>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let record = state.kernel.sandboxes().stop(identity.user_id, id).await?;
    Ok(Envelope::ok(SandboxResponse::from(record)))
}

#[utoipa::path(
    post,
    path = "/sandboxes/{id}/restart",
    params(("id" = Uuid, Path, description = "Sandbox identifier")),
    responses(
        (status = 200, description = "Sandbox state after the call", body = SandboxResponse),
        (status = 404, description = "Unknown sandbox", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn restart<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<SandboxResponse>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let record = state.kernel.sandboxes().restart(identity.user_id, id).await?;
    Ok(Envelope::ok(SandboxResponse::from(record)))
}

#[utoipa::path(
    post,
    path = "/sandboxes/{id}/replicate",
    params(("id" = Uuid, Path, description = "Sandbox identifier")),
    request_body = ReplicateBody,
    responses(
        (status = 201, description = "Replica accepted", body = SandboxResponse),
        (status = 404, description = "Unknown sandbox", body = ApiErrorBody),
        (status = 409, description = "No free host port", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn replicate<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ReplicateBody>,
) -> Result<(StatusCode, Json<Envelope<SandboxResponse>>), ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let record = state
        .kernel
        .sandboxes()
        .replicate(
            identity.user_id,
            id,
            ReplicateSandbox {
                name: body.name,
                ports: body
                    .ports
                    .map(|ports| ports.into_iter().map(Into::into).collect()),
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Envelope::ok(SandboxResponse::from(record)),
    ))
}

#[utoipa::path(
    delete,
    path = "/sandboxes/{id}",
    params(("id" = Uuid, Path, description = "Sandbox identifier")),
    responses(
        (status = 200, description = "Sandbox destroyed"),
        (status = 404, description = "Unknown sandbox", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn destroy<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<serde_json::Value>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    if !state.kernel.sandboxes().destroy(identity.user_id, id).await? {
        return Err(ApiError::not_found("sandbox not found"));
    }
    Ok(Envelope::ok(json!({ "deleted": true })))
}

#[utoipa::path(
    get,
    path = "/sandboxes/{id}/logs",
    params(("id" = Uuid, Path, description = "Sandbox identifier"), LogsQuery),
    responses(
        (status = 200, description = "Recent log entries", body = [LogEntryResponse]),
        (status = 404, description = "Unknown sandbox", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn logs<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Envelope<Vec<LogEntryResponse>>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let tail = query.tail.unwrap_or(LOGS_DEFAULT_TAIL).min(LOGS_MAX_TAIL);
    let entries = state.kernel.sandboxes().logs(identity.user_id, id, tail).await?;
    Ok(Envelope::ok(
        entries.into_iter().map(LogEntryResponse::from).collect(),
    ))
}

#[utoipa::path(
    get,
    path = "/sandboxes/{id}/metrics",
    params(("id" = Uuid, Path, description = "Sandbox identifier")),
    responses(
        (status = 200, description = "One-shot resource usage", body = MetricsResponse),
        (status = 404, description = "Unknown sandbox", body = ApiErrorBody),
        (status = 409, description = "Sandbox not running", body = ApiErrorBody),
        (status = 503, description = "Metrics unavailable", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn metrics<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<MetricsResponse>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let sample = state.kernel.sandboxes().metrics(identity.user_id, id).await?;
    Ok(Envelope::ok(MetricsResponse::from(sample)))
}

#[utoipa::path(
    post,
    path = "/sandboxes/{id}/exec",
    params(("id" = Uuid, Path, description = "Sandbox identifier")),
    request_body = ExecBody,
    responses(
        (status = 200, description = "Command output", body = ExecResponse),
        (status = 404, description = "Unknown sandbox", body = ApiErrorBody),
        (status = 409, description = "Sandbox not running", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn exec<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ExecBody>,
) -> Result<Json<Envelope<ExecResponse>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let outcome = state
        .kernel
        .sandboxes()
        .exec(identity.user_id, id, &body.command)
        .await?;
    Ok(Envelope::ok(ExecResponse {
        exit_code: outcome.exit_code,
        output: outcome.output,
    }))
}
