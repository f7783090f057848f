//! Environment endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use islet_db::{EnvironmentRecord, EnvironmentVersionRecord, PortMapping};
use islet_kernel::{ContainerRuntime, EnvironmentPatch, EnvironmentSpec};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::server::{require_bearer, ApiError, ApiErrorBody, AppState, Envelope};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct PortBody {
    pub container: u16,
    pub host: u16,
}

impl From<PortBody> for PortMapping {
    fn from(body: PortBody) -> Self {
        PortMapping {
            container: body.container,
            host: body.host,
        }
    }
}

impl From<PortMapping> for PortBody {
    fn from(mapping: PortMapping) -> Self {
        PortBody {
            container: mapping.container,
            host: mapping.host,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironmentBody {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub build_files: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub cpu: Option<f64>,
    /// Memory limit in MB.
    #[serde(default)]
    pub memory: Option<i64>,
    #[serde(default)]
    pub ports: Vec<PortBody>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvironmentBody {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub build_files: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub memory: Option<i64>,
    #[serde(default)]
    pub ports: Option<Vec<PortBody>>,
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub mounts: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetSecretBody {
    pub key: String,
    pub value: String,
}

/// Secrets never leave the server; listings carry the key name only.
#[derive(Debug, Serialize, ToSchema)]
pub struct SecretEntry {
    pub key: String,
    pub redacted: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    pub id: Uuid,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    pub cpu: f64,
    pub memory: i64,
    pub ports: Vec<PortBody>,
    pub env: BTreeMap<String, String>,
    pub secrets: Vec<SecretEntry>,
    pub mounts: Vec<String>,
    pub created_at: String,
}

impl From<EnvironmentVersionRecord> for VersionResponse {
    fn from(record: EnvironmentVersionRecord) -> Self {
        Self {
            id: record.id,
            version: record.version,
            image: record.image,
            dockerfile: record.dockerfile,
            command: record.command,
            cpu: record.cpu,
            memory: record.memory_mb,
            ports: record.ports.into_iter().map(PortBody::from).collect(),
            env: record.env,
            secrets: record
                .secrets_encrypted
                .keys()
                .map(|key| SecretEntry {
                    key: key.clone(),
                    redacted: true,
                })
                .collect(),
            mounts: record.mounts,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentResponse {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<VersionResponse>,
    pub created_at: String,
    pub updated_at: String,
}

impl EnvironmentResponse {
    fn from_parts(env: EnvironmentRecord, version: Option<EnvironmentVersionRecord>) -> Self {
        Self {
            id: env.id,
            name: env.name,
            current_version: version.map(VersionResponse::from),
            created_at: env.created_at.to_rfc3339(),
            updated_at: env.updated_at.to_rfc3339(),
        }
    }
}

fn spec_from_body(body: CreateEnvironmentBody) -> EnvironmentSpec {
    EnvironmentSpec {
        name: body.name,
        image: body.image,
        dockerfile: body.dockerfile,
        build_files: body.build_files,
        command: body.command,
        cpu: body.cpu,
        memory_mb: body.memory,
        ports: body.ports.into_iter().map(PortMapping::from).collect(),
        env: body.env,
        mounts: body.mounts,
    }
}

#[utoipa::path(
    post,
    path = "/environments",
    request_body = CreateEnvironmentBody,
    responses(
        (status = 201, description = "Environment created", body = EnvironmentResponse),
        (status = 400, description = "Invalid configuration", body = ApiErrorBody),
        (status = 409, description = "Duplicate name", body = ApiErrorBody),
        (status = 429, description = "Environment quota reached", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn create<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Json(body): Json<CreateEnvironmentBody>,
) -> Result<(StatusCode, Json<Envelope<EnvironmentResponse>>), ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let (env, version) = state
        .kernel
        .environments()
        .create(identity.user_id, spec_from_body(body))
        .await?;
    Ok((
        StatusCode::CREATED,
        Envelope::ok(EnvironmentResponse::from_parts(env, Some(version))),
    ))
}

#[utoipa::path(
    get,
    path = "/environments",
    responses((status = 200, description = "List environments", body = [EnvironmentResponse])),
    security(("bearerAuth" = []))
)]
pub async fn list<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
) -> Result<Json<Envelope<Vec<EnvironmentResponse>>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let entries = state.kernel.environments().list(identity.user_id).await?;
    Ok(Envelope::ok(
        entries
            .into_iter()
            .map(|(env, version)| EnvironmentResponse::from_parts(env, version))
            .collect(),
    ))
}

#[utoipa::path(
    get,
    path = "/environments/{id}",
    params(("id" = Uuid, Path, description = "Environment identifier")),
    responses(
        (status = 200, description = "Environment details", body = EnvironmentResponse),
        (status = 404, description = "Unknown environment", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn fetch<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<EnvironmentResponse>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let (env, version) = state.kernel.environments().get(identity.user_id, id).await?;
    Ok(Envelope::ok(EnvironmentResponse::from_parts(env, version)))
}

#[utoipa::path(
    put,
    path = "/environments/{id}",
    params(("id" = Uuid, Path, description = "Environment identifier")),
    request_body = UpdateEnvironmentBody,
    responses(
        (status = 200, description = "New version appended", body = EnvironmentResponse),
        (status = 404, description = "Unknown environment", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn update<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateEnvironmentBody>,
) -> Result<Json<Envelope<EnvironmentResponse>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let patch = EnvironmentPatch {
        image: body.image,
        dockerfile: body.dockerfile,
        build_files: body.build_files,
        command: body.command,
        cpu: body.cpu,
        memory_mb: body.memory,
        ports: body
            .ports
            .map(|ports| ports.into_iter().map(PortMapping::from).collect()),
        env: body.env,
        mounts: body.mounts,
    };
    let (env, version) = state
        .kernel
        .environments()
        .update(identity.user_id, id, patch)
        .await?;
    Ok(Envelope::ok(EnvironmentResponse::from_parts(
        env,
        Some(version),
    )))
}

#[utoipa::path(
    delete,
    path = "/environments/{id}",
    params(("id" = Uuid, Path, description = "Environment identifier")),
    responses(
        (status = 200, description = "Environment and its sandboxes deleted"),
        (status = 404, description = "Unknown environment", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn remove<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<serde_json::Value>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    if !state.kernel.delete_environment(identity.user_id, id).await? {
        return Err(ApiError::not_found("environment not found"));
    }
    Ok(Envelope::ok(json!({ "deleted": true })))
}

#[utoipa::path(
    post,
    path = "/environments/{id}/secrets",
    params(("id" = Uuid, Path, description = "Environment identifier")),
    request_body = SetSecretBody,
    responses(
        (status = 200, description = "Secret stored"),
        (status = 400, description = "Invalid secret key", body = ApiErrorBody),
        (status = 404, description = "Unknown environment", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn set_secret<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<SetSecretBody>,
) -> Result<Json<Envelope<serde_json::Value>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    state
        .kernel
        .environments()
        .set_secret(identity.user_id, id, &body.key, &body.value)
        .await?;
    Ok(Envelope::ok(json!({ "key": body.key, "redacted": true })))
}

#[utoipa::path(
    delete,
    path = "/environments/{id}/secrets/{key}",
    params(
        ("id" = Uuid, Path, description = "Environment identifier"),
        ("key" = String, Path, description = "Secret key")
    ),
    responses(
        (status = 200, description = "Secret removed"),
        (status = 404, description = "Unknown environment or key", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_secret<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path((id, key)): Path<(Uuid, String)>,
) -> Result<Json<Envelope<serde_json::Value>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let existed = state
        .kernel
        .environments()
        .delete_secret(identity.user_id, id, &key)
        .await?;
    if !existed {
        return Err(ApiError::not_found("secret not found"));
    }
    Ok(Envelope::ok(json!({ "deleted": true })))
}
