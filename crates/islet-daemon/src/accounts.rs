//! Account endpoints: signup, login, API keys, audit trail.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use islet_db::{ApiKeyRecord, AuditEntryRecord, AuditFilter, UserRecord};
use islet_kernel::{validate, ContainerRuntime};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::server::{require_bearer, ApiError, ApiErrorBody, AppState, Envelope};

#[derive(Debug, Deserialize, ToSchema)]
pub struct SignupBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub created_at: String,
}

impl From<UserRecord> for UserResponse {
    fn from(record: UserRecord) -> Self {
        Self {
            id: record.id,
            email: record.email,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub token: String,
    pub user: UserResponse,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateApiKeyBody {
    pub name: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyResponse {
    pub id: Uuid,
    pub name: String,
    pub key_prefix: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<String>,
}

impl From<ApiKeyRecord> for ApiKeyResponse {
    fn from(record: ApiKeyRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            key_prefix: record.key_prefix,
            created_at: record.created_at.to_rfc3339(),
            last_used_at: record.last_used_at.map(|ts| ts.to_rfc3339()),
            revoked_at: record.revoked_at.map(|ts| ts.to_rfc3339()),
        }
    }
}

/// The full key appears here once and is never retrievable again.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuedApiKeyResponse {
    pub key: String,
    pub api_key: ApiKeyResponse,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntryResponse {
    pub id: Uuid,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    pub created_at: String,
}

impl From<AuditEntryRecord> for AuditEntryResponse {
    fn from(record: AuditEntryRecord) -> Self {
        Self {
            id: record.id,
            action: record.action,
            resource_type: record.resource_type,
            resource_id: record.resource_id,
            metadata: record.metadata,
            client_ip: record.client_ip,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[utoipa::path(
    post,
    path = "/auth/signup",
    request_body = SignupBody,
    responses(
        (status = 201, description = "Account created", body = SessionResponse),
        (status = 400, description = "Invalid email or password", body = ApiErrorBody),
        (status = 409, description = "Email already registered", body = ApiErrorBody)
    )
)]
pub async fn signup<R>(
    State(state): State<Arc<AppState<R>>>,
    Json(body): Json<SignupBody>,
) -> Result<(StatusCode, Json<Envelope<SessionResponse>>), ApiError>
where
    R: ContainerRuntime,
{
    validate::email(&body.email).map_err(ApiError::from)?;
    validate::password(&body.password).map_err(ApiError::from)?;

    let user = state.gate.signup(&body.email, &body.password).await?;
    let token = state.gate.issue_session(user.id)?;
    Ok((
        StatusCode::CREATED,
        Envelope::ok(SessionResponse {
            token,
            user: UserResponse::from(user),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginBody,
    responses(
        (status = 200, description = "Session issued", body = SessionResponse),
        (status = 401, description = "Invalid credentials", body = ApiErrorBody)
    )
)]
pub async fn login<R>(
    State(state): State<Arc<AppState<R>>>,
    Json(body): Json<LoginBody>,
) -> Result<Json<Envelope<SessionResponse>>, ApiError>
where
    R: ContainerRuntime,
{
    let (user, token) = state.gate.login(&body.email, &body.password).await?;
    Ok(Envelope::ok(SessionResponse {
        token,
        user: UserResponse::from(user),
    }))
}

#[utoipa::path(
    post,
    path = "/auth/api-keys",
    request_body = CreateApiKeyBody,
    responses(
        (status = 201, description = "API key issued; the key value is shown once", body = IssuedApiKeyResponse),
        (status = 401, description = "Missing or invalid credentials", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_api_key<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Json(body): Json<CreateApiKeyBody>,
) -> Result<(StatusCode, Json<Envelope<IssuedApiKeyResponse>>), ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let name = body.name.trim();
    if name.is_empty() || name.len() > 100 {
        return Err(ApiError::bad_request("key name must be 1..100 characters"));
    }

    let (key, record) = state.gate.issue_api_key(identity.user_id, name).await?;
    Ok((
        StatusCode::CREATED,
        Envelope::ok(IssuedApiKeyResponse {
            key,
            api_key: ApiKeyResponse::from(record),
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/auth/api-keys",
    responses(
        (status = 200, description = "List API keys", body = [ApiKeyResponse]),
        (status = 401, description = "Missing or invalid credentials", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn list_api_keys<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
) -> Result<Json<Envelope<Vec<ApiKeyResponse>>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let keys = state.gate.list_api_keys(identity.user_id).await?;
    Ok(Envelope::ok(
        keys.into_iter().map(ApiKeyResponse::from).collect(),
    ))
}

#[utoipa::path(
    delete,
    path = "/auth/api-keys/{id}",
    params(("id" = Uuid, Path, description = "API key identifier")),
    responses(
        (status = 200, description = "Key revoked"),
        (status = 404, description = "Unknown key", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn revoke_api_key<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<serde_json::Value>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    if !state.gate.revoke_api_key(identity.user_id, id).await? {
        return Err(ApiError::not_found("api key not found"));
    }
    Ok(Envelope::ok(json!({ "revoked": true })))
}

#[utoipa::path(
    get,
    path = "/audit",
    params(AuditQuery),
    responses(
        (status = 200, description = "Recent audit entries for the caller", body = [AuditEntryResponse]),
        (status = 401, description = "Missing or invalid credentials", body = ApiErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub async fn list_audit<R>(
    State(state): State<Arc<AppState<R>>>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Envelope<Vec<AuditEntryResponse>>>, ApiError>
where
    R: ContainerRuntime,
{
    let identity = state.gate.authenticate(require_bearer(&headers)?).await?;
    let filter = AuditFilter {
        action: query.action,
        resource_type: query.resource_type,
        limit: query.limit,
    };
    let entries = state
        .kernel
        .db()
        .list_audit_entries(identity.user_id, &filter)
        .await
        .map_err(ApiError::internal)?;
    Ok(Envelope::ok(
        entries.into_iter().map(AuditEntryResponse::from).collect(),
    ))
}
