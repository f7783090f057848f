//! HTTP surface: configuration, router, response envelope, error mapping.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use islet_db::Database;
use islet_kernel::{
    workers::{self, MetricsGauges},
    ContainerRuntime, DockerRuntime, IsletKernel, KernelConfig, KernelError, RuntimeError,
    SecretsVault,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::auth::{AuthError, AuthGate, SignupError};
use crate::middleware::rate_limit::{rate_limit_layer, RateLimitConfig};
use crate::{accounts, environments, sandboxes, shutdown, telemetry, ws};

pub async fn run() -> Result<()> {
    let _telemetry = telemetry::init("islet-daemon");
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.database_url, config.db_pool_size)
        .await
        .context("failed to open database")?;

    let vault = match (&config.master_key, config.production) {
        (Some(encoded), _) => SecretsVault::from_base64(encoded)
            .context("ISLET_MASTER_KEY must be 32 bytes of base64")?,
        (None, true) => anyhow::bail!("ISLET_MASTER_KEY is required when ISLET_ENV=production"),
        (None, false) => {
            warn!(
                "ISLET_MASTER_KEY is not set; generated an EPHEMERAL key. \
                 Stored secrets will be unreadable after restart."
            );
            SecretsVault::generate_ephemeral()
        }
    };

    let session_secret = match (&config.session_secret, config.production) {
        (Some(secret), _) => secret.clone().into_bytes(),
        (None, true) => anyhow::bail!("ISLET_SESSION_SECRET is required when ISLET_ENV=production"),
        (None, false) => {
            warn!("ISLET_SESSION_SECRET is not set; sessions will not survive restarts");
            let mut secret = vec![0u8; 32];
            rand::thread_rng().fill(secret.as_mut_slice());
            secret
        }
    };

    let runtime = DockerRuntime::connect(config.runtime_socket.as_deref())
        .map_err(|err| anyhow::anyhow!("connecting to the container runtime: {err}"))?;
    let kernel = IsletKernel::new(db.clone(), runtime, vault, KernelConfig::default());
    let gate = AuthGate::new(db.clone(), &session_secret);
    let gauges = Arc::new(MetricsGauges::default());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handles = vec![
        workers::spawn_ttl_sweeper(
            kernel.sandboxes().clone(),
            workers::SWEEP_INTERVAL,
            shutdown_rx.clone(),
        ),
        workers::spawn_retention_cleaner(
            db.clone(),
            workers::RETENTION_INTERVAL,
            shutdown_rx.clone(),
        ),
        workers::spawn_gauge_refresher(
            db.clone(),
            gauges.clone(),
            workers::GAUGE_INTERVAL,
            shutdown_rx.clone(),
        ),
    ];

    let state = Arc::new(AppState {
        kernel: kernel.clone(),
        gate,
        gauges,
    });

    let mut app = build_router(state)
        .layer(rate_limit_layer(config.rate_limits.clone()))
        .layer(TraceLayer::new_for_http());
    if let Some(origin) = &config.cors_origin {
        app = app.layer(cors_layer(origin)?);
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;
    info!(addr = %config.listen_addr, "islet-daemon listening");

    tokio::spawn(shutdown::signal_listener(shutdown_tx));
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown::wait_for_flag(shutdown_rx))
    .await
    .context("HTTP server exited")?;

    shutdown::drain(kernel, db, worker_handles).await;
    Ok(())
}

pub struct AppState<R>
where
    R: ContainerRuntime,
{
    pub kernel: IsletKernel<R>,
    pub gate: AuthGate,
    pub gauges: Arc<MetricsGauges>,
}

pub fn build_router<R>(state: Arc<AppState<R>>) -> Router
where
    R: ContainerRuntime,
{
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready::<R>))
        .route("/metrics", get(metrics_exposition::<R>))
        .route("/auth/signup", post(accounts::signup::<R>))
        .route("/auth/login", post(accounts::login::<R>))
        .route(
            "/auth/api-keys",
            get(accounts::list_api_keys::<R>).post(accounts::create_api_key::<R>),
        )
        .route("/auth/api-keys/:id", delete(accounts::revoke_api_key::<R>))
        .route("/audit", get(accounts::list_audit::<R>))
        .route(
            "/environments",
            post(environments::create::<R>).get(environments::list::<R>),
        )
        .route(
            "/environments/:id",
            get(environments::fetch::<R>)
                .put(environments::update::<R>)
                .delete(environments::remove::<R>),
        )
        .route(
            "/environments/:id/secrets",
            post(environments::set_secret::<R>),
        )
        .route(
            "/environments/:id/secrets/:key",
            delete(environments::delete_secret::<R>),
        )
        .route(
            "/sandboxes",
            post(sandboxes::create::<R>).get(sandboxes::list::<R>),
        )
        .route(
            "/sandboxes/:id",
            get(sandboxes::fetch::<R>).delete(sandboxes::destroy::<R>),
        )
        .route("/sandboxes/:id/start", post(sandboxes::start::<R>))
        .route("/sandboxes/:id/stop", post(sandboxes::stop::<R>))
        .route("/sandboxes/:id/restart", post(sandboxes::restart::<R>))
        .route("/sandboxes/:id/replicate", post(sandboxes::replicate::<R>))
        .route("/sandboxes/:id/logs", get(sandboxes::logs::<R>))
        .route("/sandboxes/:id/metrics", get(sandboxes::metrics::<R>))
        .route("/sandboxes/:id/exec", post(sandboxes::exec::<R>))
        .route("/ws/sandboxes/:id/logs", get(ws::logs_ws::<R>))
        .route("/ws/sandboxes/:id/terminal", get(ws::terminal_ws::<R>))
        .with_state(state)
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub db_pool_size: u32,
    pub session_secret: Option<String>,
    pub master_key: Option<String>,
    pub runtime_socket: Option<String>,
    pub cors_origin: Option<String>,
    pub production: bool,
    pub rate_limits: RateLimitConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr = env::var("ISLET_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid ISLET_LISTEN_ADDR")?;

        let database_url = env::var("ISLET_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .context("ISLET_DATABASE_URL or DATABASE_URL must be configured")?;

        let db_pool_size = env::var("ISLET_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        let production = env::var("ISLET_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let mut rate_limits = RateLimitConfig::default();
        if let Some(value) = u64_env("ISLET_RATE_AUTHENTICATED_PER_MINUTE") {
            rate_limits.authenticated_per_minute = value;
        }
        if let Some(value) = u64_env("ISLET_RATE_SANDBOX_CREATES_PER_MINUTE") {
            rate_limits.sandbox_creates_per_minute = value;
        }
        if let Some(value) = u64_env("ISLET_RATE_AUTH_ATTEMPTS") {
            rate_limits.auth_attempts_per_window = value;
        }

        Ok(Self {
            listen_addr,
            database_url,
            db_pool_size,
            session_secret: non_empty_env("ISLET_SESSION_SECRET"),
            master_key: non_empty_env("ISLET_MASTER_KEY"),
            runtime_socket: non_empty_env("ISLET_RUNTIME_SOCKET"),
            cors_origin: non_empty_env("ISLET_CORS_ORIGIN"),
            production,
            rate_limits,
        })
    }
}

fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let layer = if origin == "*" {
        CorsLayer::new().allow_origin(Any)
    } else {
        let value: HeaderValue = origin.parse().context("invalid ISLET_CORS_ORIGIN")?;
        CorsLayer::new().allow_origin(AllowOrigin::exact(value))
    };
    Ok(layer
        .allow_methods(Any)
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn u64_env(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

// ----------------------------------------------------------------------
// Response envelope and error mapping
// ----------------------------------------------------------------------

/// Uniform response body: `{success, data?, error?}`.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            err.to_string(),
        )
    }
}

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Validation(message) => ApiError::bad_request(message),
            KernelError::NotFound(what) => ApiError::not_found(format!("{what} not found")),
            KernelError::Conflict(message) => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", message)
            }
            KernelError::QuotaExceeded(message) => {
                ApiError::new(StatusCode::TOO_MANY_REQUESTS, "QUOTA_EXCEEDED", message)
            }
            KernelError::NotRunning => ApiError::new(
                StatusCode::CONFLICT,
                "NOT_RUNNING",
                "sandbox is not running",
            ),
            KernelError::NoContainer => ApiError::new(
                StatusCode::CONFLICT,
                "NO_CONTAINER",
                "sandbox has no container",
            ),
            KernelError::MetricsUnavailable => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "METRICS_UNAVAILABLE",
                "metrics unavailable for this sandbox",
            ),
            KernelError::Runtime(RuntimeError::NotFound(message)) => ApiError::not_found(message),
            KernelError::Runtime(RuntimeError::Conflict(message)) => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", message)
            }
            KernelError::Runtime(RuntimeError::Unavailable(message)) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "SANDBOX_ERROR", message)
            }
            KernelError::Runtime(RuntimeError::Other(message)) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "SANDBOX_ERROR",
                message,
            ),
            KernelError::Secrets(err) => ApiError::internal(err),
            KernelError::Store(err) => ApiError::internal(err),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized => ApiError::unauthorized("missing or invalid credentials"),
            AuthError::Internal(message) => ApiError::internal(message),
        }
    }
}

impl From<SignupError> for ApiError {
    fn from(err: SignupError) -> Self {
        match err {
            SignupError::EmailTaken => ApiError::new(
                StatusCode::CONFLICT,
                "CONFLICT",
                "email is already registered",
            ),
            SignupError::Internal(message) => ApiError::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, code = self.code, message = %self.message, "api error");
        }
        let body = Envelope::<()> {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: None,
            }),
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn require_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Err(ApiError::unauthorized("missing Authorization bearer token"));
    };
    let header_value = value
        .to_str()
        .map_err(|_| ApiError::unauthorized("invalid Authorization header encoding"))?;
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| ApiError::unauthorized("Authorization header must be a Bearer token"))
}

// ----------------------------------------------------------------------
// Health and metrics
// ----------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    status: &'static str,
}

#[utoipa::path(get, path = "/health", responses((status = 200, description = "Service health")))]
async fn health() -> Json<Envelope<HealthResponse>> {
    Envelope::ok(HealthResponse { status: "ok" })
}

#[utoipa::path(get, path = "/health/live", responses((status = 200, description = "Liveness probe")))]
async fn health_live() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    get,
    path = "/health/ready",
    responses(
        (status = 200, description = "Store and runtime reachable"),
        (status = 503, description = "A dependency is unreachable", body = ApiErrorBody)
    )
)]
async fn health_ready<R>(
    State(state): State<Arc<AppState<R>>>,
) -> Result<Json<Envelope<HealthResponse>>, ApiError>
where
    R: ContainerRuntime,
{
    state.kernel.db().ping().await.map_err(|err| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "INTERNAL_ERROR",
            format!("store unavailable: {err}"),
        )
    })?;
    state
        .kernel
        .sandboxes()
        .runtime()
        .ping()
        .await
        .map_err(|err| {
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "INTERNAL_ERROR",
                format!("container runtime unreachable: {err}"),
            )
        })?;
    Ok(Envelope::ok(HealthResponse { status: "ready" }))
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, description = "Prometheus metrics", content_type = "text/plain"))
)]
async fn metrics_exposition<R>(State(state): State<Arc<AppState<R>>>) -> impl IntoResponse
where
    R: ContainerRuntime,
{
    (StatusCode::OK, state.gauges.render())
}

pub mod docs {
    use super::*;
    use utoipa::openapi::security::SecurityRequirement;
    use utoipa::{Modify, OpenApi};

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Islet Control Plane API", version = "0.1.0"),
        paths(
            health,
            health_live,
            health_ready,
            metrics_exposition,
            crate::accounts::signup,
            crate::accounts::login,
            crate::accounts::create_api_key,
            crate::accounts::list_api_keys,
            crate::accounts::revoke_api_key,
            crate::accounts::list_audit,
            crate::environments::create,
            crate::environments::list,
            crate::environments::fetch,
            crate::environments::update,
            crate::environments::remove,
            crate::environments::set_secret,
            crate::environments::delete_secret,
            crate::sandboxes::create,
            crate::sandboxes::list,
            crate::sandboxes::fetch,
            crate::sandboxes::destroy,
            crate::sandboxes::start,
            crate::sandboxes::stop,
            crate::sandboxes::restart,
            crate::sandboxes::replicate,
            crate::sandboxes::logs,
            crate::sandboxes::metrics,
            crate::sandboxes::exec
        ),
        components(
            schemas(
                ApiErrorBody,
                HealthResponse,
                crate::accounts::SignupBody,
                crate::accounts::LoginBody,
                crate::accounts::SessionResponse,
                crate::accounts::UserResponse,
                crate::accounts::CreateApiKeyBody,
                crate::accounts::ApiKeyResponse,
                crate::accounts::IssuedApiKeyResponse,
                crate::accounts::AuditEntryResponse,
                crate::environments::CreateEnvironmentBody,
                crate::environments::UpdateEnvironmentBody,
                crate::environments::SetSecretBody,
                crate::environments::EnvironmentResponse,
                crate::environments::VersionResponse,
                crate::environments::SecretEntry,
                crate::environments::PortBody,
                crate::sandboxes::CreateSandboxBody,
                crate::sandboxes::ReplicateBody,
                crate::sandboxes::ExecBody,
                crate::sandboxes::ExecResponse,
                crate::sandboxes::SandboxResponse,
                crate::sandboxes::SandboxDetailResponse,
                crate::sandboxes::LogEntryResponse,
                crate::sandboxes::MetricsResponse
            )
        ),
        modifiers(&SecurityAddon)
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            openapi
                .security
                .get_or_insert_with(Default::default)
                .push(SecurityRequirement::new("bearerAuth", Vec::<String>::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use islet_kernel::testing::FakeRuntime;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::Service;
    use uuid::Uuid;

    async fn setup_test_app() -> (Arc<AppState<FakeRuntime>>, Router, TempDir) {
        let temp = TempDir::new().expect("tempdir");
        let db_path = temp.path().join(format!("db-{}.sqlite", Uuid::new_v4()));
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let db = Database::connect(&db_url, 5).await.expect("db");

        let kernel = IsletKernel::new(
            db.clone(),
            FakeRuntime::new(),
            SecretsVault::generate_ephemeral(),
            KernelConfig::default(),
        );
        let gate = AuthGate::new(db.clone(), b"test-session-secret");
        let state = Arc::new(AppState {
            kernel,
            gate,
            gauges: Arc::new(MetricsGauges::default()),
        });
        let router = build_router(state.clone());
        (state, router, temp)
    }

    async fn request(
        router: &mut Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&value).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.call(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn signup(router: &mut Router, email: &str) -> String {
        let (status, body) = request(
            router,
            "POST",
            "/auth/signup",
            None,
            Some(json!({ "email": email, "password": "passwordXYZ" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "signup failed: {body}");
        body["data"]["token"].as_str().unwrap().to_string()
    }

    async fn create_env(router: &mut Router, token: &str, name: &str) -> String {
        let (status, body) = request(
            router,
            "POST",
            "/environments",
            Some(token),
            Some(json!({
                "name": name,
                "image": "nginx:alpine",
                "cpu": 1.0,
                "memory": 256,
                "ports": [{ "container": 80, "host": 48080 }],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "env create failed: {body}");
        body["data"]["id"].as_str().unwrap().to_string()
    }

    async fn wait_running(router: &mut Router, token: &str, sandbox_id: &str) -> Value {
        for _ in 0..400 {
            let (status, body) = request(
                router,
                "GET",
                &format!("/sandboxes/{sandbox_id}"),
                Some(token),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK, "fetch failed: {body}");
            if body["data"]["status"] == "running" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sandbox never reached running");
    }

    #[tokio::test]
    async fn health_endpoints_respond() {
        let (_, mut router, _tmp) = setup_test_app().await;
        let (status, body) = request(&mut router, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "ok");

        let (status, _) = request(&mut router, "GET", "/health/live", None, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = request(&mut router, "GET", "/health/ready", None, None).await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }

    #[tokio::test]
    async fn requests_without_credentials_are_unauthorized() {
        let (_, mut router, _tmp) = setup_test_app().await;
        let (status, body) = request(&mut router, "GET", "/environments", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn sandbox_lifecycle_happy_path() {
        let (_, mut router, _tmp) = setup_test_app().await;
        let token = signup(&mut router, "u@x.test").await;
        let env_id = create_env(&mut router, &token, "nginx-demo").await;

        let (status, body) = request(
            &mut router,
            "POST",
            "/sandboxes",
            Some(&token),
            Some(json!({ "environmentId": env_id, "name": "demo" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["data"]["status"], "pending");
        assert_eq!(body["data"]["phase"], "creating");
        let sandbox_id = body["data"]["id"].as_str().unwrap().to_string();

        let running = wait_running(&mut router, &token, &sandbox_id).await;
        assert_eq!(running["data"]["phase"], "healthy");
        assert!(running["data"]["containerRef"].is_string());

        let (status, body) = request(
            &mut router,
            "POST",
            &format!("/sandboxes/{sandbox_id}/stop"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "stopped");
        assert_eq!(body["data"]["phase"], "stopped");

        let (status, body) = request(
            &mut router,
            "DELETE",
            &format!("/sandboxes/{sandbox_id}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["deleted"], true);

        let (status, body) = request(
            &mut router,
            "GET",
            &format!("/sandboxes/{sandbox_id}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn environment_responses_redact_secret_values() {
        let (_, mut router, _tmp) = setup_test_app().await;
        let token = signup(&mut router, "u@x.test").await;
        let env_id = create_env(&mut router, &token, "secretive").await;

        let (status, _) = request(
            &mut router,
            "POST",
            &format!("/environments/{env_id}/secrets"),
            Some(&token),
            Some(json!({ "key": "API_KEY", "value": "sk_live_ABCDEF" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = request(
            &mut router,
            "GET",
            &format!("/environments/{env_id}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let secrets = body["data"]["currentVersion"]["secrets"].as_array().unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0]["key"], "API_KEY");
        assert_eq!(secrets[0]["redacted"], true);
        // The value never appears anywhere in the payload.
        assert!(!body.to_string().contains("sk_live_ABCDEF"));

        let (status, _) = request(
            &mut router,
            "DELETE",
            &format!("/environments/{env_id}/secrets/API_KEY"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = request(
            &mut router,
            "DELETE",
            &format!("/environments/{env_id}/secrets/API_KEY"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{body}");
    }

    #[tokio::test]
    async fn validation_errors_use_the_envelope() {
        let (_, mut router, _tmp) = setup_test_app().await;
        let token = signup(&mut router, "u@x.test").await;

        let (status, body) = request(
            &mut router,
            "POST",
            "/environments",
            Some(&token),
            Some(json!({ "name": "bad", "image": "has spaces" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        // Both image and dockerfile is invalid too.
        let (status, body) = request(
            &mut router,
            "POST",
            "/environments",
            Some(&token),
            Some(json!({ "name": "bad2", "image": "nginx:alpine", "dockerfile": "FROM x" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

        let env_id = create_env(&mut router, &token, "ttl-env").await;
        let (status, body) = request(
            &mut router,
            "POST",
            "/sandboxes",
            Some(&token),
            Some(json!({ "environmentId": env_id, "name": "bad-ttl", "ttlSeconds": 10 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn tenant_isolation_over_http() {
        let (_, mut router, _tmp) = setup_test_app().await;
        let owner = signup(&mut router, "a@x.test").await;
        let intruder = signup(&mut router, "b@x.test").await;

        let env_id = create_env(&mut router, &owner, "private").await;
        let (_, body) = request(
            &mut router,
            "POST",
            "/sandboxes",
            Some(&owner),
            Some(json!({ "environmentId": env_id, "name": "mine" })),
        )
        .await;
        let sandbox_id = body["data"]["id"].as_str().unwrap().to_string();
        wait_running(&mut router, &owner, &sandbox_id).await;

        for (method, uri) in [
            ("GET", format!("/sandboxes/{sandbox_id}")),
            ("POST", format!("/sandboxes/{sandbox_id}/stop")),
            ("DELETE", format!("/sandboxes/{sandbox_id}")),
        ] {
            let (status, body) =
                request(&mut router, method, &uri, Some(&intruder), None).await;
            if method == "DELETE" {
                // Destroy reports absence rather than leaking existence.
                assert_eq!(status, StatusCode::NOT_FOUND, "{body}");
            } else {
                assert_eq!(status, StatusCode::NOT_FOUND, "{body}");
            }
            assert_eq!(body["error"]["code"], "NOT_FOUND");
        }

        // Owner still sees a running sandbox.
        let (_, body) = request(
            &mut router,
            "GET",
            &format!("/sandboxes/{sandbox_id}"),
            Some(&owner),
            None,
        )
        .await;
        assert_eq!(body["data"]["status"], "running");
    }

    #[tokio::test]
    async fn exec_and_metrics_roundtrip() {
        let (_, mut router, _tmp) = setup_test_app().await;
        let token = signup(&mut router, "u@x.test").await;
        let env_id = create_env(&mut router, &token, "exec-env").await;
        let (_, body) = request(
            &mut router,
            "POST",
            "/sandboxes",
            Some(&token),
            Some(json!({ "environmentId": env_id, "name": "exec" })),
        )
        .await;
        let sandbox_id = body["data"]["id"].as_str().unwrap().to_string();
        wait_running(&mut router, &token, &sandbox_id).await;

        let (status, body) = request(
            &mut router,
            "POST",
            &format!("/sandboxes/{sandbox_id}/exec"),
            Some(&token),
            Some(json!({ "command": ["echo", "hello"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["exitCode"], 0);
        assert_eq!(body["data"]["output"], "echo hello");

        let (status, body) = request(
            &mut router,
            "GET",
            &format!("/sandboxes/{sandbox_id}/metrics"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["cpuPercent"].as_f64().unwrap() > 0.0);

        // Stopped sandboxes refuse both.
        request(
            &mut router,
            "POST",
            &format!("/sandboxes/{sandbox_id}/stop"),
            Some(&token),
            None,
        )
        .await;
        let (status, body) = request(
            &mut router,
            "POST",
            &format!("/sandboxes/{sandbox_id}/exec"),
            Some(&token),
            Some(json!({ "command": ["id"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "NOT_RUNNING");
    }

    #[tokio::test]
    async fn sandbox_creates_are_rate_limited() {
        let (_state, router, _tmp) = setup_test_app().await;
        let mut router = router.layer(rate_limit_layer(RateLimitConfig {
            sandbox_creates_per_minute: 1,
            ..Default::default()
        }));
        let token = signup(&mut router, "u@x.test").await;
        let env_id = create_env(&mut router, &token, "limited").await;

        let (status, _) = request(
            &mut router,
            "POST",
            "/sandboxes",
            Some(&token),
            Some(json!({ "environmentId": env_id, "name": "one" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = request(
            &mut router,
            "POST",
            "/sandboxes",
            Some(&token),
            Some(json!({ "environmentId": env_id, "name": "two" })),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn audit_listing_shows_lifecycle_trail() {
        let (_, mut router, _tmp) = setup_test_app().await;
        let token = signup(&mut router, "u@x.test").await;
        let env_id = create_env(&mut router, &token, "audited").await;
        let (_, body) = request(
            &mut router,
            "POST",
            "/sandboxes",
            Some(&token),
            Some(json!({ "environmentId": env_id, "name": "trail" })),
        )
        .await;
        let sandbox_id = body["data"]["id"].as_str().unwrap().to_string();
        wait_running(&mut router, &token, &sandbox_id).await;

        let (status, body) = request(&mut router, "GET", "/audit", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let actions: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["action"].as_str().unwrap())
            .collect();
        assert!(actions.contains(&"environment.created"));
        assert!(actions.contains(&"sandbox.created"));
    }

    #[tokio::test]
    async fn metrics_exposition_is_plaintext() {
        let (_, mut router, _tmp) = setup_test_app().await;
        let response = router
            .call(
                Request::builder()
                    .method("GET")
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("islet_up 1"));
    }
}
