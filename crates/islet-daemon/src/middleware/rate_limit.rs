//! Fixed-window rate limiting.
//!
//! Three budgets: authenticated traffic per identity, sandbox creation per
//! identity, and auth attempts per client IP (pre-authentication, so the
//! only stable key is the peer address).

use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::extract::ConnectInfo;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use futures::future::BoxFuture;
use http::HeaderValue;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tower::{Layer, Service};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub authenticated_per_minute: u64,
    pub sandbox_creates_per_minute: u64,
    pub auth_attempts_per_window: u64,
    pub auth_window: Duration,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            authenticated_per_minute: 100,
            sandbox_creates_per_minute: 10,
            auth_attempts_per_window: 20,
            auth_window: Duration::from_secs(15 * 60),
            window: Duration::from_secs(60),
        }
    }
}

pub fn rate_limit_layer(config: RateLimitConfig) -> RateLimitLayer {
    RateLimitLayer {
        state: Arc::new(RateLimitState::new(config)),
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    state: Arc<RateLimitState>,
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: Arc<RateLimitState>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let state = self.state.clone();
        let key = RateLimitKey::from_request(&request);

        Box::pin(async move {
            match state.check(key).await {
                Ok(()) => inner.call(request).await,
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}

#[derive(Debug)]
struct RateLimitState {
    config: RateLimitConfig,
    counters: Mutex<HashMap<RateKey, Counter>>,
}

impl RateLimitState {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    async fn check(&self, key: RateLimitKey) -> Result<(), RateLimitRejection> {
        let Some(class) = classify(&key.method, &key.path) else {
            return Ok(());
        };

        let (limit, window) = self.config.budget_for(class);
        let identity = match class {
            RateClass::Auth => key.client_ip,
            _ => key.identity_fingerprint,
        };

        let mut counters = self.counters.lock().await;
        let now = Instant::now();
        let entry = counters
            .entry(RateKey {
                class,
                identity: identity.clone(),
            })
            .or_insert_with(|| Counter {
                window_start: now,
                count: 0,
            });

        let elapsed = now.saturating_duration_since(entry.window_start);
        if elapsed >= window {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            let retry_after = window
                .checked_sub(elapsed)
                .unwrap_or_default()
                .max(Duration::from_secs(1));
            warn!(
                category = class.as_str(),
                identity_fingerprint = identity,
                limit,
                "rate limit exceeded"
            );
            return Err(RateLimitRejection {
                limit,
                window,
                retry_after,
            });
        }

        entry.count += 1;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RateKey {
    class: RateClass,
    identity: String,
}

#[derive(Clone, Debug)]
struct Counter {
    window_start: Instant,
    count: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum RateClass {
    /// Pre-auth attempts, keyed by client IP.
    Auth,
    /// Sandbox creation (including replication), keyed by identity.
    SandboxCreate,
    /// Everything else behind the auth gate, keyed by identity.
    Authenticated,
}

impl RateClass {
    fn as_str(self) -> &'static str {
        match self {
            RateClass::Auth => "auth",
            RateClass::SandboxCreate => "sandbox_create",
            RateClass::Authenticated => "authenticated",
        }
    }
}

impl RateLimitConfig {
    fn budget_for(&self, class: RateClass) -> (u64, Duration) {
        match class {
            RateClass::Auth => (self.auth_attempts_per_window, self.auth_window),
            RateClass::SandboxCreate => (self.sandbox_creates_per_minute, self.window),
            RateClass::Authenticated => (self.authenticated_per_minute, self.window),
        }
    }
}

#[derive(Debug)]
struct RateLimitRejection {
    limit: u64,
    window: Duration,
    retry_after: Duration,
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let retry_after_secs = self.retry_after.as_secs().max(1);
        let body = json!({
            "success": false,
            "error": {
                "code": "RATE_LIMITED",
                "message": "rate limit exceeded",
                "details": {
                    "limit": self.limit,
                    "windowSeconds": self.window.as_secs(),
                    "retryAfterSeconds": retry_after_secs,
                },
            },
        });
        let mut response =
            (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
        response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from_str(&retry_after_secs.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("1")),
        );
        response
    }
}

fn classify(method: &Method, path: &str) -> Option<RateClass> {
    if method == Method::POST && (path == "/auth/signup" || path == "/auth/login") {
        return Some(RateClass::Auth);
    }
    if method == Method::POST
        && (path == "/sandboxes"
            || (path.starts_with("/sandboxes/") && path.ends_with("/replicate")))
    {
        return Some(RateClass::SandboxCreate);
    }
    if path.starts_with("/environments")
        || path.starts_with("/sandboxes")
        || path.starts_with("/auth/api-keys")
        || path.starts_with("/audit")
    {
        return Some(RateClass::Authenticated);
    }
    None
}

struct RateLimitKey {
    method: Method,
    path: String,
    identity_fingerprint: String,
    client_ip: String,
}

impl RateLimitKey {
    fn from_request<B>(request: &Request<B>) -> Self {
        Self {
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            identity_fingerprint: identity_fingerprint(request),
            client_ip: client_ip(request),
        }
    }
}

fn identity_fingerprint<B>(request: &Request<B>) -> String {
    let Some(value) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    else {
        return "anonymous".to_string();
    };

    let digest = Sha256::digest(value.as_bytes());
    STANDARD_NO_PAD.encode(digest)
}

fn client_ip<B>(request: &Request<B>) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
