// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end multi-tab scenarios.
//!
//! Runs a mock auth server over real HTTP and opens several tabs against
//! it that share one cookie jar and one [`Origin`], the way tabs of one
//! browser profile do.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use sessionkeeper::backoff::BackoffPolicy;
use sessionkeeper::endpoint::ensure_crypto;
use sessionkeeper::{HttpEndpoint, Origin, SessionConfig, TokenGrant, TokenLifecycle};
use tokio::net::TcpListener;

/// Lifetime of tokens issued by the mock server. Inside the default refresh
/// threshold, so freshly signed-in tabs are immediately due.
pub const SHORT_EXPIRES_IN: u64 = 30;

const REFRESH_COOKIE: &str = "refresh_token";

static TRACING_INIT: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`. Set
/// `SESSIONKEEPER_LOG_FORMAT=json` for JSON lines.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::fmt;
        use tracing_subscriber::EnvFilter;

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let result = match std::env::var("SESSIONKEEPER_LOG_FORMAT").as_deref() {
            Ok("json") => fmt::fmt().with_env_filter(filter).json().with_test_writer().try_init(),
            _ => fmt::fmt().with_env_filter(filter).with_test_writer().try_init(),
        };
        drop(result);
    });
}

/// Backoff short enough for real-time tests.
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        backoff: BackoffPolicy {
            base: Duration::from_millis(20),
            ceiling: Duration::from_millis(200),
            retry_after_floor: Duration::from_millis(20),
        },
        request_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

#[derive(Default)]
struct ServerState {
    issued: AtomicU32,
    refresh_calls: AtomicU32,
    logout_calls: AtomicU32,
    /// The one refresh credential the server currently honours.
    valid_refresh: Mutex<Option<String>>,
    /// The one access token `/api/me` currently accepts.
    valid_access: Mutex<Option<String>>,
    /// Statuses to fail upcoming refresh calls with, in order.
    failures: Mutex<VecDeque<u16>>,
    latency: Mutex<Duration>,
}

impl ServerState {
    fn issue(&self) -> (String, String) {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let access = format!("access-{n}");
        let refresh = format!("refresh-{n}");
        *self.valid_access.lock() = Some(access.clone());
        *self.valid_refresh.lock() = Some(refresh.clone());
        (access, refresh)
    }
}

/// Mock auth backend with cookie-based refresh and token rotation.
pub struct AuthServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl AuthServer {
    pub async fn start() -> anyhow::Result<Self> {
        init_tracing();
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/login", post(login))
            .route("/auth/refresh", post(refresh))
            .route("/auth/logout", post(logout))
            .route("/api/me", get(me))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self { addr, state })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn refresh_calls(&self) -> u32 {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> u32 {
        self.state.logout_calls.load(Ordering::SeqCst)
    }

    /// Fail the next refresh calls with these statuses.
    pub fn fail_next(&self, statuses: &[u16]) {
        self.state.failures.lock().extend(statuses.iter().copied());
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = latency;
    }

    /// Revoke the refresh credential server-side.
    pub fn revoke(&self) {
        *self.state.valid_refresh.lock() = None;
    }

    /// Stop accepting the current access token on `/api/me`.
    pub fn expire_access(&self) {
        *self.state.valid_access.lock() = None;
    }
}

fn grant_body(access: &str, refresh: Option<&str>) -> serde_json::Value {
    let mut body = serde_json::json!({
        "access_token": access,
        "expires_in": SHORT_EXPIRES_IN,
        "user": { "id": "user-1", "email": "user@example.com" },
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = serde_json::Value::from(refresh);
    }
    body
}

fn with_refresh_cookie(refresh: &str, body: serde_json::Value) -> Response {
    let mut response = Json(body).into_response();
    let cookie = format!("{REFRESH_COOKIE}={refresh}; Path=/; HttpOnly");
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().insert("set-cookie", value);
    }
    response
}

fn presented_refresh(headers: &HeaderMap, body: &str) -> Option<String> {
    let prefix = format!("{REFRESH_COOKIE}=");
    let from_cookie = headers.get("cookie").and_then(|v| v.to_str().ok()).and_then(|cookies| {
        cookies.split(';').find_map(|c| c.trim().strip_prefix(prefix.as_str()).map(String::from))
    });
    from_cookie.or_else(|| {
        serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get(REFRESH_COOKIE).and_then(|t| t.as_str()).map(String::from))
    })
}

async fn login(State(state): State<Arc<ServerState>>) -> Response {
    let (access, refresh) = state.issue();
    with_refresh_cookie(&refresh, grant_body(&access, None))
}

async fn refresh(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let latency = *state.latency.lock();
    tokio::time::sleep(latency).await;

    let failure = state.failures.lock().pop_front();
    if let Some(status) = failure {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response =
            (status, Json(serde_json::json!({ "detail": "injected failure" }))).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            response.headers_mut().insert("retry-after", HeaderValue::from_static("1"));
        }
        return response;
    }

    let presented = presented_refresh(&headers, &body);
    let valid = state.valid_refresh.lock().clone();
    if presented.is_none() || presented != valid {
        let body = serde_json::json!({
            "error": "invalid_grant",
            "error_description": "refresh token revoked",
        });
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    }

    let (access, refresh) = state.issue();
    with_refresh_cookie(&refresh, grant_body(&access, Some(&refresh)))
}

async fn logout(State(state): State<Arc<ServerState>>) -> StatusCode {
    state.logout_calls.fetch_add(1, Ordering::SeqCst);
    *state.valid_refresh.lock() = None;
    *state.valid_access.lock() = None;
    StatusCode::NO_CONTENT
}

async fn me(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from);
    let valid = state.valid_access.lock().clone();
    if presented.is_some() && presented == valid {
        Json(serde_json::json!({ "id": "user-1" })).into_response()
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

/// One browser profile: a shared cookie jar and a shared [`Origin`].
pub struct Browser {
    client: reqwest::Client,
    origin: Origin,
    base_url: String,
}

impl Browser {
    pub fn new(server: &AuthServer, origin: Origin) -> anyhow::Result<Self> {
        ensure_crypto();
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(fast_config().request_timeout)
            .build()?;
        Ok(Self { client, origin, base_url: server.base_url() })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Open a tab. It is not started.
    pub fn open_tab(&self) -> TokenLifecycle {
        let endpoint = HttpEndpoint::with_client(self.client.clone(), &self.base_url);
        TokenLifecycle::builder(Arc::new(endpoint), &self.origin).config(fast_config()).build()
    }

    /// Run the login flow once; the cookie lands in the shared jar.
    pub async fn login(&self) -> anyhow::Result<TokenGrant> {
        let grant = self
            .client
            .post(format!("{}/login", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json::<TokenGrant>()
            .await?;
        Ok(grant)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Poll `condition` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
