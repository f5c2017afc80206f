//! HTTP server and endpoints.
//!
//! Per-server MCP endpoints (`POST`/`GET`/`DELETE`), the fixed `/health` and
//! `/stats` endpoints, and the middleware stack (request counting, optional
//! bearer auth, CORS, request tracing).

use crate::codec::{self, EventIdSequence, Payload, SseEvent};
use crate::config::{AuthConfig, CorsConfig};
use crate::proxy::{ProxyCore, RequestFailure};
use crate::session::Session;
use axum::{
    Extension, Json, Router,
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::{Next, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::StreamExt as _;
use serde::Serialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
pub const HEADER_REQUEST_ID: &str = "X-Request-Id";
pub const JSON_MIME_TYPE: &str = "application/json";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";

/// Shared application state.
pub struct AppState {
    pub proxy: ProxyCore,
    pub cors: CorsConfig,
    pub auth: AuthConfig,
    pub sse_keep_alive: Duration,
    pub event_ids: EventIdSequence,
    pub start_time: Instant,
    pub version: &'static str,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

/// Route metadata: the canonical endpoint the proxy resolves servers by.
/// The `/mcp` alias carries the mirrored server's endpoint here.
#[derive(Clone)]
struct McpRoute {
    endpoint: String,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats));

    let endpoints = state.proxy.endpoints();
    for endpoint in &endpoints {
        router = router.route(
            endpoint,
            mcp_method_router(McpRoute {
                endpoint: endpoint.clone(),
            }),
        );
    }

    // With exactly one server configured, `/mcp` mirrors it.
    if let [endpoint] = endpoints.as_slice() {
        router = router.route(
            "/mcp",
            mcp_method_router(McpRoute {
                endpoint: endpoint.clone(),
            }),
        );
    }

    router.with_state(state)
}

fn mcp_method_router(route: McpRoute) -> axum::routing::MethodRouter<Arc<AppState>> {
    axum::routing::post(post_mcp)
        .get(get_mcp)
        .delete(delete_mcp)
        .layer(Extension(route))
}

/// Attach request counting middleware (total + failed), feeding `/stats`.
pub fn with_request_counting(router: Router, state: Arc<AppState>) -> Router {
    async fn count_requests(
        State(state): State<Arc<AppState>>,
        request: Request,
        next: Next,
    ) -> Response {
        let should_count = request.uri().path() != "/health";
        if should_count {
            state.total_requests.fetch_add(1, Ordering::Relaxed);
        }
        let response = next.run(request).await;
        if should_count && !response.status().is_success() {
            state.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        response
    }

    router.layer(from_fn_with_state(state, count_requests))
}

/// Optional bearer-token auth.
///
/// When enabled, all requests except `/health` must carry
/// `Authorization: Bearer <token>` with a token from the allow-list.
/// Auth failures are plain HTTP errors and never reveal session state.
pub fn with_optional_bearer_auth(router: Router, state: Arc<AppState>) -> Router {
    async fn require_bearer(
        State(state): State<Arc<AppState>>,
        request: Request,
        next: Next,
    ) -> Response {
        if request.uri().path() == "/health" {
            return next.run(request).await;
        }

        let token = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer ").map(str::trim));

        match token {
            None => (StatusCode::UNAUTHORIZED, "Unauthorized: bearer token required")
                .into_response(),
            Some(token) if state.auth.tokens.iter().any(|t| t == token) => {
                next.run(request).await
            }
            Some(_) => (StatusCode::FORBIDDEN, "Forbidden: unknown token").into_response(),
        }
    }

    if !state.auth.enabled {
        return router;
    }
    router.layer(from_fn_with_state(state, require_bearer))
}

/// CORS for browser clients: configurable origin allow-list (`*` permits
/// any), preflight handled here.
pub fn with_cors(router: Router, state: Arc<AppState>) -> Router {
    const ALLOW_METHODS: &str = "GET, POST, DELETE, OPTIONS";
    const ALLOW_HEADERS: &str = "Content-Type, Accept, Authorization, Mcp-Session-Id";

    fn allow_origin_value(state: &AppState, origin: &HeaderValue) -> Option<HeaderValue> {
        let origin_str = origin.to_str().ok()?;
        if !state.cors.allows(origin_str) {
            return None;
        }
        if state.cors.allowed_origins.iter().any(|o| o == "*") {
            Some(HeaderValue::from_static("*"))
        } else {
            Some(origin.clone())
        }
    }

    async fn apply_cors(
        State(state): State<Arc<AppState>>,
        request: Request,
        next: Next,
    ) -> Response {
        let origin = request.headers().get(header::ORIGIN).cloned();
        let allow_origin = origin.as_ref().and_then(|o| allow_origin_value(&state, o));

        if request.method() == Method::OPTIONS {
            let mut response = StatusCode::NO_CONTENT.into_response();
            if let Some(value) = allow_origin {
                let headers = response.headers_mut();
                headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static(ALLOW_METHODS),
                );
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_HEADERS,
                    HeaderValue::from_static(ALLOW_HEADERS),
                );
            }
            return response;
        }

        let mut response = next.run(request).await;
        if let Some(value) = allow_origin {
            let headers = response.headers_mut();
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            headers.insert(
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_static(HEADER_SESSION_ID),
            );
            headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        }
        response
    }

    router.layer(from_fn_with_state(state, apply_cors))
}

/// Request tracing with the `X-Request-Id` correlation header on the span.
pub fn with_tracing(router: Router) -> Router {
    router.layer(
        tower_http::trace::TraceLayer::new_for_http().make_span_with(|request: &Request| {
            let request_id = request
                .headers()
                .get(HEADER_REQUEST_ID)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-");
            tracing::info_span!(
                "http",
                method = %request.method(),
                path = %request.uri().path(),
                request_id = %request_id,
            )
        }),
    )
}

// ============================================================================
// Fixed endpoints
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// GET /health - liveness; always public.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    version: &'static str,
    uptime_seconds: u64,
    total_requests: u64,
    failed_requests: u64,
    sessions: crate::session::RegistryStats,
}

/// GET /stats - aggregate counters.
async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        version: state.version,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        total_requests: state.total_requests.load(Ordering::Relaxed),
        failed_requests: state.failed_requests.load(Ordering::Relaxed),
        sessions: state.proxy.registry().stats(),
    })
}

// ============================================================================
// MCP endpoints
// ============================================================================

async fn post_mcp(
    State(state): State<Arc<AppState>>,
    Extension(route): Extension<McpRoute>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = ensure_json_content_type(&headers) {
        return response;
    }
    if let Err(response) = ensure_accepts_post(&headers) {
        return response;
    }

    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let body = codec::error_response(
                None,
                codec::codes::PARSE_ERROR,
                format!("invalid json: {e}"),
            );
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    // Best-effort id for shape errors on a single object.
    let recovered_id = value
        .get("id")
        .filter(|v| matches!(v, Value::String(_) | Value::Number(_)))
        .cloned();

    let payload = match codec::parse_payload(value) {
        Ok(p) => p,
        Err(shape) => {
            let body = codec::error_response(
                recovered_id.as_ref(),
                codec::codes::INVALID_REQUEST,
                shape.0,
            );
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    let session_header = header_str(&headers, HEADER_SESSION_ID);

    match payload {
        Payload::Single(message) => {
            let raw_id = message.raw_id().cloned();
            let wants_sse = accept_includes(&headers, EVENT_STREAM_MIME_TYPE);
            match state
                .proxy
                .handle_request(session_header.as_deref(), message, &route.endpoint)
                .await
            {
                Ok(outcome) => match outcome.response {
                    None => accepted_response(outcome.session_id),
                    Some(body) if wants_sse => {
                        sse_single_response(&state, &body, outcome.session_id)
                    }
                    Some(body) => json_response(body, outcome.session_id),
                },
                Err(RequestFailure::EndpointUnknown) => {
                    (StatusCode::NOT_FOUND, "unknown server endpoint").into_response()
                }
                Err(failure) => {
                    // Valid envelope: the failure travels as a JSON-RPC error.
                    let body = codec::error_response(
                        raw_id.as_ref(),
                        failure.code(),
                        failure.message(),
                    );
                    json_response(body, session_header)
                }
            }
        }
        Payload::Batch(messages) => {
            let (session_id, responses) = state
                .proxy
                .handle_batch(session_header.as_deref(), messages, &route.endpoint)
                .await;
            if responses.is_empty() {
                accepted_response(session_id)
            } else {
                json_response(Value::Array(responses), session_id)
            }
        }
    }
}

/// GET: attach an out-of-band SSE stream to the session.
async fn get_mcp(
    State(state): State<Arc<AppState>>,
    Extension(_route): Extension<McpRoute>,
    headers: HeaderMap,
) -> Response {
    if !accept_includes(&headers, EVENT_STREAM_MIME_TYPE) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            "Not Acceptable: Client must accept text/event-stream",
        )
            .into_response();
    }

    let Some(session_id) = header_str(&headers, HEADER_SESSION_ID) else {
        return (StatusCode::BAD_REQUEST, "Bad Request: session id required").into_response();
    };

    let session = match state.proxy.registry().get(&session_id) {
        Ok(session) => session,
        Err(_) => return (StatusCode::NOT_FOUND, "session not found").into_response(),
    };

    let (sink_id, rx) = session.attach_sse();
    let guard = DetachGuard {
        session: session.clone(),
        sink_id,
    };
    tracing::debug!(session = %session.id, sink = sink_id, "sse stream attached");

    let stream = sse_stream(state.clone(), rx, guard);
    let mut response = Response::new(Body::from_stream(stream));
    set_sse_headers(response.headers_mut());
    set_session_header(&mut response, Some(session_id));
    response
}

/// DELETE: destroy the session. Destruction is idempotent, so a missing
/// session still answers 204.
async fn delete_mcp(
    State(state): State<Arc<AppState>>,
    Extension(_route): Extension<McpRoute>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = header_str(&headers, HEADER_SESSION_ID) else {
        return (StatusCode::BAD_REQUEST, "Bad Request: session id required").into_response();
    };

    state.proxy.registry().destroy(&session_id);
    StatusCode::NO_CONTENT.into_response()
}

// ============================================================================
// SSE plumbing
// ============================================================================

/// Removes the sink from the session when the stream is dropped, whichever
/// side (client or session) goes away first.
struct DetachGuard {
    session: Arc<Session>,
    sink_id: u64,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        self.session.detach_sse(self.sink_id);
        tracing::debug!(session = %self.session.id, sink = self.sink_id, "sse stream detached");
    }
}

struct SseStreamState {
    rx: tokio::sync::mpsc::UnboundedReceiver<Value>,
    keep_alive: tokio::time::Interval,
    state: Arc<AppState>,
    opened: bool,
    _guard: DetachGuard,
}

/// The long-lived GET stream: an `:ok` comment to flush headers, then
/// messages as they arrive interleaved with keep-alive comments. Ends when
/// the session closes the sink.
fn sse_stream(
    state: Arc<AppState>,
    rx: tokio::sync::mpsc::UnboundedReceiver<Value>,
    guard: DetachGuard,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let period = state.sse_keep_alive;
    let keep_alive =
        tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let stream_state = SseStreamState {
        rx,
        keep_alive,
        state,
        opened: false,
        _guard: guard,
    };

    futures::stream::unfold(stream_state, |mut s| async move {
        if !s.opened {
            s.opened = true;
            return Some((codec::comment_frame("ok"), s));
        }
        tokio::select! {
            message = s.rx.recv() => match message {
                Some(value) => {
                    let event =
                        SseEvent::message(s.state.event_ids.next(), value.to_string());
                    Some((event.to_frame(), s))
                }
                None => None,
            },
            _ = s.keep_alive.tick() => Some((codec::comment_frame("ping"), s)),
        }
    })
    .map(|frame| Ok(Bytes::from(frame)))
}

/// POST upgrade: one event carrying the response, then close.
fn sse_single_response(
    state: &AppState,
    body: &Value,
    session_id: Option<String>,
) -> Response {
    let event = SseEvent::message(state.event_ids.next(), body.to_string());
    let frame = event.to_frame();
    let stream =
        futures::stream::once(async move { Ok::<_, Infallible>(Bytes::from(frame)) });
    let mut response = Response::new(Body::from_stream(stream));
    set_sse_headers(response.headers_mut());
    set_session_header(&mut response, session_id);
    response
}

fn set_sse_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
}

// ============================================================================
// Response helpers
// ============================================================================

fn json_response(body: Value, session_id: Option<String>) -> Response {
    let mut response = (StatusCode::OK, Json(body)).into_response();
    set_session_header(&mut response, session_id);
    response
}

fn accepted_response(session_id: Option<String>) -> Response {
    let mut response = StatusCode::ACCEPTED.into_response();
    set_session_header(&mut response, session_id);
    response
}

fn set_session_header(response: &mut Response, session_id: Option<String>) {
    if let Some(id) = session_id
        && let Ok(value) = HeaderValue::from_str(&id)
    {
        response.headers_mut().insert(HEADER_SESSION_ID, value);
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn accept_includes(headers: &HeaderMap, mime: &str) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|accept| accept.contains(mime))
}

fn ensure_accepts_post(headers: &HeaderMap) -> Result<(), Response> {
    if accept_includes(headers, JSON_MIME_TYPE)
        || accept_includes(headers, EVENT_STREAM_MIME_TYPE)
        || accept_includes(headers, "*/*")
    {
        Ok(())
    } else {
        Err((
            StatusCode::NOT_ACCEPTABLE,
            "Not Acceptable: Client must accept application/json or text/event-stream",
        )
            .into_response())
    }
}

fn ensure_json_content_type(headers: &HeaderMap) -> Result<(), Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    if content_type.starts_with(JSON_MIME_TYPE) {
        Ok(())
    } else {
        Err((
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Unsupported Media Type: Content-Type must be application/json",
        )
            .into_response())
    }
}
