#![allow(dead_code)]

use bridge::codec::EventIdSequence;
use bridge::config::{AuthConfig, CorsConfig, ServerConfig};
use bridge::http::{self, AppState};
use bridge::proxy::{ProxyCore, ProxySettings};
use bridge::session::{SessionRegistry, SessionSettings};
use bridge::supervisor::{ProcessSupervisor, SupervisorSettings};
use futures::StreamExt as _;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, atomic::AtomicU64};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const SESSION_HEADER: &str = "Mcp-Session-Id";
pub const JSON_MIME: &str = "application/json";
pub const SSE_MIME: &str = "text/event-stream";

pub struct TestBridge {
    pub base: String,
    pub state: Arc<AppState>,
    server: tokio::task::JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Drop for TestBridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.server.abort();
    }
}

/// Boot a bridge around the crate's `mcp-echo` helper binary, served on an
/// ephemeral port.
pub async fn start_echo_bridge(max_restart_attempts: u32) -> TestBridge {
    let (supervisor, process_events) = ProcessSupervisor::new(SupervisorSettings {
        spawn_wait: Duration::from_millis(150),
        restart_delay: Duration::from_millis(50),
        max_restart_attempts,
    });
    let (registry, registry_events) = SessionRegistry::new(SessionSettings {
        max_sessions: 10,
        session_timeout: Duration::from_secs(60),
    });

    let mut servers = HashMap::new();
    servers.insert(
        "echo".to_string(),
        ServerConfig {
            command: env!("CARGO_BIN_EXE_mcp-echo").to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            endpoint: None,
        },
    );

    let proxy = ProxyCore::new(
        supervisor,
        registry,
        &servers,
        ProxySettings {
            request_timeout: Duration::from_secs(5),
            batch_timeout: Duration::from_secs(5),
        },
    );

    let shutdown = CancellationToken::new();
    proxy.spawn_event_pump(process_events, registry_events, shutdown.child_token());

    let state = Arc::new(AppState {
        proxy,
        cors: CorsConfig::default(),
        auth: AuthConfig::default(),
        sse_keep_alive: Duration::from_secs(30),
        event_ids: EventIdSequence::default(),
        start_time: Instant::now(),
        version: "test",
        total_requests: AtomicU64::new(0),
        failed_requests: AtomicU64::new(0),
    });

    let router = http::create_router(state.clone());
    let router = http::with_request_counting(router, state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    TestBridge {
        base: format!("http://{addr}"),
        state,
        server,
        shutdown,
    }
}

pub fn initialize_request(id: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": { "name": "t", "version": "1" },
        },
    })
}

/// POST a message with JSON accept; returns the response.
pub async fn post_json(
    base: &str,
    session_id: Option<&str>,
    body: &Value,
) -> reqwest::Response {
    let mut request = reqwest::Client::new()
        .post(format!("{base}/echo"))
        .header(reqwest::header::ACCEPT, JSON_MIME)
        .header(reqwest::header::CONTENT_TYPE, JSON_MIME)
        .body(body.to_string());
    if let Some(id) = session_id {
        request = request.header(SESSION_HEADER, id);
    }
    request.send().await.expect("post")
}

/// Initialize a fresh session and return its id.
pub async fn open_session(base: &str) -> String {
    let resp = post_json(base, None, &initialize_request("init-1")).await;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    resp.headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .expect("session header on initialize response")
        .to_string()
}

/// Consume an SSE response body until `needle` shows up, returning everything
/// read so far. Panics on timeout.
pub async fn read_sse_until(response: reqwest::Response, needle: &str) -> String {
    let mut stream = response.bytes_stream();
    let mut collected = String::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.expect("sse chunk");
            collected.push_str(&String::from_utf8_lossy(&chunk));
            if collected.contains(needle) {
                break;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("needle '{needle}' not seen; got: {collected}"));
    collected
}
