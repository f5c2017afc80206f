//! Request routing and response correlation.
//!
//! The proxy core mediates between the HTTP front-end and the supervised
//! subprocesses: an `initialize` request opens a session and spawns its
//! process; subsequent requests route by session id; responses coming back
//! on the subprocess's stdout complete per-request waiters keyed by
//! `(session id, request id)`; everything uncorrelated fans out to the
//! session's SSE stream or queue.

use crate::codec::{self, JsonRpcMessage};
use crate::config::ServerConfig;
use crate::session::{RegistryEvent, SessionLookupError, SessionRegistry};
use crate::supervisor::{ProcessEvent, ProcessSupervisor};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub request_timeout: Duration,
    pub batch_timeout: Duration,
}

/// Request-level failures and their JSON-RPC error-code mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFailure {
    /// Unknown server endpoint. Mapped to HTTP 404, never an envelope.
    EndpointUnknown,
    InvalidRequest(String),
    SessionNotFound,
    SessionExpired,
    ResourceExhausted(String),
    /// Write refused: the subprocess is not running.
    ProcessUnavailable(String),
    /// The subprocess died while the request was in flight.
    SessionTerminated,
    /// No correlated response inside the wait window. The session survives.
    Timeout,
    Internal(String),
}

impl RequestFailure {
    pub fn code(&self) -> i64 {
        match self {
            Self::EndpointUnknown => codec::codes::METHOD_NOT_FOUND,
            Self::InvalidRequest(_) => codec::codes::INVALID_REQUEST,
            Self::SessionNotFound => codec::codes::SESSION_NOT_FOUND,
            Self::SessionExpired => codec::codes::SESSION_TIMEOUT,
            Self::ResourceExhausted(_) => codec::codes::SERVER_ERROR,
            Self::ProcessUnavailable(_) | Self::SessionTerminated => {
                codec::codes::PROCESS_CRASHED
            }
            Self::Timeout | Self::Internal(_) => codec::codes::INTERNAL_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::EndpointUnknown => "unknown server endpoint".to_string(),
            Self::InvalidRequest(msg) => msg.clone(),
            Self::SessionNotFound => "session not found".to_string(),
            Self::SessionExpired => "session expired".to_string(),
            Self::ResourceExhausted(msg) => msg.clone(),
            Self::ProcessUnavailable(msg) => format!("subprocess unavailable: {msg}"),
            Self::SessionTerminated => "session terminated: subprocess exited".to_string(),
            Self::Timeout => "timed out waiting for subprocess response".to_string(),
            Self::Internal(msg) => msg.clone(),
        }
    }
}

/// What the front-end should do with a handled request.
#[derive(Debug)]
pub struct RequestOutcome {
    /// The session the request ran against (echoed in `Mcp-Session-Id`).
    pub session_id: Option<String>,
    /// `None` for notifications and forwarded responses (HTTP 202).
    pub response: Option<Value>,
}

type WaiterKey = (String, String);

#[derive(Clone)]
pub struct ProxyCore {
    supervisor: ProcessSupervisor,
    registry: SessionRegistry,
    /// Endpoint path → (server name, config).
    servers: Arc<HashMap<String, (String, Arc<ServerConfig>)>>,
    waiters: Arc<Mutex<HashMap<WaiterKey, oneshot::Sender<Value>>>>,
    settings: ProxySettings,
}

impl ProxyCore {
    pub fn new(
        supervisor: ProcessSupervisor,
        registry: SessionRegistry,
        servers: &HashMap<String, ServerConfig>,
        settings: ProxySettings,
    ) -> Self {
        let servers = servers
            .iter()
            .map(|(name, config)| {
                (
                    config.endpoint_for(name),
                    (name.clone(), Arc::new(config.clone())),
                )
            })
            .collect();
        Self {
            supervisor,
            registry,
            servers: Arc::new(servers),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            settings,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Configured endpoint paths.
    pub fn endpoints(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Handle one message: open a session for `initialize`, route everything
    /// else by session id, forward, and wait for the correlated response
    /// when one is expected.
    pub async fn handle_request(
        &self,
        session_id: Option<&str>,
        message: JsonRpcMessage,
        endpoint: &str,
    ) -> Result<RequestOutcome, RequestFailure> {
        self.handle_request_inner(session_id, message, endpoint, self.settings.request_timeout)
            .await
    }

    /// Handle each batch entry in input order, collecting non-null
    /// responses. Element failures become error responses in place; the
    /// batch deadline yields partial results.
    pub async fn handle_batch(
        &self,
        session_id: Option<&str>,
        messages: Vec<JsonRpcMessage>,
        endpoint: &str,
    ) -> (Option<String>, Vec<Value>) {
        let deadline = Instant::now() + self.settings.batch_timeout;
        let mut current_session = session_id.map(str::to_string);
        let mut responses = Vec::new();

        for message in messages {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("batch deadline exceeded; returning partial results");
                break;
            }
            let raw_id = message.raw_id().cloned();
            let wait = remaining.min(self.settings.request_timeout);
            match self
                .handle_request_inner(current_session.as_deref(), message, endpoint, wait)
                .await
            {
                Ok(outcome) => {
                    if outcome.session_id.is_some() {
                        current_session = outcome.session_id;
                    }
                    if let Some(response) = outcome.response {
                        responses.push(response);
                    }
                }
                Err(failure) => {
                    responses.push(codec::error_response(
                        raw_id.as_ref(),
                        failure.code(),
                        failure.message(),
                    ));
                }
            }
        }

        (current_session, responses)
    }

    async fn handle_request_inner(
        &self,
        session_id: Option<&str>,
        message: JsonRpcMessage,
        endpoint: &str,
        wait: Duration,
    ) -> Result<RequestOutcome, RequestFailure> {
        let session = if message.is_initialize() {
            if session_id.is_some() {
                return Err(RequestFailure::InvalidRequest(
                    "initialize must not carry a session id".to_string(),
                ));
            }
            self.open_session(endpoint).await?
        } else {
            let id = session_id.ok_or(RequestFailure::SessionNotFound)?;
            self.registry.get(id).map_err(|e| match e {
                SessionLookupError::NotFound => RequestFailure::SessionNotFound,
                SessionLookupError::Expired => RequestFailure::SessionExpired,
            })?
        };

        let response = self.forward(&session, &message, wait).await?;
        Ok(RequestOutcome {
            session_id: Some(session.id.clone()),
            response,
        })
    }

    /// Create a session and its supervised subprocess; bind them. A spawn
    /// failure tears the session back down and surfaces the error.
    async fn open_session(
        &self,
        endpoint: &str,
    ) -> Result<Arc<crate::session::Session>, RequestFailure> {
        let (name, config) = self
            .servers
            .get(endpoint)
            .ok_or(RequestFailure::EndpointUnknown)?;

        let session = self
            .registry
            .create(name)
            .map_err(|e| RequestFailure::ResourceExhausted(e.to_string()))?;

        let handle_id = format!("session-{}", session.id);
        if let Err(e) = self.supervisor.spawn(&handle_id, (**config).clone()).await {
            self.registry.destroy(&session.id);
            return Err(RequestFailure::Internal(e.to_string()));
        }
        self.registry.bind_handle(&session, &handle_id);
        Ok(session)
    }

    async fn forward(
        &self,
        session: &crate::session::Session,
        message: &JsonRpcMessage,
        wait: Duration,
    ) -> Result<Option<Value>, RequestFailure> {
        let handle_id = session.handle_id().ok_or_else(|| {
            RequestFailure::ProcessUnavailable("no subprocess bound".to_string())
        })?;
        let payload = serde_json::to_string(message.as_value())
            .map_err(|e| RequestFailure::Internal(format!("serialize failed: {e}")))?;

        let Some(id) = message.id() else {
            // Notification or forwarded response: fire and forget.
            self.supervisor
                .write_line(&handle_id, &payload)
                .await
                .map_err(|e| RequestFailure::ProcessUnavailable(e.to_string()))?;
            return Ok(None);
        };
        if !message.needs_response() {
            self.supervisor
                .write_line(&handle_id, &payload)
                .await
                .map_err(|e| RequestFailure::ProcessUnavailable(e.to_string()))?;
            return Ok(None);
        }

        let id_key = codec::id_key(id);
        let key: WaiterKey = (session.id.clone(), id_key.clone());
        let (tx, rx) = oneshot::channel();
        // Register before writing so a fast response cannot slip past.
        self.waiters.lock().insert(key.clone(), tx);
        if message.is_initialize() {
            session.set_init_request_id(id_key);
        }

        if let Err(e) = self.supervisor.write_line(&handle_id, &payload).await {
            self.waiters.lock().remove(&key);
            return Err(RequestFailure::ProcessUnavailable(e.to_string()));
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(response)) => Ok(Some(response)),
            // Waiter dropped: the subprocess crashed or the session died.
            Ok(Err(_)) => Err(RequestFailure::SessionTerminated),
            Err(_) => {
                self.waiters.lock().remove(&key);
                Err(RequestFailure::Timeout)
            }
        }
    }

    /// Drive supervisor and registry events. The single consumer of both
    /// channels, and the only place a session's subprocess is killed.
    pub fn spawn_event_pump(
        &self,
        mut process_events: UnboundedReceiver<ProcessEvent>,
        mut registry_events: UnboundedReceiver<RegistryEvent>,
        shutdown: CancellationToken,
    ) {
        let proxy = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = process_events.recv() => match event {
                        Some(event) => proxy.on_process_event(event),
                        None => break,
                    },
                    event = registry_events.recv() => match event {
                        Some(event) => proxy.on_registry_event(event).await,
                        None => break,
                    },
                    () = shutdown.cancelled() => break,
                }
            }
        });
    }

    fn on_process_event(&self, event: ProcessEvent) {
        match event {
            ProcessEvent::Stdout { id, line } => self.on_stdout_line(&id, &line),
            ProcessEvent::Stderr { id, line } => {
                tracing::debug!(handle = %id, "subprocess stderr: {line}");
            }
            ProcessEvent::Started { id } => {
                tracing::debug!(handle = %id, "subprocess started");
            }
            ProcessEvent::Restarted { id, attempt } => {
                tracing::info!(handle = %id, attempt, "subprocess restarted");
            }
            ProcessEvent::Stopped { id, code } => {
                tracing::debug!(handle = %id, ?code, "subprocess stopped");
            }
            ProcessEvent::Crashed { id, error, fatal } => {
                let Some(session) = self.registry.session_for_handle(&id) else {
                    return;
                };
                // In-flight requests never survive a crash, restartable or not.
                self.fail_waiters(&session.id);
                if fatal {
                    tracing::warn!(
                        session = %session.id,
                        handle = %id,
                        error = %error,
                        "restart budget exhausted; destroying session"
                    );
                    self.registry.destroy(&session.id);
                }
            }
        }
    }

    /// Parse one stdout line and dispatch it: complete the matching waiter,
    /// or hand the message to the session (SSE or queue).
    fn on_stdout_line(&self, handle_id: &str, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(handle = %handle_id, error = %e, "subprocess wrote non-JSON line");
                return;
            }
        };
        let message = match JsonRpcMessage::parse(value) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(handle = %handle_id, error = %e, "subprocess wrote invalid JSON-RPC");
                return;
            }
        };

        let Some(session) = self.registry.session_for_handle(handle_id) else {
            tracing::warn!(handle = %handle_id, "dropping message from unowned subprocess");
            return;
        };
        session.touch();

        if message.is_response()
            && let Some(id_key) = message.id().map(codec::id_key)
        {
            // The initialize response flips the flag whether or not its
            // waiter is still around.
            if session.take_init_request_id(&id_key) {
                session.mark_initialized();
            }
            let waiter = self.waiters.lock().remove(&(session.id.clone(), id_key));
            if let Some(waiter) = waiter {
                let _ = waiter.send(message.into_value());
                return;
            }
        }

        let delivery = session.dispatch(message.into_value());
        tracing::trace!(session = %session.id, ?delivery, "server-initiated message");
    }

    async fn on_registry_event(&self, event: RegistryEvent) {
        let RegistryEvent::Destroyed {
            session_id,
            handle_id,
        } = event;
        self.fail_waiters(&session_id);
        if let Some(handle_id) = handle_id {
            self.supervisor.kill(&handle_id).await;
        }
    }

    /// Wake every pending waiter for a session by dropping its sender.
    fn fail_waiters(&self, session_id: &str) {
        self.waiters
            .lock()
            .retain(|(sid, _), _| sid != session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSettings;
    use crate::supervisor::SupervisorSettings;
    use serde_json::json;
    use std::collections::HashMap;

    fn sh_server(script: &str) -> ServerConfig {
        ServerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            cwd: None,
            endpoint: None,
        }
    }

    fn build(script: &str, max_restarts: u32, request_timeout: Duration) -> ProxyCore {
        let (supervisor, process_rx) = ProcessSupervisor::new(SupervisorSettings {
            spawn_wait: Duration::from_millis(50),
            restart_delay: Duration::from_millis(20),
            max_restart_attempts: max_restarts,
        });
        let (registry, registry_rx) = SessionRegistry::new(SessionSettings {
            max_sessions: 10,
            session_timeout: Duration::from_secs(60),
        });
        let mut servers = HashMap::new();
        servers.insert("echo".to_string(), sh_server(script));
        let proxy = ProxyCore::new(
            supervisor,
            registry,
            &servers,
            ProxySettings {
                request_timeout,
                batch_timeout: Duration::from_secs(2),
            },
        );
        proxy.spawn_event_pump(process_rx, registry_rx, CancellationToken::new());
        proxy
    }

    fn initialize_request(id: &str) -> JsonRpcMessage {
        JsonRpcMessage::parse(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": { "protocolVersion": "2025-03-26" },
        }))
        .expect("valid request")
    }

    // Responds to every input line with a fixed response for id "i1".
    const REPLY_I1: &str =
        r#"while read line; do echo '{"jsonrpc":"2.0","id":"i1","result":{"ok":true}}'; done"#;

    #[tokio::test]
    async fn initialize_round_trip_creates_session_and_correlates() {
        let proxy = build(REPLY_I1, 3, Duration::from_secs(5));
        let outcome = proxy
            .handle_request(None, initialize_request("i1"), "/echo")
            .await
            .expect("initialize");

        let session_id = outcome.session_id.expect("session id");
        let response = outcome.response.expect("response");
        assert_eq!(response["id"], json!("i1"));
        assert_eq!(response["result"]["ok"], json!(true));

        let session = proxy.registry().get(&session_id).expect("session lives");
        assert!(session.is_initialized());
    }

    #[tokio::test]
    async fn initialize_with_session_id_is_invalid() {
        let proxy = build(REPLY_I1, 3, Duration::from_secs(5));
        let err = proxy
            .handle_request(Some("s1"), initialize_request("i1"), "/echo")
            .await
            .unwrap_err();
        assert!(matches!(err, RequestFailure::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn unknown_endpoint_is_rejected() {
        let proxy = build(REPLY_I1, 3, Duration::from_secs(5));
        let err = proxy
            .handle_request(None, initialize_request("i1"), "/nope")
            .await
            .unwrap_err();
        assert_eq!(err, RequestFailure::EndpointUnknown);
    }

    #[tokio::test]
    async fn non_initialize_without_session_fails() {
        let proxy = build(REPLY_I1, 3, Duration::from_secs(5));
        let message = JsonRpcMessage::parse(json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/list"
        }))
        .expect("request");
        let err = proxy
            .handle_request(None, message, "/echo")
            .await
            .unwrap_err();
        assert_eq!(err, RequestFailure::SessionNotFound);

        let message = JsonRpcMessage::parse(json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/list"
        }))
        .expect("request");
        let err = proxy
            .handle_request(Some("missing"), message, "/echo")
            .await
            .unwrap_err();
        assert_eq!(err, RequestFailure::SessionNotFound);
    }

    #[tokio::test]
    async fn wait_timeout_leaves_the_session_alive() {
        // Consumes stdin, never answers.
        let proxy = build("cat > /dev/null", 3, Duration::from_millis(100));
        let err = proxy
            .handle_request(None, initialize_request("i1"), "/echo")
            .await
            .unwrap_err();
        assert_eq!(err, RequestFailure::Timeout);

        // The session survives a correlation timeout.
        assert_eq!(proxy.registry().len(), 1);
    }

    #[tokio::test]
    async fn fatal_crash_fails_waiters_and_destroys_the_session() {
        // Survives the start window, then exits as soon as input arrives.
        let proxy = build("sleep 0.1; read line; exit 1", 0, Duration::from_secs(5));
        let err = proxy
            .handle_request(None, initialize_request("i1"), "/echo")
            .await
            .unwrap_err();
        assert_eq!(err, RequestFailure::SessionTerminated);

        // Budget of zero: session destroyed with the subprocess.
        tokio::time::timeout(Duration::from_secs(2), async {
            while proxy.registry().len() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session destroyed");
    }

    #[tokio::test]
    async fn notification_returns_no_response() {
        let proxy = build(REPLY_I1, 3, Duration::from_secs(5));
        let outcome = proxy
            .handle_request(None, initialize_request("i1"), "/echo")
            .await
            .expect("initialize");
        let session_id = outcome.session_id.expect("session id");

        let note = JsonRpcMessage::parse(json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        }))
        .expect("notification");
        let outcome = proxy
            .handle_request(Some(&session_id), note, "/echo")
            .await
            .expect("notification accepted");
        assert!(outcome.response.is_none());
    }

    #[tokio::test]
    async fn batch_preserves_order_and_skips_notification_responses() {
        let proxy = build(REPLY_I1, 3, Duration::from_secs(5));
        let batch = vec![
            initialize_request("i1"),
            JsonRpcMessage::parse(json!({
                "jsonrpc": "2.0", "method": "notifications/initialized"
            }))
            .expect("notification"),
        ];
        let (session_id, responses) = proxy.handle_batch(None, batch, "/echo").await;
        assert!(session_id.is_some());
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], json!("i1"));
    }
}
