//! JSON-RPC 2.0 message parsing, classification, and SSE framing.
//!
//! The bridge is method-agnostic: messages are kept as raw JSON values and
//! only the envelope (version tag, `id`, `method`, `result`/`error`) is
//! validated and inspected. The two methods the transport itself cares about
//! (`initialize` and `notifications/initialized`) get dedicated predicates.

use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes used by the bridge.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_ERROR: i64 = -32000;
    pub const SESSION_NOT_FOUND: i64 = -32001;
    pub const PROCESS_CRASHED: i64 = -32002;
    pub const AUTH_REQUIRED: i64 = -32003;
    pub const UNAUTHORIZED: i64 = -32004;
    pub const SESSION_TIMEOUT: i64 = -32005;
}

/// Envelope-shape violation. Always maps to `-32600` invalid request; the
/// `-32700` parse error is reserved for bodies that are not JSON at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeError(pub String);

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ShapeError {}

fn shape_err(msg: impl Into<String>) -> ShapeError {
    ShapeError(msg.into())
}

/// A single validated JSON-RPC message (request, notification, or response),
/// kept as its raw JSON value.
#[derive(Debug, Clone)]
pub struct JsonRpcMessage(Value);

impl JsonRpcMessage {
    /// Validate the envelope of a decoded JSON value.
    pub fn parse(value: Value) -> Result<Self, ShapeError> {
        let obj = value
            .as_object()
            .ok_or_else(|| shape_err("message must be a JSON object"))?;

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(shape_err("missing or unsupported jsonrpc version tag"));
        }

        if let Some(id) = obj.get("id")
            && !matches!(id, Value::String(_) | Value::Number(_) | Value::Null)
        {
            return Err(shape_err("id must be a string, number, or null"));
        }

        let has_method = obj.contains_key("method");
        let has_result = obj.contains_key("result");
        let has_error = obj.contains_key("error");

        if has_method {
            if obj.get("method").and_then(Value::as_str).is_none() {
                return Err(shape_err("method must be a string"));
            }
            if has_result || has_error {
                return Err(shape_err("request must not carry result or error"));
            }
        } else {
            // Response: id present, exactly one of result/error.
            if !obj.contains_key("id") {
                return Err(shape_err("response must carry an id"));
            }
            if has_result == has_error {
                return Err(shape_err(
                    "response must carry exactly one of result or error",
                ));
            }
        }

        Ok(Self(value))
    }

    /// The `id`, if present and non-null.
    pub fn id(&self) -> Option<&Value> {
        self.0.get("id").filter(|v| !v.is_null())
    }

    /// The `id` exactly as sent, including an explicit null.
    pub fn raw_id(&self) -> Option<&Value> {
        self.0.get("id")
    }

    pub fn method(&self) -> Option<&str> {
        self.0.get("method").and_then(Value::as_str)
    }

    /// True iff a correlated response is expected.
    pub fn needs_response(&self) -> bool {
        self.method().is_some() && self.id().is_some()
    }

    pub fn is_initialize(&self) -> bool {
        self.method() == Some("initialize")
    }

    pub fn is_initialized_notification(&self) -> bool {
        self.method() == Some("notifications/initialized") && self.raw_id().is_none()
    }

    /// True for messages read back from the subprocess that are responses.
    pub fn is_response(&self) -> bool {
        self.0.get("result").is_some() || self.0.get("error").is_some()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// A decoded POST body: one message or a non-empty batch.
#[derive(Debug, Clone)]
pub enum Payload {
    Single(JsonRpcMessage),
    Batch(Vec<JsonRpcMessage>),
}

/// Validate a decoded JSON value as a single message or a batch.
pub fn parse_payload(value: Value) -> Result<Payload, ShapeError> {
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(shape_err("batch must not be empty"));
            }
            let mut messages = Vec::with_capacity(items.len());
            for item in items {
                messages.push(JsonRpcMessage::parse(item)?);
            }
            Ok(Payload::Batch(messages))
        }
        other => Ok(Payload::Single(JsonRpcMessage::parse(other)?)),
    }
}

/// Canonical map key for a JSON-RPC id (compact JSON rendering). Used to key
/// the correlation waiter table; `1` and `"1"` stay distinct.
pub fn id_key(id: &Value) -> String {
    id.to_string()
}

/// Build a JSON-RPC error response. A missing id is echoed as null, per the
/// unparseable-request convention.
pub fn error_response(id: Option<&Value>, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.cloned().unwrap_or(Value::Null),
        "error": { "code": code, "message": message.into() },
    })
}

// ============================================================================
// SSE framing
// ============================================================================

/// Events over this size still go out, but get a warning in the log.
pub const SSE_EVENT_SOFT_CAP_BYTES: usize = 64 * 1024;

/// One server-sent event. `data` is split on `\n` into repeated `data:`
/// lines when framed.
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub id: Option<u64>,
    pub event: Option<String>,
    pub data: Option<String>,
}

impl SseEvent {
    pub fn message(id: u64, data: String) -> Self {
        Self {
            id: Some(id),
            event: None,
            data: Some(data),
        }
    }

    /// Render the wire frame, terminated by a blank line.
    pub fn to_frame(&self) -> String {
        let data_len = self.data.as_ref().map_or(0, String::len);
        if data_len > SSE_EVENT_SOFT_CAP_BYTES {
            tracing::warn!(
                bytes = data_len,
                cap = SSE_EVENT_SOFT_CAP_BYTES,
                "sse event exceeds soft size cap"
            );
        }

        let mut out = String::with_capacity(data_len + 32);
        if let Some(id) = self.id {
            out.push_str(&format!("id: {id}\n"));
        }
        if let Some(event) = &self.event {
            out.push_str(&format!("event: {event}\n"));
        }
        if let Some(data) = &self.data {
            for line in data.split('\n') {
                out.push_str("data: ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out.push('\n');
        out
    }
}

/// A comment-only frame (`:ok`, keep-alives).
pub fn comment_frame(text: &str) -> String {
    format!(":{text}\n\n")
}

/// Process-wide monotone SSE event id source.
#[derive(Debug, Default)]
pub struct EventIdSequence(AtomicU64);

impl EventIdSequence {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_accepts_request_notification_and_response() {
        let req = JsonRpcMessage::parse(json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/list"
        }))
        .expect("request");
        assert!(req.needs_response());
        assert!(!req.is_response());

        let note = JsonRpcMessage::parse(json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        }))
        .expect("notification");
        assert!(!note.needs_response());
        assert!(note.is_initialized_notification());

        let resp = JsonRpcMessage::parse(json!({
            "jsonrpc": "2.0", "id": "a", "result": {}
        }))
        .expect("response");
        assert!(resp.is_response());
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        // Not an object.
        assert!(JsonRpcMessage::parse(json!("hello")).is_err());
        // Wrong version tag.
        assert!(JsonRpcMessage::parse(json!({"jsonrpc": "1.0", "method": "m"})).is_err());
        // Non-string method.
        assert!(JsonRpcMessage::parse(json!({"jsonrpc": "2.0", "id": 1, "method": 123})).is_err());
        // Structured id.
        assert!(
            JsonRpcMessage::parse(json!({"jsonrpc": "2.0", "id": {"k": 1}, "method": "m"}))
                .is_err()
        );
        // Response with both result and error.
        assert!(
            JsonRpcMessage::parse(
                json!({"jsonrpc": "2.0", "id": 1, "result": {}, "error": {"code": 1, "message": "x"}})
            )
            .is_err()
        );
        // Response with neither.
        assert!(JsonRpcMessage::parse(json!({"jsonrpc": "2.0", "id": 1})).is_err());
    }

    #[test]
    fn null_id_means_no_response_expected() {
        let msg = JsonRpcMessage::parse(json!({
            "jsonrpc": "2.0", "id": null, "method": "m"
        }))
        .expect("parse");
        assert!(!msg.needs_response());
        assert!(msg.raw_id().is_some());
        assert!(msg.id().is_none());
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(parse_payload(json!([])).is_err());
    }

    #[test]
    fn batch_preserves_order() {
        let payload = parse_payload(json!([
            {"jsonrpc": "2.0", "id": 1, "method": "a"},
            {"jsonrpc": "2.0", "method": "b"},
        ]))
        .expect("batch");
        let Payload::Batch(messages) = payload else {
            panic!("expected batch");
        };
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].method(), Some("a"));
        assert_eq!(messages[1].method(), Some("b"));
    }

    #[test]
    fn id_key_distinguishes_string_and_number() {
        assert_ne!(id_key(&json!(1)), id_key(&json!("1")));
        assert_eq!(id_key(&json!("i1")), "\"i1\"");
    }

    #[test]
    fn error_response_echoes_null_for_missing_id() {
        let resp = error_response(None, codes::PARSE_ERROR, "bad json");
        assert!(resp["id"].is_null());
        assert_eq!(resp["error"]["code"], json!(codes::PARSE_ERROR));
    }

    #[test]
    fn sse_frame_splits_multiline_data() {
        let event = SseEvent {
            id: Some(7),
            event: Some("message".to_string()),
            data: Some("line1\nline2".to_string()),
        };
        assert_eq!(
            event.to_frame(),
            "id: 7\nevent: message\ndata: line1\ndata: line2\n\n"
        );
    }

    #[test]
    fn comment_frame_flushes_headers() {
        assert_eq!(comment_frame("ok"), ":ok\n\n");
    }

    #[test]
    fn event_ids_are_strictly_monotone() {
        let seq = EventIdSequence::default();
        let a = seq.next();
        let b = seq.next();
        assert!(b > a);
    }
}
