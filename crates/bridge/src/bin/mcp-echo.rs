//! Line-delimited echo MCP server.
//!
//! Used by the integration tests and as a local demo target. Answers
//! `initialize` with a fixed result, echoes any other request back under
//! `result.echo`, and understands two test-control notifications:
//! `echo/emit` (emit a server-initiated notification) and `echo/crash`
//! (exit nonzero).

use serde_json::{Value, json};
use std::io::{self, BufRead, Write};

fn main() {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        let method = value.get("method").and_then(Value::as_str);
        let id = value.get("id").filter(|v| !v.is_null()).cloned();

        match (method, id) {
            (Some("initialize"), Some(id)) => write_message(
                &mut out,
                &json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": "2025-03-26",
                        "capabilities": { "tools": true },
                        "serverInfo": { "name": "echo", "version": "1.0.0" },
                    },
                }),
            ),
            (Some("echo/crash"), None) => std::process::exit(1),
            (Some("echo/emit"), None) => {
                let params = value.get("params").cloned().unwrap_or(Value::Null);
                write_message(
                    &mut out,
                    &json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/message",
                        "params": params,
                    }),
                );
            }
            (Some(method), Some(id)) => {
                let params = value.get("params").cloned().unwrap_or(Value::Null);
                write_message(
                    &mut out,
                    &json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": { "echo": { "method": method, "params": params } },
                    }),
                );
            }
            // Remaining notifications and client responses need no reply.
            _ => {}
        }
    }
}

fn write_message(out: &mut impl Write, value: &Value) {
    let _ = writeln!(out, "{value}");
    let _ = out.flush();
}
