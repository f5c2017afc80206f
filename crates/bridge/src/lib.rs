//! MCP stdio ↔ Streamable HTTP bridge.
//!
//! Spawns locally-configured MCP servers speaking line-delimited JSON-RPC
//! over stdio and exposes each of them over the Streamable HTTP transport
//! (2025-03-26): POSTed JSON-RPC with optional SSE upgrade, an out-of-band
//! GET stream per session, and session lifecycle via the `Mcp-Session-Id`
//! header.

pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod session;
pub mod supervisor;
pub mod timeouts;
