//! MCP protocol plane
//!
//! The session manager owns `(transport, server, accounting)` triples for
//! the stateful HTTP mode; transports bridge HTTP requests (or stdin
//! lines) into a [`ProtocolServer`], which dispatches JSON-RPC onto the
//! fixed read-only tool set.
//!
//! # Architecture
//!
//! - [`McpSessionManager`] - session registry with idle eviction
//! - [`HttpTransport`] - per-session (or one-shot) request bridge
//! - [`GatewayServer`] - the `ProtocolServer` implementation
//! - [`tools`] - read-only tool handlers and the SQL guard

pub mod server;
pub mod session;
pub mod tools;
pub mod transport;

pub use server::{GatewayServer, ProtocolServer};
pub use session::{McpSessionManager, SessionStats};
pub use transport::HttpTransport;

/// Protocol revision the gateway negotiates during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
