//! # toolwire
//!
//! A tool-invocation protocol over JSON-RPC 2.0. A server exposes named,
//! schema-described tools (plus lighter resource and prompt catalogs); a client
//! discovers and invokes them over either a one-shot HTTP binding or a
//! persistent WebSocket binding.
//!
//! ## Features
//!
//! - Envelope codec that turns malformed input into error responses
//! - Request (HTTP) and stream (WebSocket) transports, picked by URL scheme
//! - Out-of-order response correlation and reconnection with backoff
//! - A tool registry with argument validation shared by every binding
//!
//! ## Example
//!
//! ```no_run
//! use serde_json::json;
//! use toolwire::client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), toolwire::Error> {
//!     let session = client::connect("ws://localhost:8080").await?;
//!
//!     for tool in session.available_tools() {
//!         println!("{}: {}", tool.name, tool.description);
//!     }
//!     let reply = session.call_tool("echo", json!({"message": "hi"})).await?;
//!     println!("{reply}");
//!
//!     session.disconnect().await
//! }
//! ```

/// Client entry points and notification handlers
pub mod client;
/// Connection and server configuration
pub mod config;
/// Error types and handling
pub mod error;
/// Wire envelope and codec
pub mod protocol;
/// Tool, resource and prompt catalog
pub mod registry;
/// Dispatcher and listeners
pub mod server;
/// Client session
pub mod session;
/// Transport layer implementations (HTTP, WebSocket)
pub mod transport;
/// Descriptor and method parameter types
pub mod types;

// Re-export commonly used types for convenience
pub use config::{ConnectionConfig, CredentialInjector, ServerConfig};
pub use error::{Error, ErrorCode};
pub use protocol::{
    Message, Notification, Request, RequestId, Response, JSONRPC_VERSION, PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
pub use registry::{tool_fn, ToolHandler, ToolRegistry};
pub use server::{Server, ServerBuilder};
pub use session::Session;
pub use types::*;
