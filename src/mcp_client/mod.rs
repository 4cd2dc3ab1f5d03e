//! MCP client: JSON-RPC over stdio for tool-server subprocesses.
//!
//! This module handles:
//! - Spawning and supervising server child processes
//! - JSON-RPC 2.0 framing over process stdio (one message per line)
//! - Correlating responses to in-flight requests, with per-request timeouts
//! - The `initialize` handshake and tool/resource calls
//! - A named registry of sessions

pub mod codec;
pub mod config;
pub mod correlator;
pub mod errors;
pub mod manager;
pub mod session;
pub mod types;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

// Re-exports for convenience
pub use config::{ServersConfig, SessionConfig};
pub use errors::McpError;
pub use manager::SessionManager;
pub use session::{Session, SessionState};
pub use types::{McpResource, McpTool, ResourceContents, ToolCallResult, ToolContent};
