//! toolwire: drive MCP tool servers over stdio.
//!
//! A [`Session`] owns one server subprocess and speaks newline-delimited
//! JSON-RPC 2.0 with it; a [`SessionManager`] keeps sessions by name.
//!
//! ```no_run
//! # async fn demo() -> Result<(), toolwire::McpError> {
//! use toolwire::{SessionConfig, SessionManager};
//!
//! let manager = SessionManager::new();
//! let session = manager
//!     .connect(SessionConfig::new("fetch", "npx").args(["tsx", "src/index.ts"]))
//!     .await?;
//! for tool in session.list_tools().await? {
//!     println!("{}: {}", tool.name, tool.description);
//! }
//! manager.disconnect_all().await;
//! # Ok(())
//! # }
//! ```

pub mod logging;
pub mod mcp_client;

pub use mcp_client::{
    McpError, McpResource, McpTool, ResourceContents, ServersConfig, Session, SessionConfig,
    SessionManager, SessionState, ToolCallResult, ToolContent,
};
