//! MCP Client error types.
//!
//! Every fallible session or manager operation returns one of these. The
//! enum is `Clone` so a single failure (process exit, disconnect) can be
//! delivered to every waiting caller.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// The server process could not be spawned or its stdio could not be captured.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// An operation was attempted while the session was not ready.
    #[error("server '{name}' is not connected")]
    NotConnected {
        name: String,
    },

    /// The `initialize` handshake failed or timed out.
    #[error("server '{name}' handshake failed: {source}")]
    HandshakeFailed {
        name: String,
        #[source]
        source: Box<McpError>,
    },

    /// Writing to the server's stdin failed, or the writer is gone.
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// No response arrived within the session's request timeout.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Server returned a JSON-RPC error response.
    ///
    /// `code` is kept as raw JSON: servers are not consistent about using integers.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: serde_json::Value,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The server process exited or one of its streams failed.
    #[error("server '{name}' crashed: {reason}")]
    ServerCrashed {
        name: String,
        reason: String,
    },

    /// The request was abandoned because the session was disconnected.
    #[error("server '{name}' was disconnected while the request was in flight")]
    Disconnected {
        name: String,
    },

    /// A line on the server's stdout could not be decoded.
    #[error("malformed message: {reason}")]
    ParseError {
        reason: String,
        line: String,
    },

    /// A result payload did not have the shape the method promises.
    #[error("invalid '{method}' response: {reason}")]
    InvalidResponse {
        method: String,
        reason: String,
    },

    /// A request id was registered twice. Ids are monotonic, so this is a bug.
    #[error("request id {id} is already registered")]
    AlreadyRegistered {
        id: u64,
    },

    /// Configuration error (missing or unreadable servers file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// Whether the error means the session itself is unusable, as opposed to a
    /// single request going wrong.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            McpError::SpawnFailed { .. }
                | McpError::NotConnected { .. }
                | McpError::HandshakeFailed { .. }
                | McpError::TransportError { .. }
                | McpError::ServerCrashed { .. }
                | McpError::Disconnected { .. }
        )
    }

    /// Whether retrying the same call (after a reconnect, for crashes) can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            McpError::Timeout { .. } | McpError::ServerCrashed { .. } | McpError::TransportError { .. }
        )
    }

    /// The JSON-RPC error code, if this is a `ServerError` with an integer code.
    pub fn server_code(&self) -> Option<i64> {
        match self {
            McpError::ServerError { code, .. } => code.as_i64(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_error_wraps_source() {
        let err = McpError::HandshakeFailed {
            name: "fetch".into(),
            source: Box::new(McpError::Timeout {
                server: "fetch".into(),
                method: "initialize".into(),
                timeout_ms: 500,
            }),
        };
        let text = err.to_string();
        assert!(text.contains("fetch"));
        assert!(text.contains("timed out after 500ms"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_server_error_display_keeps_raw_code() {
        let err = McpError::ServerError {
            code: serde_json::json!("E_TOOL"),
            message: "boom".into(),
            data: None,
        };
        assert_eq!(err.to_string(), "server error [\"E_TOOL\"]: boom");
        assert_eq!(err.server_code(), None);

        let err = McpError::ServerError {
            code: serde_json::json!(-32601),
            message: "Method not found".into(),
            data: None,
        };
        assert_eq!(err.server_code(), Some(-32601));
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(McpError::NotConnected { name: "s".into() }.is_connection_error());
        assert!(McpError::ServerCrashed {
            name: "s".into(),
            reason: "gone".into(),
        }
        .is_connection_error());
        assert!(!McpError::Timeout {
            server: "s".into(),
            method: "tools/list".into(),
            timeout_ms: 1,
        }
        .is_connection_error());
        assert!(!McpError::AlreadyRegistered { id: 3 }.is_connection_error());
    }

    #[test]
    fn test_is_retriable() {
        assert!(McpError::Timeout {
            server: "s".into(),
            method: "m".into(),
            timeout_ms: 1,
        }
        .is_retriable());
        assert!(!McpError::ServerError {
            code: serde_json::json!(-32602),
            message: "bad params".into(),
            data: None,
        }
        .is_retriable());
    }
}
