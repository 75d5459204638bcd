use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to spawn MCP server '{server}': {message}")]
    SpawnFailure { server: String, message: String },

    #[error("MCP handshake with '{server}' failed: {message}")]
    HandshakeFailure { server: String, message: String },

    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    #[error("Request '{method}' was cancelled")]
    RequestCancelled { method: String },

    #[error("{}", format_remote_error(.message, .code))]
    RemoteError { message: String, code: Option<i64> },

    #[error("MCP server process terminated: {0}")]
    ProcessTerminated(String),

    #[error("Failed to send '{method}': {message}")]
    SendFailure { method: String, message: String },

    #[error("MCP transport is closed")]
    TransportClosed,

    #[error("Invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

fn format_remote_error(message: &str, code: &Option<i64>) -> String {
    match code {
        Some(code) => format!("MCP server error {code}: {message}"),
        None => format!("MCP server error: {message}"),
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// A locally invocable tool, as handed to the agent framework.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn label(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> Value;
    async fn execute(&self, args: Value, cancel: Option<CancellationToken>) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let with_code = BridgeError::RemoteError {
            message: "Method not found".to_string(),
            code: Some(-32601),
        };
        assert_eq!(with_code.to_string(), "MCP server error -32601: Method not found");

        let without_code = BridgeError::RemoteError {
            message: "boom".to_string(),
            code: None,
        };
        assert_eq!(without_code.to_string(), "MCP server error: boom");
    }

    #[test]
    fn test_timeout_names_method() {
        let err = BridgeError::RequestTimeout {
            method: "tools/call".to_string(),
            timeout_ms: 50,
        };
        assert!(err.to_string().contains("tools/call"));
    }
}
