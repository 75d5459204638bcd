//! Transport layer for MCP communication
//!
//! The [`Transport`] trait is the seam between the lifecycle controller and
//! whatever carries the JSON-RPC frames. Only a process-based stdio
//! transport is provided.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use toolbridge_core::Result;

use crate::framing::Framing;

pub mod stdio;

pub use stdio::StdioTransport;

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Send a JSON-RPC request and wait for the matching response
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value>;

    /// Send a JSON-RPC notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Close the write side, then escalate until the peer is gone. Each
    /// escalation step waits at most `grace`.
    async fn terminate(&self, grace: Duration);

    /// Whether the peer is gone and no more messages can be exchanged
    fn is_closed(&self) -> bool;

    /// Framing negotiated for this transport
    fn framing(&self) -> Framing;
}
