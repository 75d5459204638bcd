//! MCP client implementation: launch, handshake, calls and shutdown

use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use toolbridge_config::TimeoutSettings;
use toolbridge_core::{BridgeError, Result};
use tracing::{debug, info, warn};

use crate::framing::Framing;
use crate::spec::ServerSpec;
use crate::transport::{StdioTransport, Transport};
use crate::types::{
    InitializeParams, InitializeResult, RemoteToolDescriptor, ServerInfo, ToolCallParams,
    PROTOCOL_VERSION,
};

/// Framings tried at launch, in order. Each gets one fresh process.
const LAUNCH_FRAMINGS: [Framing; 2] = [Framing::Line, Framing::Header];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Launching,
    Initializing,
    Ready,
    Closing,
    Closed,
}

/// MCP client for communicating with one MCP server
pub struct McpClient {
    /// Server name for identification
    name: String,

    transport: Arc<dyn Transport>,

    state: Mutex<ClientState>,

    timeouts: TimeoutSettings,

    /// Set after a successful handshake
    server_info: Option<ServerInfo>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("transport", &self.transport)
            .finish()
    }
}

impl McpClient {
    /// Spawn the server and complete the handshake. Line framing is tried
    /// first; if the handshake fails the process is torn down and a fresh
    /// one is tried once with header framing.
    pub async fn launch(
        spec: &ServerSpec,
        working_dir: &Path,
        timeouts: TimeoutSettings,
    ) -> Result<Self> {
        let mut last_error = None;

        for framing in LAUNCH_FRAMINGS {
            debug!("MCP server '{}': {:?} ({} framing)", spec.name, ClientState::Launching, framing);
            let transport: Arc<dyn Transport> =
                Arc::new(StdioTransport::spawn(spec, working_dir, framing)?);

            match Self::connect(spec.name.clone(), transport.clone(), timeouts).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    warn!(
                        "MCP server '{}' handshake failed with {} framing: {}",
                        spec.name, framing, e
                    );
                    transport.terminate(timeouts.exit_grace()).await;
                    last_error = Some(e);
                }
            }
        }

        Err(BridgeError::HandshakeFailure {
            server: spec.name.clone(),
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no framing attempted".to_string()),
        })
    }

    /// Perform the handshake over an already running transport.
    pub async fn connect(
        name: String,
        transport: Arc<dyn Transport>,
        timeouts: TimeoutSettings,
    ) -> Result<Self> {
        debug!("MCP server '{}': {:?}", name, ClientState::Initializing);

        let params = serde_json::to_value(InitializeParams::default())?;
        let response = transport
            .request("initialize", Some(params), timeouts.initialize(), None)
            .await?;

        let result: InitializeResult = serde_json::from_value(response).unwrap_or_default();
        match result.protocol_version.as_deref() {
            Some(PROTOCOL_VERSION) | None => {}
            Some(other) => warn!(
                "MCP server '{}' uses protocol version '{}' (we sent '{}')",
                name, other, PROTOCOL_VERSION
            ),
        }

        transport.notify("notifications/initialized", None).await?;

        match &result.server_info {
            Some(server_info) => info!(
                "MCP server '{}' ready ({} framing): {} v{}",
                name,
                transport.framing(),
                server_info.name,
                server_info.version
            ),
            None => info!("MCP server '{}' ready ({} framing)", name, transport.framing()),
        }

        Ok(Self {
            name,
            transport,
            state: Mutex::new(ClientState::Ready),
            timeouts,
            server_info: result.server_info,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn framing(&self) -> Framing {
        self.transport.framing()
    }

    pub fn state(&self) -> ClientState {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state == ClientState::Ready && self.transport.is_closed() {
            ClientState::Closed
        } else {
            state
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ClientState::Ready => Ok(()),
            _ => Err(BridgeError::TransportClosed),
        }
    }

    /// List available tools from the MCP server
    pub async fn list_tools(&self) -> Result<Vec<RemoteToolDescriptor>> {
        self.ensure_ready()?;
        debug!("Listing tools from MCP server: {}", self.name);

        let result = self
            .transport
            .request("tools/list", None, self.timeouts.list_tools(), None)
            .await?;
        let tools = RemoteToolDescriptor::from_list_result(&result);

        info!("Discovered {} tools from MCP server '{}'", tools.len(), self.name);
        Ok(tools)
    }

    /// Call a tool on the MCP server, returning the raw `result`
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        self.ensure_ready()?;
        debug!("Calling MCP tool '{}' on server '{}'", name, self.name);

        let params = ToolCallParams {
            name: name.to_string(),
            arguments,
        };
        self.transport
            .request(
                "tools/call",
                Some(serde_json::to_value(params)?),
                self.timeouts.call_tool(),
                cancel,
            )
            .await
    }

    /// Shut the server down: `shutdown` request and `exit` notification
    /// (both best effort), then end stdin and escalate signals until the
    /// process is gone. Only the first call does anything.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, ClientState::Closing | ClientState::Closed) {
                return;
            }
            *state = ClientState::Closing;
        }
        debug!("Closing MCP client: {}", self.name);

        if !self.transport.is_closed() {
            if let Err(e) = self
                .transport
                .request("shutdown", None, self.timeouts.shutdown(), None)
                .await
            {
                debug!("MCP server '{}' shutdown request failed: {}", self.name, e);
            }
            if let Err(e) = self.transport.notify("exit", None).await {
                debug!("MCP server '{}' exit notification failed: {}", self.name, e);
            }
        }

        self.transport.terminate(self.timeouts.exit_grace()).await;

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ClientState::Closed;
        info!("MCP server '{}' stopped", self.name);
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        debug!("Dropping MCP client: {}", self.name);
    }
}
