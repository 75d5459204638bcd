//! Discovery across servers and the aggregate tool set
//!
//! Launches every declared server concurrently, lists their tools, names
//! them, and hands back one [`McpToolSet`] owning all launched clients.

use futures::future::join_all;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use toolbridge_config::TimeoutSettings;
use toolbridge_core::Tool;
use tracing::{debug, info, warn};

use crate::client::McpClient;
use crate::naming::ToolNameRegistry;
use crate::spec::{normalize_server_specs, ServerSpec};
use crate::tool_wrapper::McpToolWrapper;
use crate::types::RemoteToolDescriptor;

/// Input to [`create_tools`]
#[derive(Debug, Clone)]
pub struct CreateToolsOptions {
    /// Working directory for every server process
    pub workspace_dir: PathBuf,
    /// Raw, untrusted server declarations
    pub server_declarations: Vec<Value>,
    pub timeouts: TimeoutSettings,
}

/// Bridged tools plus the servers backing them.
pub struct McpToolSet {
    tools: Vec<Arc<dyn Tool>>,
    /// Launch order; torn down in reverse
    clients: Vec<Arc<McpClient>>,
    cleaned_up: AtomicBool,
}

impl McpToolSet {
    pub fn new(tools: Vec<Arc<dyn Tool>>, clients: Vec<Arc<McpClient>>) -> Self {
        Self {
            tools,
            clients,
            cleaned_up: AtomicBool::new(false),
        }
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .iter()
            .find(|tool| tool.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.name().to_string()).collect()
    }

    /// Shut down every server, last launched first. Safe to call repeatedly;
    /// only the first call does anything.
    pub async fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            debug!("MCP tool set already cleaned up");
            return;
        }

        info!("Stopping {} MCP server(s)", self.clients.len());
        for client in self.clients.iter().rev() {
            // close() swallows its own errors; a panic in one teardown must
            // not skip the rest either.
            let client = client.clone();
            let name = client.name().to_string();
            if let Err(e) = tokio::spawn(async move { client.close().await }).await {
                warn!("Error closing MCP server '{}': {}", name, e);
            }
        }
    }
}

impl Drop for McpToolSet {
    fn drop(&mut self) {
        if !self.cleaned_up.load(Ordering::SeqCst) && !self.clients.is_empty() {
            // Processes are killed when their transports drop.
            debug!("McpToolSet dropped without cleanup, killing MCP servers");
        }
    }
}

/// Launch every declared server, discover its tools and bridge them.
/// Failures are isolated per server: a server that cannot be launched or
/// listed simply contributes no tools.
pub async fn create_tools(options: CreateToolsOptions) -> McpToolSet {
    let specs = normalize_server_specs(&options.server_declarations);
    if specs.is_empty() {
        debug!("No valid MCP server declarations");
        return McpToolSet::new(Vec::new(), Vec::new());
    }

    info!("Starting {} MCP server(s)", specs.len());
    let discoveries = join_all(
        specs
            .iter()
            .map(|spec| discover_server(spec, &options.workspace_dir, options.timeouts)),
    )
    .await;

    // Naming happens after all launches, in declaration order, so names
    // do not depend on which server answered first.
    let mut registry = ToolNameRegistry::new();
    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
    let mut clients = Vec::new();

    for (client, descriptors) in discoveries.into_iter().flatten() {
        for descriptor in &descriptors {
            let local_name = registry.reserve(client.name(), &descriptor.name);
            debug!(
                "Registered MCP tool '{}' as '{}' from server '{}'",
                descriptor.name,
                local_name,
                client.name()
            );
            tools.push(Arc::new(McpToolWrapper::new(local_name, descriptor, client.clone())));
        }
        clients.push(client);
    }

    info!(
        "MCP discovery complete: {} tool(s) from {}/{} server(s)",
        tools.len(),
        clients.len(),
        specs.len()
    );

    McpToolSet::new(tools, clients)
}

async fn discover_server(
    spec: &ServerSpec,
    workspace_dir: &Path,
    timeouts: TimeoutSettings,
) -> Option<(Arc<McpClient>, Vec<RemoteToolDescriptor>)> {
    let client = match McpClient::launch(spec, workspace_dir, timeouts).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!("Failed to start MCP server '{}': {}", spec.name, e);
            return None;
        }
    };

    let descriptors = match client.list_tools().await {
        Ok(descriptors) => descriptors,
        Err(e) => {
            warn!("Failed to list tools from MCP server '{}': {}", spec.name, e);
            Vec::new()
        }
    };

    Some((client, descriptors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::FakeTransport;
    use crate::transport::Transport;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    async fn fake_client(name: &str, tools: Value) -> (Arc<FakeTransport>, Arc<McpClient>) {
        let transport = Arc::new(FakeTransport::with_tools(tools));
        let client = McpClient::connect(name.to_string(), transport.clone(), TimeoutSettings::default())
            .await
            .unwrap();
        (transport, Arc::new(client))
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent_and_reversed() {
        let (first_transport, first) = fake_client("first", json!({"tools": []})).await;
        let (second_transport, second) = fake_client("second", json!({"tools": []})).await;

        let set = McpToolSet::new(Vec::new(), vec![first.clone(), second.clone()]);
        assert_eq!(set.server_names(), vec!["first", "second"]);

        set.cleanup().await;
        set.cleanup().await;

        assert_eq!(first_transport.terminations.load(Ordering::SeqCst), 1);
        assert_eq!(second_transport.terminations.load(Ordering::SeqCst), 1);
        assert!(first_transport.is_closed());
        assert!(second_transport.is_closed());
    }

    #[tokio::test]
    async fn test_create_tools_with_no_valid_servers() {
        let set = create_tools(CreateToolsOptions {
            workspace_dir: PathBuf::from("."),
            server_declarations: vec![json!({"name": "x"}), json!(null)],
            timeouts: TimeoutSettings::default(),
        })
        .await;
        assert!(set.tools().is_empty());
        assert!(set.server_names().is_empty());
        set.cleanup().await;
    }

    #[tokio::test]
    async fn test_unlaunchable_server_is_isolated() {
        let set = create_tools(CreateToolsOptions {
            workspace_dir: PathBuf::from("."),
            server_declarations: vec![json!({
                "name": "ghost",
                "command": "/nonexistent/toolbridge-no-such-binary"
            })],
            timeouts: TimeoutSettings::default(),
        })
        .await;
        assert!(set.tools().is_empty());
        assert!(set.server_names().is_empty());
    }

    #[tokio::test]
    async fn test_get_is_case_insensitive() {
        let (_transport, client) = fake_client("files", json!({})).await;
        let descriptor = RemoteToolDescriptor {
            name: "read".to_string(),
            description: None,
            input_schema: None,
        };
        let tool: Arc<dyn Tool> = Arc::new(McpToolWrapper::new(
            "mcp_files_read".to_string(),
            &descriptor,
            client.clone(),
        ));
        let set = McpToolSet::new(vec![tool], vec![client]);

        assert!(set.get("MCP_FILES_READ").is_some());
        assert!(set.get("mcp_files_write").is_none());
    }
}
