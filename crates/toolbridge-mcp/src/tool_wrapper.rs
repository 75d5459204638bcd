//! Wrapper exposing one remote MCP tool through the toolbridge `Tool` trait

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use toolbridge_core::{BridgeError, Result, Tool};
use tracing::{debug, error};

use crate::client::McpClient;
use crate::conversions::{normalize_parameters, wrap_tool_result};
use crate::types::RemoteToolDescriptor;

pub struct McpToolWrapper {
    /// Unique local name
    name: String,

    label: String,

    description: String,

    parameters: Value,

    /// Name the server knows the tool by
    remote_name: String,

    client: Arc<McpClient>,
}

impl McpToolWrapper {
    pub fn new(local_name: String, descriptor: &RemoteToolDescriptor, client: Arc<McpClient>) -> Self {
        let server = client.name();
        let description = descriptor
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("MCP tool '{}' from server '{}'", descriptor.name, server));

        Self {
            name: local_name,
            label: format!("{} ({})", descriptor.name, server),
            description,
            parameters: normalize_parameters(descriptor.input_schema.as_ref()),
            remote_name: descriptor.name.clone(),
            client,
        }
    }

    pub fn server_name(&self) -> &str {
        self.client.name()
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }
}

#[async_trait]
impl Tool for McpToolWrapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, args: Value, cancel: Option<CancellationToken>) -> Result<Value> {
        if !args.is_object() {
            return Err(BridgeError::InvalidArguments {
                tool: self.name.clone(),
                message: format!("expected a JSON object, got {}", json_kind(&args)),
            });
        }

        debug!(
            "Executing MCP tool '{}' ('{}' on server '{}')",
            self.name,
            self.remote_name,
            self.server_name()
        );

        match self
            .client
            .call_tool(&self.remote_name, args, cancel.as_ref())
            .await
        {
            Ok(result) => Ok(wrap_tool_result(self.server_name(), &self.remote_name, result)),
            Err(e) => {
                error!("MCP tool '{}' failed: {}", self.name, e);
                Err(e)
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
