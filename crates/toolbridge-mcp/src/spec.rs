//! Server declarations: validation and normalization of untrusted input.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use toolbridge_config::substitute_placeholders;
use tracing::debug;

/// A validated MCP server declaration, ready to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

impl ServerSpec {
    /// Build a spec from one raw record, or `None` if the record lacks a
    /// usable `name` or `command`.
    pub fn from_value(raw: &Value) -> Option<Self> {
        let record = raw.as_object()?;
        let name = non_empty_trimmed(record.get("name"))?;
        let command = non_empty_trimmed(record.get("command"))?;

        let args = record
            .get("args")
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|arg| !arg.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let env = record.get("env").and_then(Value::as_object).map(|env| {
            env.iter()
                .filter_map(|(key, value)| {
                    let key = key.trim();
                    let value = value.as_str()?;
                    if key.is_empty() {
                        return None;
                    }
                    Some((key.to_string(), substitute_placeholders(value)))
                })
                .collect()
        });

        Some(Self {
            name,
            command,
            args,
            env,
        })
    }
}

fn non_empty_trimmed(value: Option<&Value>) -> Option<String> {
    let trimmed = value?.as_str()?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Normalize a heterogeneous list of raw declarations. Invalid records are
/// dropped; a later record with the same name replaces the earlier one but
/// keeps its position.
pub fn normalize_server_specs(raw: &[Value]) -> Vec<ServerSpec> {
    let mut specs: Vec<ServerSpec> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for record in raw {
        let Some(spec) = ServerSpec::from_value(record) else {
            debug!("Ignoring invalid MCP server declaration: {}", record);
            continue;
        };

        match positions.get(&spec.name) {
            Some(&index) => {
                debug!("MCP server '{}' declared again, replacing", spec.name);
                specs[index] = spec;
            }
            None => {
                positions.insert(spec.name.clone(), specs.len());
                specs.push(spec);
            }
        }
    }

    specs
}
