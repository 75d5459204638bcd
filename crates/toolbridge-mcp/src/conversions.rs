//! Conversions between MCP payloads and the shapes bridged tools expose

use serde_json::{json, Value};

/// Schema used when a server declares no usable input schema: any object.
pub fn permissive_schema() -> Value {
    json!({
        "type": "object",
        "properties": {},
        "additionalProperties": true
    })
}

/// Use the remote `inputSchema` when it is an object schema, otherwise fall
/// back to [`permissive_schema`].
pub fn normalize_parameters(input_schema: Option<&Value>) -> Value {
    match input_schema {
        Some(schema) if is_object_schema(schema) => schema.clone(),
        _ => permissive_schema(),
    }
}

fn is_object_schema(schema: &Value) -> bool {
    let Some(map) = schema.as_object() else {
        return false;
    };
    let typed_object = map.get("type").and_then(Value::as_str) == Some("object");
    let properties_ok = map.get("properties").map_or(true, Value::is_object);
    typed_object && properties_ok
}

/// Wrap a `tools/call` result in the envelope every bridged tool returns.
pub fn wrap_tool_result(server: &str, tool: &str, result: Value) -> Value {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let text: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    let mut envelope = json!({
        "server": server,
        "tool": tool,
        "success": !is_error,
    });
    if !text.is_empty() {
        envelope["content"] = Value::String(text.join("\n"));
    }
    envelope["result"] = result;
    envelope
}
