//! JSON-RPC 2.0 dispatch shell over stdio.
//!
//! Thin framing layer: one request per line on stdin, one response per line
//! on stdout. Everything interesting happens in the write controller; this
//! module only knows the method table and the `write` tool schema. Logs go
//! to stderr so stdout stays protocol-clean.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::write_tool::WriteController;

const PROTOCOL_VERSION: &str = "2024-11-05";

const SERVER_INSTRUCTIONS: &str = "This server exposes a single tool named 'write'. Use it to \
create or modify a file from a natural-language prompt; do not attempt to use any other tool.";

// =============================================================================
// JSON-RPC types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(rename = "jsonrpc")]
    _jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    jsonrpc: String,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct ToolResult {
    content: Vec<ToolContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
}

impl ToolResult {
    fn text(text: String, is_error: bool) -> Self {
        Self {
            content: vec![ToolContent::Text { text }],
            is_error,
        }
    }
}

// =============================================================================
// Method table
// =============================================================================

fn write_tool_definition() -> Value {
    json!({
        "name": "write",
        "description": "Generate code with the configured LLM providers and write it to a file. \
                        Returns a diff of the change, or a terse summary when write_only is set.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the file to create or modify"
                },
                "prompt": {
                    "type": "string",
                    "description": "What the file should contain"
                },
                "context_files": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Paths of files to include as grounding context"
                },
                "write_only": {
                    "type": "boolean",
                    "default": false,
                    "description": "Skip the diff and answer with a one-line summary"
                },
                "validate": {
                    "type": "boolean",
                    "description": "Syntax-check the generated code; defaults to true when write_only is set"
                },
                "restore_previous": {
                    "type": "boolean",
                    "default": false,
                    "description": "Restore the file from its pre-write backup instead of generating"
                }
            },
            "required": ["file_path", "prompt"]
        }
    })
}

/// Dispatch one request. `None` means the request was a notification with
/// no response.
pub async fn handle_request(
    controller: &WriteController,
    request: &JsonRpcRequest,
    cancel: &CancellationToken,
) -> Option<JsonRpcResponse> {
    match request.method.as_str() {
        "initialize" => Some(JsonRpcResponse::success(
            request.id.clone(),
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {
                    "name": "mcp-code-api",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {
                    "tools": { "listChanged": false }
                },
                "instructions": SERVER_INSTRUCTIONS,
            }),
        )),
        "notifications/initialized" | "initialized" => None,
        "tools/list" => Some(JsonRpcResponse::success(
            request.id.clone(),
            json!({ "tools": [write_tool_definition()] }),
        )),
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if name != "write" {
                return Some(JsonRpcResponse::success(
                    request.id.clone(),
                    json!(ToolResult::text(format!("Unknown tool: {name}"), true)),
                ));
            }
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            let result = match controller.write(&arguments, cancel).await {
                Ok(text) => ToolResult::text(text, false),
                Err(err) => ToolResult::text(err.to_string(), true),
            };
            Some(JsonRpcResponse::success(request.id.clone(), json!(result)))
        }
        other => Some(JsonRpcResponse::error(
            request.id.clone(),
            -32601,
            format!("Method not found: {other}"),
        )),
    }
}

/// Serve line-delimited JSON-RPC until stdin closes.
pub async fn serve(controller: WriteController) -> std::io::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    // Ctrl-C cancels the in-flight request; the loop then drains to EOF.
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, cancelling in-flight work");
                cancel.cancel();
            }
        }
    });

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let response = JsonRpcResponse::error(Value::Null, -32700, err.to_string());
                write_line(&mut stdout, &response).await?;
                continue;
            }
        };

        tracing::debug!(method = %request.method, "request received");
        if let Some(response) = handle_request(&controller, &request, &cancel).await {
            write_line(&mut stdout, &response).await?;
        }
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}

async fn write_line(
    stdout: &mut tokio::io::Stdout,
    response: &JsonRpcResponse,
) -> std::io::Result<()> {
    let mut serialized = serde_json::to_string(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    serialized.push('\n');
    stdout.write_all(serialized.as_bytes()).await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::router::Router;
    use std::sync::Arc;

    fn empty_controller() -> WriteController {
        WriteController::new(Arc::new(Router::empty(Config::default())))
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn initialize_advertises_the_write_tool_only() {
        let controller = empty_controller();
        let cancel = CancellationToken::new();

        let response = handle_request(&controller, &request("initialize", json!({})), &cancel)
            .await
            .unwrap();
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["result"]["serverInfo"]["name"], "mcp-code-api");
        assert!(body["result"]["instructions"]
            .as_str()
            .unwrap()
            .contains("write"));

        let response = handle_request(&controller, &request("tools/list", json!({})), &cancel)
            .await
            .unwrap();
        let body = serde_json::to_value(&response).unwrap();
        let tools = body["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "write");
        let required = tools[0]["inputSchema"]["required"].as_array().unwrap();
        assert_eq!(required.len(), 2);
    }

    #[tokio::test]
    async fn initialized_notification_has_no_response() {
        let controller = empty_controller();
        let response = handle_request(
            &controller,
            &request("notifications/initialized", json!({})),
            &CancellationToken::new(),
        )
        .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_a_protocol_error() {
        let controller = empty_controller();
        let response = handle_request(
            &controller,
            &request("resources/list", json!({})),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn tool_errors_are_tool_results_not_protocol_errors() {
        let controller = empty_controller();
        let response = handle_request(
            &controller,
            &request(
                "tools/call",
                json!({"name": "write", "arguments": {"prompt": "no path"}}),
            ),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let body = serde_json::to_value(&response).unwrap();
        assert!(body["error"].is_null());
        assert_eq!(body["result"]["isError"], true);
        assert!(body["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("file_path"));
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_in_band() {
        let controller = empty_controller();
        let response = handle_request(
            &controller,
            &request("tools/call", json!({"name": "read", "arguments": {}})),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["result"]["isError"], true);
    }
}
