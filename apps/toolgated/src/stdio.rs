//! Stdio transport: newline-delimited JSON-RPC on stdin/stdout, bridged to
//! the gateway through the MCP handler trait. Stdout carries protocol frames
//! only; logs and audit lines go to stderr.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use toolgate_core::{Gateway, InvokeOutcome};
use toolgate_mcp::{
    CallToolParams, CallToolResult, ContentBlock, JsonRpcMessage, JsonRpcResponse, ListToolsParams,
    ListToolsResult, McpConnection, McpHandler, McpServerConfig, ToolDescriptor,
};

pub struct GatewayMcpHandler {
    gateway: Arc<Gateway>,
}

impl GatewayMcpHandler {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl McpHandler for GatewayMcpHandler {
    async fn list_tools(&self, _params: ListToolsParams) -> anyhow::Result<ListToolsResult> {
        let tools = self
            .gateway
            .list_tools()
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t.name,
                description: Some(t.description),
                input_schema: t.input_schema,
            })
            .collect();
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(&self, params: CallToolParams) -> anyhow::Result<CallToolResult> {
        let args = params
            .arguments
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        let outcome = self.gateway.invoke(&params.name, args).await;

        Ok(match outcome {
            InvokeOutcome::Success { result, request_id } => {
                let pretty = serde_json::to_string_pretty(&result)
                    .unwrap_or_else(|_| result.to_string());
                CallToolResult {
                    content: vec![ContentBlock::Text { text: pretty }],
                    structured_content: Some(result),
                    is_error: Some(false),
                    meta: Some(json!({"request_id": request_id})),
                }
            }
            InvokeOutcome::Error {
                code,
                message,
                request_id,
            } => CallToolResult {
                content: vec![ContentBlock::Text {
                    text: format!("{}: {message}", code.as_str()),
                }],
                structured_content: Some(json!({
                    "status": "error",
                    "code": code,
                    "message": message,
                    "request_id": request_id,
                })),
                is_error: Some(true),
                meta: Some(json!({"code": code, "request_id": request_id})),
            },
        })
    }
}

pub async fn run(gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let cfg = McpServerConfig::for_binary("toolgated", env!("CARGO_PKG_VERSION"));
    let handler: Arc<dyn McpHandler> = Arc::new(GatewayMcpHandler::new(gateway));
    let mut conn = McpConnection::new(cfg, handler);

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let val: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                write_frame(&mut stdout, &McpConnection::parse_error(e.to_string())).await?;
                continue;
            }
        };
        if val.is_array() {
            write_frame(
                &mut stdout,
                &McpConnection::invalid_request("batching not supported"),
            )
            .await?;
            continue;
        }
        let msg: JsonRpcMessage = match serde_json::from_value(val) {
            Ok(m) => m,
            Err(e) => {
                write_frame(
                    &mut stdout,
                    &McpConnection::invalid_request(&format!("invalid request: {e}")),
                )
                .await?;
                continue;
            }
        };

        if let Some(resp) = conn.handle_message(msg).await {
            write_frame(&mut stdout, &resp).await?;
        }
    }

    Ok(())
}

async fn write_frame(
    stdout: &mut tokio::io::Stdout,
    resp: &JsonRpcResponse,
) -> anyhow::Result<()> {
    let out = serde_json::to_string(resp)?;
    stdout.write_all(out.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
