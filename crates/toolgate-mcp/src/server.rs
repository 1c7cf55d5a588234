//! MCP connection state machine: lifecycle enforcement and method routing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::jsonrpc::{
    JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use crate::types::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsParams,
    ListToolsResult, McpServerInfo,
};
use crate::{PROTOCOL_VERSION_2025_06_18, PROTOCOL_VERSION_LATEST};

mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const NOT_INITIALIZED: i64 = -32002;
}

#[async_trait]
pub trait McpHandler: Send + Sync {
    async fn list_tools(&self, params: ListToolsParams) -> anyhow::Result<ListToolsResult>;
    async fn call_tool(&self, params: CallToolParams) -> anyhow::Result<CallToolResult>;
}

#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub server_info: McpServerInfo,
    pub instructions: Option<String>,
    pub capabilities: Value,
    pub supported_protocol_versions: Vec<String>,
}

impl McpServerConfig {
    pub fn for_binary(name: &str, version: &str) -> Self {
        Self {
            server_info: McpServerInfo {
                name: name.to_string(),
                version: version.to_string(),
            },
            instructions: None,
            capabilities: serde_json::json!({
                "tools": { "listChanged": false }
            }),
            supported_protocol_versions: vec![
                PROTOCOL_VERSION_LATEST.to_string(),
                PROTOCOL_VERSION_2025_06_18.to_string(),
            ],
        }
    }

    fn negotiate_protocol(&self, requested: &str) -> String {
        if self
            .supported_protocol_versions
            .iter()
            .any(|v| v == requested)
        {
            requested.to_string()
        } else {
            PROTOCOL_VERSION_LATEST.to_string()
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    New,
    InitResponded,
    Ready,
}

pub struct McpConnection {
    cfg: McpServerConfig,
    handler: Arc<dyn McpHandler>,
    phase: Phase,
    protocol_version: Option<String>,
}

impl McpConnection {
    pub fn new(cfg: McpServerConfig, handler: Arc<dyn McpHandler>) -> Self {
        Self {
            cfg,
            handler,
            phase: Phase::New,
            protocol_version: None,
        }
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Handle a single message. Requests produce a response; notifications
    /// and stray responses do not.
    pub async fn handle_message(&mut self, msg: JsonRpcMessage) -> Option<JsonRpcResponse> {
        match msg {
            JsonRpcMessage::Request(req) => Some(self.handle_request(req).await),
            JsonRpcMessage::Notification(n) => {
                self.handle_notification(n);
                None
            }
            JsonRpcMessage::Response(_) => None,
        }
    }

    fn fail(id: JsonRpcId, code: i64, message: &str, detail: Option<String>) -> JsonRpcResponse {
        JsonRpcResponse::err(
            id,
            JsonRpcError {
                code,
                message: message.to_string(),
                data: detail.map(|d| serde_json::json!({ "detail": d })),
            },
        )
    }

    async fn handle_request(&mut self, req: JsonRpcRequest) -> JsonRpcResponse {
        if req.jsonrpc != "2.0" {
            return Self::fail(
                req.id,
                codes::INVALID_REQUEST,
                "invalid jsonrpc version",
                None,
            );
        }

        match req.method.as_str() {
            "initialize" => self.handle_initialize(req),
            // Ping is answerable in any phase.
            "ping" => JsonRpcResponse::ok(req.id, serde_json::json!({})),
            "tools/list" => {
                if self.phase != Phase::Ready {
                    return Self::fail(req.id, codes::NOT_INITIALIZED, "not initialized", None);
                }
                let params = match req.params {
                    Some(v) => match serde_json::from_value::<ListToolsParams>(v) {
                        Ok(p) => p,
                        Err(e) => {
                            return Self::fail(
                                req.id,
                                codes::INVALID_PARAMS,
                                "invalid params",
                                Some(e.to_string()),
                            );
                        }
                    },
                    None => ListToolsParams::default(),
                };
                match self.handler.list_tools(params).await {
                    Ok(res) => JsonRpcResponse::ok(
                        req.id,
                        serde_json::to_value(res).unwrap_or(Value::Null),
                    ),
                    Err(e) => Self::fail(
                        req.id,
                        codes::INTERNAL_ERROR,
                        "internal error",
                        Some(e.to_string()),
                    ),
                }
            }
            "tools/call" => {
                if self.phase != Phase::Ready {
                    return Self::fail(req.id, codes::NOT_INITIALIZED, "not initialized", None);
                }
                let Some(v) = req.params else {
                    return Self::fail(
                        req.id,
                        codes::INVALID_PARAMS,
                        "invalid params",
                        Some("missing params".to_string()),
                    );
                };
                let params = match serde_json::from_value::<CallToolParams>(v) {
                    Ok(p) => p,
                    Err(e) => {
                        return Self::fail(
                            req.id,
                            codes::INVALID_PARAMS,
                            "invalid params",
                            Some(e.to_string()),
                        );
                    }
                };
                match self.handler.call_tool(params).await {
                    Ok(res) => JsonRpcResponse::ok(
                        req.id,
                        serde_json::to_value(res).unwrap_or(Value::Null),
                    ),
                    Err(e) => Self::fail(
                        req.id,
                        codes::INTERNAL_ERROR,
                        "internal error",
                        Some(e.to_string()),
                    ),
                }
            }
            _ => Self::fail(req.id, codes::METHOD_NOT_FOUND, "method not found", None),
        }
    }

    fn handle_initialize(&mut self, req: JsonRpcRequest) -> JsonRpcResponse {
        if self.phase != Phase::New {
            return Self::fail(
                req.id,
                codes::INVALID_REQUEST,
                "already initialized",
                None,
            );
        }
        let Some(params) = req.params else {
            return Self::fail(
                req.id,
                codes::INVALID_PARAMS,
                "invalid params",
                Some("missing params".to_string()),
            );
        };
        let init: InitializeParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                return Self::fail(
                    req.id,
                    codes::INVALID_PARAMS,
                    "invalid params",
                    Some(e.to_string()),
                );
            }
        };

        let negotiated = self.cfg.negotiate_protocol(&init.protocol_version);
        self.protocol_version = Some(negotiated.clone());
        self.phase = Phase::InitResponded;

        let result = InitializeResult {
            protocol_version: negotiated,
            capabilities: self.cfg.capabilities.clone(),
            server_info: self.cfg.server_info.clone(),
            instructions: self.cfg.instructions.clone(),
        };
        JsonRpcResponse::ok(req.id, serde_json::to_value(result).unwrap_or(Value::Null))
    }

    fn handle_notification(&mut self, n: JsonRpcNotification) {
        if n.jsonrpc != "2.0" {
            return;
        }
        if n.method == "notifications/initialized" && self.phase == Phase::InitResponded {
            self.phase = Phase::Ready;
        }
    }

    pub fn initialized_notification() -> JsonRpcNotification {
        JsonRpcNotification::new("notifications/initialized", None)
    }

    /// Error response for a payload that failed to parse as JSON.
    pub fn parse_error(detail: String) -> JsonRpcResponse {
        Self::fail(JsonRpcId::Null, codes::PARSE_ERROR, "parse error", Some(detail))
    }

    /// Error response for structurally invalid messages (e.g. batches).
    pub fn invalid_request(message: &str) -> JsonRpcResponse {
        Self::fail(JsonRpcId::Null, codes::INVALID_REQUEST, message, None)
    }
}
