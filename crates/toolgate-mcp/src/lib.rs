//! Model Context Protocol (MCP) server primitives.
//!
//! Scoped to what the gateway's stdio transport needs: JSON-RPC 2.0 framing,
//! the MCP lifecycle (`initialize` / `notifications/initialized` / `ping`),
//! and the `tools/list` + `tools/call` methods.

mod jsonrpc;
mod server;
mod types;

pub use jsonrpc::{
    JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
pub use server::{McpConnection, McpHandler, McpServerConfig};
pub use types::{
    CallToolParams, CallToolResult, ContentBlock, InitializeParams, InitializeResult,
    ListToolsParams, ListToolsResult, McpClientInfo, McpServerInfo, ToolDescriptor,
};

/// Latest protocol version supported by this implementation.
pub const PROTOCOL_VERSION_LATEST: &str = "2025-11-25";

/// Older protocol version still commonly used by clients.
pub const PROTOCOL_VERSION_2025_06_18: &str = "2025-06-18";
