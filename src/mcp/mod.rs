//! MCP 客户端：JSON-RPC over HTTP 的工具提供方实现

pub mod client;
pub mod protocol;
pub mod transport;
pub mod types;

pub use client::{McpConnector, McpSession};
pub use protocol::{JsonRpcError, JsonRpcId, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use transport::{HttpTransport, McpTransport, SESSION_HEADER};
pub use types::{McpContent, McpToolDef, McpToolResult, PROTOCOL_VERSION};
