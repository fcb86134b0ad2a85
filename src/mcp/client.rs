//! MCP 会话与连接器：把 MCP 线协议适配到 ProviderSession / ProviderConnector

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest};
use crate::mcp::transport::{HttpTransport, McpTransport};
use crate::mcp::types::{InitializeResult, ListToolsResult, McpToolResult, ServerInfo, PROTOCOL_VERSION};
use crate::tools::{
    ProviderConnector, ProviderEndpoint, ProviderError, ProviderSession, RemoteCallOutcome,
    RemoteTool,
};

/// tools/list 翻页上限
const MAX_LIST_PAGES: usize = 32;

/// 一个已完成 initialize 握手的 MCP 会话
pub struct McpSession {
    transport: Box<dyn McpTransport>,
    next_id: i64,
    server: ServerInfo,
}

impl McpSession {
    /// 握手：initialize → notifications/initialized
    pub async fn initialize(transport: Box<dyn McpTransport>) -> Result<Self, ProviderError> {
        let mut session = Self {
            transport,
            next_id: 1,
            server: ServerInfo::default(),
        };
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
        });
        let result = session
            .request("initialize", Some(params))
            .await
            .map_err(|e| match e {
                ProviderError::Rejected(msg) => {
                    ProviderError::Connection(format!("initialize rejected: {msg}"))
                }
                other => other,
            })?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| ProviderError::Protocol(e.to_string()))?;
        session.server = init.server_info;
        session
            .transport
            .notify(JsonRpcNotification::new("notifications/initialized"))
            .await?;
        tracing::debug!(
            server = %session.server.name,
            protocol = %init.protocol_version,
            "mcp session initialized"
        );
        Ok(session)
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value, ProviderError> {
        let id = self.next_id;
        self.next_id += 1;
        let mut request = JsonRpcRequest::new(id, method);
        if let Some(p) = params {
            request = request.with_params(p);
        }
        let response = self.transport.send(request).await?;
        if let Some(err) = response.error {
            return Err(ProviderError::Rejected(format!("{} ({})", err.message, err.code)));
        }
        response
            .result
            .ok_or_else(|| ProviderError::Protocol(format!("{method}: response has no result")))
    }
}

#[async_trait]
impl ProviderSession for McpSession {
    async fn list_tools(&mut self) -> Result<Vec<RemoteTool>, ProviderError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.request("tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| ProviderError::Protocol(e.to_string()))?;
            tools.extend(page.tools.into_iter().map(RemoteTool::from));
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn call(&mut self, tool: &str, arguments: Value) -> Result<RemoteCallOutcome, ProviderError> {
        let params = json!({ "name": tool, "arguments": arguments });
        let result = self.request("tools/call", Some(params)).await?;
        let parsed: McpToolResult =
            serde_json::from_value(result).map_err(|e| ProviderError::Protocol(e.to_string()))?;
        Ok(parsed.into())
    }

    async fn close(&mut self) {
        if let Err(e) = self.transport.close().await {
            tracing::debug!(error = %e, "mcp session close failed");
        }
    }
}

/// 通过 HTTP 连接 MCP 提供方
#[derive(Clone)]
pub struct McpConnector {
    client: reqwest::Client,
}

impl McpConnector {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn with_timeouts(connect: Duration, request: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect)
            .timeout(request)
            .build()
            .map_err(|e| ProviderError::Connection(e.to_string()))?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ProviderConnector for McpConnector {
    async fn connect(
        &self,
        endpoint: &ProviderEndpoint,
    ) -> Result<Box<dyn ProviderSession>, ProviderError> {
        let transport = HttpTransport::new(self.client.clone(), endpoint.url.clone());
        let session = McpSession::initialize(Box::new(transport)).await?;
        tracing::info!(
            provider = %endpoint.name,
            server = %session.server_info().name,
            "connected to tool provider"
        );
        Ok(Box::new(session))
    }
}
