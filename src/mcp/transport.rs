//! MCP 传输层：Streamable HTTP（POST JSON-RPC）
//!
//! 服务端以 `Mcp-Session-Id` 头下发会话 ID，此后每个请求回带；
//! 响应体为 application/json 或单事件 text/event-stream。

use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;

use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::tools::ProviderError;

pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// 向 MCP 服务端发送 JSON-RPC 消息
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, ProviderError>;

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), ProviderError>;

    async fn close(&self) -> Result<(), ProviderError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    session_id: Mutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            session_id: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn remember_session(&self, resp: &reqwest::Response) {
        if let Some(id) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
        }
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let mut req = self
            .client
            .post(&self.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        let session = self.session_id();
        if let Some(id) = &session {
            req = req.header(SESSION_HEADER, id.as_str());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;
        self.remember_session(&resp);

        let status = resp.status();
        if status == StatusCode::NOT_FOUND && session.is_some() {
            return Err(ProviderError::Connection("session expired".into()));
        }
        if status.is_server_error() {
            return Err(ProviderError::Connection(format!("server returned {status}")));
        }
        if !status.is_success() {
            return Err(ProviderError::Protocol(format!("server returned {status}")));
        }
        Ok(resp)
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, ProviderError> {
        let body =
            serde_json::to_value(&request).map_err(|e| ProviderError::Protocol(e.to_string()))?;
        let resp = self.post(&body).await?;
        let is_sse = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;
        if is_sse {
            decode_event_stream(&text)
        } else {
            serde_json::from_str(&text).map_err(|e| ProviderError::Protocol(e.to_string()))
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), ProviderError> {
        let body = serde_json::to_value(&notification)
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;
        self.post(&body).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        let Some(id) = self.session_id() else {
            return Ok(());
        };
        // 服务端可能不支持 DELETE，忽略状态码
        self.client
            .delete(&self.url)
            .header(SESSION_HEADER, id)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::Connection(e.to_string()))
    }
}

/// 从 SSE 响应体中取出第一个 JSON-RPC 响应
pub fn decode_event_stream(body: &str) -> Result<JsonRpcResponse, ProviderError> {
    fn flush(data: &mut String) -> Option<JsonRpcResponse> {
        if data.is_empty() {
            return None;
        }
        let parsed = serde_json::from_str::<JsonRpcResponse>(data).ok();
        data.clear();
        parsed.filter(|r| r.result.is_some() || r.error.is_some())
    }

    let mut data = String::new();
    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        } else if line.trim().is_empty() {
            if let Some(resp) = flush(&mut data) {
                return Ok(resp);
            }
        }
    }
    flush(&mut data)
        .ok_or_else(|| ProviderError::Protocol("event stream carried no JSON-RPC response".into()))
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::mcp::protocol::JsonRpcError;

    /// 预置响应的内存传输，按顺序返回并记录请求
    pub struct MockTransport {
        responses: Mutex<Vec<Result<JsonRpcResponse, ProviderError>>>,
        sent_requests: Mutex<Vec<JsonRpcRequest>>,
        sent_notifications: Mutex<Vec<JsonRpcNotification>>,
    }

    impl MockTransport {
        pub fn new(responses: Vec<Result<JsonRpcResponse, ProviderError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                sent_requests: Mutex::new(Vec::new()),
                sent_notifications: Mutex::new(Vec::new()),
            }
        }

        pub fn sent_requests(&self) -> Vec<JsonRpcRequest> {
            self.sent_requests.lock().unwrap().clone()
        }

        pub fn sent_notifications(&self) -> Vec<JsonRpcNotification> {
            self.sent_notifications.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl McpTransport for MockTransport {
        async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, ProviderError> {
            self.sent_requests.lock().unwrap().push(request.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(JsonRpcResponse::failure(
                    request.id,
                    JsonRpcError {
                        code: -32603,
                        message: "No more mock responses".into(),
                        data: None,
                    },
                ));
            }
            responses.remove(0).map(|mut resp| {
                resp.id = Some(request.id);
                resp
            })
        }

        async fn notify(&self, notification: JsonRpcNotification) -> Result<(), ProviderError> {
            self.sent_notifications.lock().unwrap().push(notification);
            Ok(())
        }

        async fn close(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }
}
