//! 工具提供方边界：连接器与会话 trait
//!
//! 多路复用器只通过 ProviderConnector / ProviderSession 与远端交互；
//! 具体线协议（MCP over HTTP 等）在 `crate::mcp` 中实现，测试可替换为内存实现。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 一个提供方的连接信息（来自配置 `[[providers]]`）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub name: String,
    pub url: String,
}

impl ProviderEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// 提供方 tools/list 返回的单个工具
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema（object），缺省为空对象
    #[serde(default)]
    pub input_schema: Value,
}

/// 一次远端调用的原始结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteCallOutcome {
    /// 提供方以结构化方式报告失败（isError）
    pub is_error: bool,
    /// 文本内容（多段以换行拼接）
    pub text: String,
    /// 结构化内容（structuredContent），若有
    pub structured: Option<Value>,
}

impl RemoteCallOutcome {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn structured(value: Value) -> Self {
        Self {
            text: value.to_string(),
            structured: Some(value),
            ..Default::default()
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            text: text.into(),
            structured: None,
        }
    }
}

/// 提供方交互错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// 连接失败或会话断开；多路复用器据此重连
    #[error("connection error: {0}")]
    Connection(String),

    /// 提供方拒绝请求（JSON-RPC error、未知工具等）
    #[error("rejected: {0}")]
    Rejected(String),

    /// 响应格式不合法
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// 建立到某个提供方的会话
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &ProviderEndpoint,
    ) -> Result<Box<dyn ProviderSession>, ProviderError>;
}

/// 已建立的提供方会话；由单个工作任务独占使用
#[async_trait]
pub trait ProviderSession: Send {
    async fn list_tools(&mut self) -> Result<Vec<RemoteTool>, ProviderError>;

    async fn call(
        &mut self,
        tool: &str,
        arguments: Value,
    ) -> Result<RemoteCallOutcome, ProviderError>;

    async fn close(&mut self) {}
}
