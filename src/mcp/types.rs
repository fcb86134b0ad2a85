//! MCP 载荷类型：工具定义、调用结果、初始化信息

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{RemoteCallOutcome, RemoteTool};

/// 协议版本（initialize 时声明）
pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

impl From<McpToolDef> for RemoteTool {
    fn from(def: McpToolDef) -> Self {
        RemoteTool {
            name: def.name,
            description: def.description.unwrap_or_default(),
            input_schema: def.input_schema,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDef>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

/// tools/call 返回的内容块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    #[serde(
        rename = "structuredContent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<Value>,
}

impl McpToolResult {
    /// 拼接全部文本块（资源块取其 text 字段）
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                McpContent::Text { text } => Some(text.clone()),
                McpContent::Resource { resource } => resource
                    .get("text")
                    .and_then(Value::as_str)
                    .map(String::from),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl From<McpToolResult> for RemoteCallOutcome {
    fn from(result: McpToolResult) -> Self {
        RemoteCallOutcome {
            is_error: result.is_error,
            text: result.text(),
            structured: result.structured_content,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: String,
    #[serde(rename = "serverInfo", default)]
    pub server_info: ServerInfo,
}
