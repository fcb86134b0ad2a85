//! 工具调用 JSON Schema 生成
//!
//! 用于将「合法 tool call」的 JSON 结构注入 system prompt，减少决策服务输出格式错误。

use schemars::{schema_for, JsonSchema};
use std::collections::HashMap;

/// JSON 形式的工具调用：`{"tool_name": "...", "parameters": {...}}`（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名（目录中的展示名或 provider.tool 限定名）
    pub tool_name: String,
    /// 工具参数；字符串值中可用 {{step K.field}} 引用第 K 步的结果
    pub parameters: HashMap<String, serde_json::Value>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_names_fields() {
        let schema = tool_call_schema_json();
        assert!(schema.contains("tool_name"));
        assert!(schema.contains("parameters"));
    }
}
