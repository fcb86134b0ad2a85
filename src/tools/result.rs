//! 工具调用结果：StepRecord 的 result 部分，也是回溯引用的取值来源

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ErrorInfo, ErrorKind};
use crate::tools::RemoteCallOutcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub ok: bool,
    /// 结构化值：structuredContent，或可解析为 JSON 的文本，否则为文本字符串
    pub value: Option<Value>,
    pub error: Option<ErrorInfo>,
    /// 原始文本，用于审计与记忆
    pub raw_text: String,
}

impl ToolCallResult {
    pub fn success(value: Value, raw_text: impl Into<String>) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
            raw_text: raw_text.into(),
        }
    }

    pub fn failure(error: ErrorInfo) -> Self {
        Self {
            ok: false,
            value: None,
            raw_text: error.message.clone(),
            error: Some(error),
        }
    }

    /// 把提供方结果转换为统一结果；isError 视为 ToolRejected
    pub fn from_outcome(outcome: RemoteCallOutcome) -> Self {
        if outcome.is_error {
            let message = if outcome.text.trim().is_empty() {
                "provider reported an error".to_string()
            } else {
                outcome.text.clone()
            };
            let mut res = Self::failure(ErrorInfo::new(ErrorKind::ToolRejected, message));
            res.raw_text = outcome.text;
            return res;
        }
        let value = match outcome.structured {
            Some(v) => v,
            None => parse_json_text(&outcome.text).unwrap_or_else(|| Value::String(outcome.text.clone())),
        };
        Self::success(value, outcome.text)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// 截断后的文本预览（按字符）
    pub fn preview(&self, max_chars: usize) -> String {
        let text = if self.ok {
            self.raw_text.as_str()
        } else {
            self.error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or(self.raw_text.as_str())
        };
        truncate_chars(text, max_chars)
    }
}

fn parse_json_text(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
