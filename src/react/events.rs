//! 执行循环过程事件：用于流式展示感知、规划、工具调用与结果

use serde::Serialize;

use crate::core::{ErrorKind, LoopState};
use crate::perception::Intent;
use crate::react::LoopOutcome;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    StateChanged { state: LoopState },
    Perceived {
        intent: Intent,
        hints: Vec<String>,
    },
    /// 决策服务返回的计划文本（预览）
    PlanReceived { iteration: usize, preview: String },
    PlanError {
        line: usize,
        fragment: String,
        reason: String,
    },
    ToolCall {
        step: usize,
        tool: String,
        args: serde_json::Value,
    },
    /// 会话重建后的重试
    Retry { step: usize, tool: String, reason: String },
    /// 工具返回（预览，避免过长）
    Observation {
        step: usize,
        tool: String,
        ok: bool,
        error: Option<ErrorKind>,
        preview: String,
    },
    Finished { outcome: LoopOutcome },
}
