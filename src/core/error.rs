//! 错误类型：AgentError、ErrorKind 与可序列化的 ErrorInfo
//!
//! AgentError 在库内部传播（`?`）；写入 StepRecord / LoopOutcome 时统一转为 ErrorInfo，
//! 由 RecoveryEngine 决定重试、记录、重新规划还是终止。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// 错误类别（闭集），供 StepRecord、LoopOutcome 与恢复策略使用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Planner 输出无法解析
    PlanParse,
    /// 回溯引用指向尚未执行 / 失败 / 缺字段的步骤
    UnresolvedReference,
    /// 提供方不可达（已尝试一次重连）
    ToolUnavailable,
    ToolTimeout,
    /// 提供方返回结构化失败（参数错误、未知工具等）
    ToolRejected,
    BudgetExhausted,
    /// 决策服务（LLM）调用本身失败
    DecisionService,
    Cancelled,
    DeadlineExceeded,
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::PlanParse => "PlanParseError",
            ErrorKind::UnresolvedReference => "UnresolvedReference",
            ErrorKind::ToolUnavailable => "ToolUnavailable",
            ErrorKind::ToolTimeout => "ToolTimeout",
            ErrorKind::ToolRejected => "ToolRejected",
            ErrorKind::BudgetExhausted => "BudgetExhausted",
            ErrorKind::DecisionService => "DecisionServiceError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::DeadlineExceeded => "DeadlineExceeded",
            ErrorKind::Configuration => "ConfigurationError",
        };
        f.write_str(s)
    }
}

/// 可序列化的错误描述，随 ToolCallResult / LoopOutcome 一起流转
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// 提供方会话已重建、调用可安全重试一次
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// 编排过程中以 `?` 传播的错误
///
/// 工具调用失败、预算与截止时间耗尽不走这里：它们直接以 ErrorInfo 记入 StepRecord / LoopOutcome。
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Plan parse error: {0}")]
    PlanParse(String),

    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    #[error("Decision service error: {0}")]
    DecisionService(#[from] LlmError),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::PlanParse(_) => ErrorKind::PlanParse,
            AgentError::UnresolvedReference(_) => ErrorKind::UnresolvedReference,
            AgentError::DecisionService(_) => ErrorKind::DecisionService,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::Config(_) => ErrorKind::Configuration,
        }
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.kind(), self.to_string())
    }
}

/// 恢复引擎根据错误给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 同一 Action 再调用一次（每个 Action 至多一次）
    RetryOnce,
    /// 记录为失败的 StepRecord，交给下一轮规划处理
    Record,
    /// 放弃当前批次，把提示注入下一轮规划
    Replan(String),
    /// 终止会话（Failed）
    Abort,
}
