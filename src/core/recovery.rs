//! 错误恢复引擎
//!
//! 根据错误类别返回 RecoveryAction，供执行循环决定是重试一次、记录失败、重新规划还是终止。

use crate::core::{AgentError, ErrorInfo, ErrorKind, RecoveryAction};

/// 单个 Action 的最大调用次数（首次 + 一次重试）
pub const MAX_ATTEMPTS_PER_ACTION: u32 = 2;

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_consecutive_parse_failures: usize,
}

impl RecoveryEngine {
    pub fn new(max_consecutive_parse_failures: usize) -> Self {
        Self {
            max_consecutive_parse_failures: max_consecutive_parse_failures.max(1),
        }
    }

    /// 工具调用失败后的动作；attempts 为已发起的调用次数
    ///
    /// 只有「连接断开但会话已重建」的 ToolUnavailable 会被重试；
    /// 超时与提供方拒绝交给下一轮规划决定。
    pub fn on_tool_failure(&self, error: &ErrorInfo, attempts: u32) -> RecoveryAction {
        if attempts >= MAX_ATTEMPTS_PER_ACTION {
            return RecoveryAction::Record;
        }
        match error.kind {
            ErrorKind::ToolUnavailable if error.retryable => RecoveryAction::RetryOnce,
            _ => RecoveryAction::Record,
        }
    }

    /// 规划输出解析失败；consecutive 为包含本轮在内的连续失败轮数
    pub fn on_parse_failure(&self, detail: &str, consecutive: usize) -> RecoveryAction {
        if consecutive >= self.max_consecutive_parse_failures {
            return RecoveryAction::Abort;
        }
        RecoveryAction::Replan(format!(
            "Your previous plan could not be used: {detail}. \
            Respond only with lines of the form FUNCTION_CALL: tool_name(param=\"value\") \
            or a single FINAL_ANSWER: <answer>."
        ))
    }

    /// 以 AgentError 出现的失败（规划、引用、决策服务、取消、配置）
    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::PlanParse(detail) => self.on_parse_failure(detail, 1),
            AgentError::UnresolvedReference(detail) => RecoveryAction::Replan(format!(
                "A back-reference could not be resolved: {detail}. \
                Only reference steps that already succeeded, e.g. {{{{step 1.field}}}}."
            )),
            AgentError::DecisionService(_) | AgentError::Cancelled | AgentError::Config(_) => {
                RecoveryAction::Abort
            }
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(3)
    }
}
