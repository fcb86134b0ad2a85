//! 会话上下文：一次请求从受理到终止的全部可变状态
//!
//! 执行循环独占 AgentContext；history 只追加，step_count 恒等于 history 长度。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::core::{AgentStatus, LoopState};
use crate::react::ArgValue;
use crate::tools::ToolCallResult;

/// 一个已解析的计划动作
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ToolCall {
        tool_name: String,
        arguments: BTreeMap<String, ArgValue>,
    },
    FinalAnswer {
        text: String,
    },
}

impl Action {
    pub fn tool_call(tool_name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match ArgValue::from_json(arguments) {
            ArgValue::Map(map) => map,
            ArgValue::Literal(Value::Null) => BTreeMap::new(),
            other => BTreeMap::from([("input".to_string(), other)]),
        };
        Action::ToolCall {
            tool_name: tool_name.into(),
            arguments,
        }
    }

    pub fn final_answer(text: impl Into<String>) -> Self {
        Action::FinalAnswer { text: text.into() }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::ToolCall {
                tool_name,
                arguments,
            } => {
                let args: Vec<String> = arguments
                    .iter()
                    .map(|(k, v)| format!("{k}={}", v.to_display_json()))
                    .collect();
                write!(f, "{tool_name}({})", args.join(", "))
            }
            Action::FinalAnswer { text } => write!(f, "FINAL_ANSWER: {text}"),
        }
    }
}

/// 一个已执行步骤
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// 0 起，等于写入时的 step_count
    pub step_index: usize,
    pub action: Action,
    /// 引用替换后的实际参数；引用解析失败时为 Null
    pub resolved_arguments: Value,
    pub result: ToolCallResult,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
}

impl StepRecord {
    pub fn new(
        step_index: usize,
        action: Action,
        resolved_arguments: Value,
        result: ToolCallResult,
        attempts: u32,
    ) -> Self {
        Self {
            step_index,
            action,
            resolved_arguments,
            result,
            timestamp: Utc::now(),
            attempts,
        }
    }

    pub fn tool_name(&self) -> &str {
        match &self.action {
            Action::ToolCall { tool_name, .. } => tool_name,
            Action::FinalAnswer { .. } => "",
        }
    }

    /// 记忆与提示中使用的一行文本：`tool(args) → result`
    pub fn summary_line(&self, max_chars: usize) -> String {
        let status = if self.result.ok {
            self.result.preview(max_chars)
        } else {
            match &self.result.error {
                Some(e) => format!("failed ({}): {}", e.kind, crate::tools::result::truncate_chars(&e.message, max_chars)),
                None => "failed".to_string(),
            }
        };
        let args = if self.resolved_arguments.is_null() {
            match &self.action {
                Action::ToolCall { arguments, .. } => Value::Object(
                    arguments
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_display_json()))
                        .collect(),
                )
                .to_string(),
                Action::FinalAnswer { .. } => String::new(),
            }
        } else {
            self.resolved_arguments.to_string()
        };
        format!("{}({}) → {}", self.tool_name(), args, status)
    }
}

/// 会话上下文
#[derive(Debug)]
pub struct AgentContext {
    pub session_id: String,
    pub original_request: String,
    history: Vec<StepRecord>,
    pub final_answer: Option<String>,
    state: LoopState,
}

impl AgentContext {
    pub fn new(session_id: impl Into<String>, original_request: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            original_request: original_request.into(),
            history: Vec::new(),
            final_answer: None,
            state: LoopState::Init,
        }
    }

    pub fn step_count(&self) -> usize {
        self.history.len()
    }

    pub fn history(&self) -> &[StepRecord] {
        &self.history
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn status(&self) -> AgentStatus {
        self.state.status()
    }

    /// 追加一条记录；step_index 以当前 step_count 为准
    pub fn push_step(&mut self, mut record: StepRecord) -> &StepRecord {
        record.step_index = self.history.len();
        self.history.push(record);
        &self.history[self.history.len() - 1]
    }

    /// 状态转移；非法转移被拒绝并返回 false
    pub fn transition(&mut self, next: LoopState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            tracing::error!(from = ?self.state, to = ?next, session_id = %self.session_id, "illegal loop transition");
            return false;
        }
        tracing::debug!(from = ?self.state, to = ?next, session_id = %self.session_id, "loop transition");
        self.state = next;
        true
    }

    pub fn last_successful(&self) -> Option<&StepRecord> {
        self.history.iter().rev().find(|r| r.result.ok)
    }
}
