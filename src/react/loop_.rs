//! 执行循环：感知 → 规划 → 执行 → 决策
//!
//! 每个请求一个循环实例，独占 AgentContext 与 MemoryStore。感知只做一次；之后反复
//! 规划、按序执行批次中的动作，直到出现 FINAL_ANSWER（Completed）、步数用尽或截止
//! （Exhausted）、决策服务失败 / 连续解析失败 / 取消（Failed）。
//!
//! 工具失败不会终止循环：失败被记为 StepRecord，由下一轮规划决定如何处理。
//! 取消令牌触发时正在进行的调用随 future 一起被丢弃，多路复用器随之中止该调用。

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, ErrorInfo, ErrorKind, LoopState, RecoveryAction, RecoveryEngine};
use crate::memory::{tags, MemoryItem, MemoryStore};
use crate::perception::Perception;
use crate::react::{
    parse_plan, resolve_arguments, Action, AgentContext, ArgValue, LoopEvent, PlanRequest, Planner,
    StepRecord,
};
use crate::tools::{filter_by_hints, SessionMultiplexer, ToolCallResult, ToolCatalog, ToolDescriptor};

/// 记忆条目中结果预览的长度
const MEMORY_PREVIEW_CHARS: usize = 300;
/// 部分结果摘要中的预览长度
const SUMMARY_PREVIEW_CHARS: usize = 200;

/// 规划提示的工具范围策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// 始终只提供感知缩小后的候选集
    Conservative,
    /// 决策服务选了候选集之外或不存在的工具时，下一轮改为提供整个目录
    #[default]
    RetryOnce,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_steps: usize,
    pub memory_top_k: NonZeroUsize,
    pub memory_type_filter: Option<String>,
    pub call_timeout: Duration,
    /// 整个循环的截止时长；None 表示不限
    pub deadline: Option<Duration>,
    pub strategy: Strategy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_steps: 8,
            memory_top_k: NonZeroUsize::new(5).unwrap_or(NonZeroUsize::MIN),
            memory_type_filter: None,
            call_timeout: Duration::from_secs(30),
            deadline: None,
            strategy: Strategy::default(),
        }
    }
}

/// 循环的终止结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoopOutcome {
    Completed { answer: String },
    Failed { error: ErrorInfo },
    /// 步数或时间用尽；summary 为部分结果
    Exhausted { summary: String, reason: ErrorKind },
}

impl LoopOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, LoopOutcome::Completed { .. })
    }

    /// 发给用户的终止消息
    pub fn user_message(&self) -> String {
        match self {
            LoopOutcome::Completed { answer } => answer.clone(),
            LoopOutcome::Exhausted { summary, .. } => summary.clone(),
            LoopOutcome::Failed { error } => match error.kind {
                ErrorKind::Cancelled => "Your request was cancelled.".to_string(),
                kind => format!("Sorry, I couldn't complete your request ({kind}). Please try again."),
            },
        }
    }

    fn terminal_state(&self) -> LoopState {
        match self {
            LoopOutcome::Completed { .. } => LoopState::Completed,
            LoopOutcome::Failed { .. } => LoopState::Failed,
            LoopOutcome::Exhausted { .. } => LoopState::Exhausted,
        }
    }
}

/// 循环结束后交还给调用方的全部状态
#[derive(Debug)]
pub struct LoopReport {
    pub outcome: LoopOutcome,
    pub context: AgentContext,
    pub memory: MemoryStore,
}

enum BatchFlow {
    Continue,
    Abort,
}

enum Interrupted {
    Done(LoopOutcome),
    Cancelled,
    Deadline,
}

/// 单次请求的执行循环
pub struct ExecutionLoop<'a> {
    planner: &'a Planner,
    mux: &'a SessionMultiplexer,
    perception: &'a Perception,
    recovery: &'a RecoveryEngine,
    settings: &'a LoopSettings,
    catalog: Arc<ToolCatalog>,
    cancel_token: CancellationToken,
    event_tx: Option<&'a mpsc::UnboundedSender<LoopEvent>>,
}

fn send_event(tx: &Option<&mpsc::UnboundedSender<LoopEvent>>, ev: LoopEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

impl<'a> ExecutionLoop<'a> {
    pub fn new(
        planner: &'a Planner,
        mux: &'a SessionMultiplexer,
        perception: &'a Perception,
        recovery: &'a RecoveryEngine,
        settings: &'a LoopSettings,
        catalog: Arc<ToolCatalog>,
    ) -> Self {
        Self {
            planner,
            mux,
            perception,
            recovery,
            settings,
            catalog,
            cancel_token: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// 设置事件推送通道
    pub fn with_event_tx(mut self, tx: &'a mpsc::UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub async fn run(self, session_id: &str, request: &str) -> LoopReport {
        let mut ctx = AgentContext::new(session_id, request);
        let mut memory = MemoryStore::new();
        memory.append(MemoryItem::new(tags::USER_REQUEST, request, None));
        tracing::info!(session_id, tools = self.catalog.len(), "loop started");

        let interrupted = {
            let drive = self.drive(&mut ctx, &mut memory);
            let deadline = self.settings.deadline;
            let bounded = async move {
                match deadline {
                    Some(limit) => tokio::time::timeout(limit, drive).await.ok(),
                    None => Some(drive.await),
                }
            };
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => Interrupted::Cancelled,
                res = bounded => match res {
                    Some(outcome) => Interrupted::Done(outcome),
                    None => Interrupted::Deadline,
                },
            }
        };

        let outcome = match interrupted {
            Interrupted::Done(outcome) => outcome,
            Interrupted::Cancelled => {
                tracing::warn!(session_id, steps = ctx.step_count(), "loop cancelled");
                LoopOutcome::Failed {
                    error: AgentError::Cancelled.to_info(),
                }
            }
            Interrupted::Deadline => {
                tracing::warn!(session_id, steps = ctx.step_count(), "loop deadline exceeded");
                LoopOutcome::Exhausted {
                    summary: partial_summary(&ctx, ErrorKind::DeadlineExceeded),
                    reason: ErrorKind::DeadlineExceeded,
                }
            }
        };

        if let LoopOutcome::Completed { answer } = &outcome {
            ctx.final_answer = Some(answer.clone());
        }
        self.enter(&mut ctx, outcome.terminal_state());
        tracing::info!(
            session_id,
            status = ?ctx.status(),
            steps = ctx.step_count(),
            "loop finished"
        );
        send_event(&self.event_tx, LoopEvent::Finished {
            outcome: outcome.clone(),
        });
        LoopReport {
            outcome,
            context: ctx,
            memory,
        }
    }

    fn enter(&self, ctx: &mut AgentContext, state: LoopState) {
        if ctx.transition(state) {
            send_event(&self.event_tx, LoopEvent::StateChanged { state });
        }
    }

    async fn drive(&self, ctx: &mut AgentContext, memory: &mut MemoryStore) -> LoopOutcome {
        self.enter(ctx, LoopState::Perceiving);
        let perception = self.perception.analyze(&ctx.original_request, &self.catalog);
        tracing::debug!(
            session_id = %ctx.session_id,
            intent = %perception.intent_tag,
            hints = perception.tool_hints.len(),
            "request perceived"
        );
        send_event(&self.event_tx, LoopEvent::Perceived {
            intent: perception.intent_tag,
            hints: perception.tool_hints.iter().cloned().collect(),
        });

        let mut full_catalog = perception.tool_hints.is_empty();
        let mut notes: Vec<String> = Vec::new();
        let mut parse_failures = 0usize;
        let mut iteration = 0usize;

        loop {
            self.enter(ctx, LoopState::Planning);
            iteration += 1;

            let plan_text = {
                let candidates: Vec<&ToolDescriptor> = if full_catalog {
                    self.catalog.tools().iter().collect()
                } else {
                    filter_by_hints(&self.catalog, &perception.tool_hints)
                };
                let excerpt = memory.query(
                    &ctx.original_request,
                    self.settings.memory_top_k,
                    self.settings.memory_type_filter.as_deref(),
                );
                let request = PlanRequest {
                    context: &*ctx,
                    perception: &perception,
                    candidate_tools: &candidates,
                    memory: &excerpt,
                    notes: &notes,
                    max_steps: self.settings.max_steps,
                };
                match self.planner.plan(&request).await {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::error!(session_id = %ctx.session_id, error = %err, "planning failed");
                        return LoopOutcome::Failed {
                            error: err.to_info(),
                        };
                    }
                }
            };
            send_event(&self.event_tx, LoopEvent::PlanReceived {
                iteration,
                preview: plan_text.chars().take(500).collect(),
            });

            let parsed = parse_plan(&plan_text);
            for e in &parsed.errors {
                send_event(&self.event_tx, LoopEvent::PlanError {
                    line: e.line,
                    fragment: e.fragment.clone(),
                    reason: e.reason.clone(),
                });
            }
            notes.clear();
            if parsed.is_clean() {
                parse_failures = 0;
            } else {
                parse_failures += 1;
                let detail = parsed.describe_errors();
                tracing::warn!(
                    session_id = %ctx.session_id,
                    consecutive = parse_failures,
                    %detail,
                    "unusable plan"
                );
                memory.append(MemoryItem::new(
                    tags::PLAN_NOTE,
                    format!("unusable plan: {detail}"),
                    None,
                ));
                match self.recovery.on_parse_failure(&detail, parse_failures) {
                    RecoveryAction::Abort => {
                        return LoopOutcome::Failed {
                            error: ErrorInfo::new(
                                ErrorKind::PlanParse,
                                format!("{parse_failures} consecutive unusable plans; last: {detail}"),
                            ),
                        };
                    }
                    RecoveryAction::Replan(note) => notes.push(note),
                    RecoveryAction::RetryOnce | RecoveryAction::Record => {}
                }
            }

            self.enter(ctx, LoopState::Executing);
            let mut final_answer = None;
            for action in parsed.usable_actions() {
                match action {
                    Action::FinalAnswer { text } => {
                        final_answer = Some(text);
                        break;
                    }
                    Action::ToolCall {
                        tool_name,
                        arguments,
                    } => {
                        if ctx.step_count() >= self.settings.max_steps {
                            tracing::info!(session_id = %ctx.session_id, "step budget reached, dropping rest of batch");
                            break;
                        }
                        let flow = self
                            .execute_call(
                                ctx,
                                memory,
                                &perception.tool_hints,
                                &mut full_catalog,
                                &mut notes,
                                tool_name,
                                arguments,
                            )
                            .await;
                        if let BatchFlow::Abort = flow {
                            break;
                        }
                    }
                }
            }

            self.enter(ctx, LoopState::Deciding);
            if let Some(text) = final_answer {
                return LoopOutcome::Completed {
                    answer: render_answer(&text, ctx.history()),
                };
            }
            if ctx.step_count() >= self.settings.max_steps {
                return LoopOutcome::Exhausted {
                    summary: partial_summary(ctx, ErrorKind::BudgetExhausted),
                    reason: ErrorKind::BudgetExhausted,
                };
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_call(
        &self,
        ctx: &mut AgentContext,
        memory: &mut MemoryStore,
        hints: &BTreeSet<String>,
        full_catalog: &mut bool,
        notes: &mut Vec<String>,
        tool_name: String,
        arguments: BTreeMap<String, ArgValue>,
    ) -> BatchFlow {
        let step_number = ctx.step_count() + 1;
        let action = Action::ToolCall {
            tool_name: tool_name.clone(),
            arguments: arguments.clone(),
        };
        let widen = self.settings.strategy == Strategy::RetryOnce && !*full_catalog;

        let descriptor = match self.catalog.resolve(&tool_name) {
            Ok(d) => d.clone(),
            Err(e) => {
                tracing::warn!(session_id = %ctx.session_id, tool = %tool_name, error = %e, "planner chose an unknown tool");
                if widen {
                    *full_catalog = true;
                    notes.push(format!(
                        "'{tool_name}' is not an available tool; the full tool list is shown now."
                    ));
                }
                let result = ToolCallResult::failure(ErrorInfo::new(ErrorKind::ToolRejected, e.to_string()));
                self.record(ctx, memory, action, Value::Null, result, 0);
                return BatchFlow::Continue;
            }
        };
        if widen && !hints.contains(&descriptor.qualified_name) {
            *full_catalog = true;
        }

        let resolved = match resolve_arguments(&arguments, ctx.history()) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(session_id = %ctx.session_id, tool = %tool_name, error = %e, "unresolved back-reference");
                let err = AgentError::UnresolvedReference(e.to_string());
                if let RecoveryAction::Replan(note) = self.recovery.handle(&err) {
                    notes.push(note);
                }
                let result = ToolCallResult::failure(ErrorInfo::new(ErrorKind::UnresolvedReference, e.to_string()));
                self.record(ctx, memory, action, Value::Null, result, 0);
                return BatchFlow::Abort;
            }
        };
        let args = descriptor.prepare_arguments(resolved);
        send_event(&self.event_tx, LoopEvent::ToolCall {
            step: step_number,
            tool: descriptor.qualified_name.clone(),
            args: args.clone(),
        });

        let mut attempts = 0u32;
        let result = loop {
            attempts += 1;
            let res = self
                .mux
                .invoke(&descriptor.qualified_name, args.clone(), Some(self.settings.call_timeout))
                .await;
            let Some(err) = res.error.as_ref().filter(|_| !res.ok) else {
                break res;
            };
            match self.recovery.on_tool_failure(err, attempts) {
                RecoveryAction::RetryOnce => {
                    tracing::info!(
                        session_id = %ctx.session_id,
                        tool = %descriptor.qualified_name,
                        reason = %err.message,
                        "retrying call on re-established session"
                    );
                    send_event(&self.event_tx, LoopEvent::Retry {
                        step: step_number,
                        tool: descriptor.qualified_name.clone(),
                        reason: err.message.clone(),
                    });
                }
                _ => break res,
            }
        };
        self.record(ctx, memory, action, args, result, attempts);
        BatchFlow::Continue
    }

    fn record(
        &self,
        ctx: &mut AgentContext,
        memory: &mut MemoryStore,
        action: Action,
        resolved_arguments: Value,
        result: ToolCallResult,
        attempts: u32,
    ) {
        let session_id = ctx.session_id.clone();
        let rec = ctx.push_step(StepRecord::new(0, action, resolved_arguments, result, attempts));
        let step_index = rec.step_index;
        let ok = rec.result.ok;
        let error = rec.result.error_kind();
        let tool = rec.tool_name().to_string();
        let line = rec.summary_line(MEMORY_PREVIEW_CHARS);
        let preview = rec.result.preview(SUMMARY_PREVIEW_CHARS);

        let tag = if ok { tags::TOOL_OUTPUT } else { tags::TOOL_ERROR };
        memory.append(MemoryItem::new(tag, line, Some(step_index)));
        tracing::info!(session_id = %session_id, step = step_index + 1, tool = %tool, ok, attempts, "step recorded");
        send_event(&self.event_tx, LoopEvent::Observation {
            step: step_index + 1,
            tool,
            ok,
            error,
            preview,
        });
    }
}

/// 最终答案中的回溯引用尽量替换；无法解析时保留原文
fn render_answer(text: &str, history: &[StepRecord]) -> String {
    let arg = ArgValue::from_json(Value::String(text.to_string()));
    if !arg.has_references() {
        return text.to_string();
    }
    match arg.resolve(history) {
        Ok(Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => text.to_string(),
    }
}

/// 步数或时间用尽时给用户的部分结果
pub fn partial_summary(ctx: &AgentContext, reason: ErrorKind) -> String {
    let mut summary = match reason {
        ErrorKind::DeadlineExceeded => "I ran out of time while processing your request.".to_string(),
        _ => "I've reached the maximum processing steps for your request.".to_string(),
    };
    if let Some(last) = ctx.last_successful() {
        summary.push_str(" Here's the last information I have: ");
        summary.push_str(&last.result.preview(SUMMARY_PREVIEW_CHARS));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_messages() {
        let done = LoopOutcome::Completed { answer: "42".into() };
        assert_eq!(done.user_message(), "42");
        let failed = LoopOutcome::Failed {
            error: ErrorInfo::new(ErrorKind::DecisionService, "503"),
        };
        assert!(failed.user_message().contains("DecisionServiceError"));
        let cancelled = LoopOutcome::Failed {
            error: AgentError::Cancelled.to_info(),
        };
        assert_eq!(cancelled.user_message(), "Your request was cancelled.");
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let v = serde_json::to_value(LoopOutcome::Exhausted {
            summary: "partial".into(),
            reason: ErrorKind::BudgetExhausted,
        })
        .unwrap();
        assert_eq!(v["status"], "exhausted");
        assert_eq!(v["reason"], "budget_exhausted");
    }

    #[test]
    fn test_partial_summary_uses_last_success() {
        let mut ctx = AgentContext::new("s", "r");
        ctx.push_step(StepRecord::new(
            0,
            Action::tool_call("search", json!({})),
            json!({}),
            ToolCallResult::success(json!("top result"), "top result"),
            1,
        ));
        ctx.push_step(StepRecord::new(
            0,
            Action::tool_call("extract", json!({})),
            json!({}),
            ToolCallResult::failure(ErrorInfo::new(ErrorKind::ToolTimeout, "slow")),
            1,
        ));
        let s = partial_summary(&ctx, ErrorKind::BudgetExhausted);
        assert_eq!(
            s,
            "I've reached the maximum processing steps for your request. Here's the last information I have: top result"
        );
    }

    #[test]
    fn test_render_answer_resolves_references() {
        let history = vec![StepRecord::new(
            0,
            Action::tool_call("create_sheet", json!({})),
            json!({}),
            ToolCallResult::success(json!({"url": "https://sheet"}), ""),
            1,
        )];
        assert_eq!(render_answer("Done: {{step 1.url}}", &history), "Done: https://sheet");
        assert_eq!(render_answer("Missing {{step 5}}", &history), "Missing {{step 5}}");
    }
}
