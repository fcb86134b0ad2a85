//! Planner：组装提示并调用决策服务，返回原始计划文本
//!
//! 提示包含原始请求、感知结果、候选工具摘要、记忆摘录、已执行步骤与上一轮的纠错提示。
//! 每次调用带超时；超时或调用失败转为 AgentError::DecisionService。

use std::sync::Arc;
use std::time::Duration;

use crate::core::AgentError;
use crate::llm::{CompletionConstraints, LlmClient, LlmError, Message};
use crate::memory::{MemoryItem, MemoryStore};
use crate::perception::PerceptionResult;
use crate::react::AgentContext;
use crate::tools::{summarize_tools, tool_call_schema_json, ToolDescriptor};

/// 已执行步骤在提示中的预览长度
const HISTORY_PREVIEW_CHARS: usize = 400;

const BASE_SYSTEM_PROMPT: &str = "You are an orchestration agent. You fulfil the user's request by calling the available tools, \
then give a final answer.

Reply with one action per line, using exactly one of these forms:
FUNCTION_CALL: tool_name(param=\"value\", other=3)
FINAL_ANSWER: <the answer for the user>

Several FUNCTION_CALL lines may be listed; they run in order. A JSON object per line is also accepted:
{\"tool_name\": \"...\", \"parameters\": {...}}

To use the result of an earlier step, write {{step K}} for the whole result of step K (1-based), \
or {{step K.field.path}} for a field inside it, e.g. sheet_id=\"{{step 2.id}}\" or url=\"{{step 1.items.0.url}}\". \
Only reference steps that have already succeeded.

Use only tools from the list. When the request is satisfied, or no tool can help, reply with FINAL_ANSWER.";

/// 一次规划调用的输入
pub struct PlanRequest<'a> {
    pub context: &'a AgentContext,
    pub perception: &'a PerceptionResult,
    pub candidate_tools: &'a [&'a ToolDescriptor],
    pub memory: &'a [MemoryItem],
    pub notes: &'a [String],
    pub max_steps: usize,
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    constraints: CompletionConstraints,
    timeout: Duration,
    system_prompt: String,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, constraints: CompletionConstraints, timeout: Duration) -> Self {
        Self {
            llm,
            constraints,
            timeout,
            system_prompt: format!(
                "{BASE_SYSTEM_PROMPT}\n\nJSON tool call schema:\n{}",
                tool_call_schema_json()
            ),
        }
    }

    /// 覆盖默认系统提示词
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn build_messages(&self, req: &PlanRequest<'_>) -> Vec<Message> {
        let ctx = req.context;
        let mut user = format!("## User request\n{}\n", ctx.original_request);
        user.push_str(&format!("\n## Perception\n{}\n", req.perception.to_prompt_section()));
        user.push_str(&format!(
            "\n## Budget\n{} of {} tool calls used\n",
            ctx.step_count(),
            req.max_steps
        ));
        user.push_str(&format!("\n## Available tools\n{}", summarize_tools(req.candidate_tools)));

        let memory = MemoryStore::to_prompt_section(req.memory);
        if !memory.is_empty() {
            user.push_str(&format!("\n## Memory\n{memory}\n"));
        }

        if !ctx.history().is_empty() {
            user.push_str("\n## Steps so far\n");
            for rec in ctx.history() {
                user.push_str(&format!(
                    "Step {}: {}\n",
                    rec.step_index + 1,
                    rec.summary_line(HISTORY_PREVIEW_CHARS)
                ));
            }
        }

        if !req.notes.is_empty() {
            user.push_str("\n## Notes\n");
            for note in req.notes {
                user.push_str(&format!("- {note}\n"));
            }
        }
        user.push_str("\nReply with the next FUNCTION_CALL line(s), or FINAL_ANSWER.");

        vec![Message::system(self.system_prompt.clone()), Message::user(user)]
    }

    /// 调用决策服务得到计划文本
    pub async fn plan(&self, req: &PlanRequest<'_>) -> Result<String, AgentError> {
        let messages = self.build_messages(req);
        let text = tokio::time::timeout(self.timeout, self.llm.complete(&messages, &self.constraints))
            .await
            .map_err(|_| LlmError::Timeout(self.timeout))??;
        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse.into());
        }
        tracing::debug!(session_id = %req.context.session_id, chars = text.len(), "plan received");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::tags;
    use crate::perception::Perception;
    use crate::tools::{RemoteTool, ToolCatalog};
    use serde_json::json;

    fn catalog() -> ToolCatalog {
        ToolCatalog::build(vec![(
            "serpapi".into(),
            Ok(vec![RemoteTool {
                name: "search".into(),
                description: "Web search".into(),
                input_schema: json!({"type": "object", "properties": {"query": {"type": "string"}}}),
            }]),
        )])
    }

    #[tokio::test]
    async fn test_prompt_contains_sections() {
        let llm = Arc::new(MockLlmClient::scripted(["FINAL_ANSWER: hi"]));
        let planner = Planner::new(llm.clone(), CompletionConstraints::default(), Duration::from_secs(5));
        let catalog = catalog();
        let ctx = AgentContext::new("s1", "search rust news");
        let perception = Perception::new().analyze(&ctx.original_request, &catalog);
        let tools: Vec<&ToolDescriptor> = catalog.tools().iter().collect();
        let memory = vec![MemoryItem::new(tags::USER_REQUEST, "search rust news", None)];
        let notes = vec!["previous plan was empty".to_string()];
        let req = PlanRequest {
            context: &ctx,
            perception: &perception,
            candidate_tools: &tools,
            memory: &memory,
            notes: &notes,
            max_steps: 8,
        };

        let text = planner.plan(&req).await.unwrap();
        assert_eq!(text, "FINAL_ANSWER: hi");

        let prompts = llm.prompts();
        let user = &prompts[0][1].content;
        assert!(prompts[0][0].content.contains("FUNCTION_CALL"));
        assert!(user.contains("## User request\nsearch rust news"));
        assert!(user.contains("Intent: search"));
        assert!(user.contains("- search: Web search"));
        assert!(user.contains("0 of 8 tool calls used"));
        assert!(user.contains("previous plan was empty"));
    }

    #[tokio::test]
    async fn test_timeout_is_decision_service_error() {
        let llm = Arc::new(MockLlmClient::scripted(["late"]).with_delay(Duration::from_millis(200)));
        let planner = Planner::new(llm, CompletionConstraints::default(), Duration::from_millis(20));
        let catalog = catalog();
        let ctx = AgentContext::new("s1", "x");
        let perception = Perception::new().analyze("x", &catalog);
        let req = PlanRequest {
            context: &ctx,
            perception: &perception,
            candidate_tools: &[],
            memory: &[],
            notes: &[],
            max_steps: 8,
        };
        let err = planner.plan(&req).await.unwrap_err();
        assert!(matches!(err, AgentError::DecisionService(LlmError::Timeout(_))));
    }
}
