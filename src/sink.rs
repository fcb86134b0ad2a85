//! 终止消息的投递
//!
//! 每个循环结束后恰好投递一次：最终答案、部分结果摘要或通用失败提示。
//! 内部错误细节只写日志，不发给用户。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::react::LoopOutcome;
use crate::tools::{SessionMultiplexer, ToolRegistry};

#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn deliver(&self, session_id: &str, outcome: &LoopOutcome);
}

/// 只写日志（默认）
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl OutcomeSink for LogSink {
    async fn deliver(&self, session_id: &str, outcome: &LoopOutcome) {
        if let LoopOutcome::Failed { error } = outcome {
            tracing::error!(session_id, kind = %error.kind, detail = %error.message, "request failed");
        }
        tracing::info!(session_id, reply = %outcome.user_message(), "reply");
    }
}

/// 通过消息类工具把回复发回会话（如 telegram_send_message，chat_id = session_id）
pub struct ToolSink {
    mux: Arc<SessionMultiplexer>,
    registry: Arc<ToolRegistry>,
    tool: String,
    recipient_arg: String,
    text_arg: String,
}

impl ToolSink {
    pub fn new(
        mux: Arc<SessionMultiplexer>,
        registry: Arc<ToolRegistry>,
        tool: impl Into<String>,
        recipient_arg: impl Into<String>,
        text_arg: impl Into<String>,
    ) -> Self {
        Self {
            mux,
            registry,
            tool: tool.into(),
            recipient_arg: recipient_arg.into(),
            text_arg: text_arg.into(),
        }
    }

    fn arguments(&self, session_id: &str, text: String) -> Value {
        let mut args = Map::new();
        args.insert(self.recipient_arg.clone(), Value::String(session_id.to_string()));
        args.insert(self.text_arg.clone(), Value::String(text));
        Value::Object(args)
    }
}

#[async_trait]
impl OutcomeSink for ToolSink {
    async fn deliver(&self, session_id: &str, outcome: &LoopOutcome) {
        LogSink.deliver(session_id, outcome).await;

        let catalog = self.registry.snapshot();
        let qualified = match catalog.resolve(&self.tool) {
            Ok(d) => d.qualified_name.clone(),
            Err(e) => {
                tracing::warn!(session_id, tool = %self.tool, error = %e, "reply tool not in catalog");
                return;
            }
        };
        let args = self.arguments(session_id, outcome.user_message());
        let result = self.mux.invoke(&qualified, args, None).await;
        if !result.ok {
            tracing::warn!(
                session_id,
                tool = %qualified,
                error = ?result.error,
                "failed to deliver reply"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorInfo, ErrorKind};
    use crate::tools::{
        MultiplexerSettings, ProviderConnector, ProviderEndpoint, ProviderError, ProviderSession,
        RemoteCallOutcome, RemoteTool,
    };
    use std::sync::Mutex;

    type Sent = Arc<Mutex<Vec<(String, Value)>>>;

    struct Recorder(Sent);

    struct RecorderSession(Sent);

    #[async_trait]
    impl ProviderSession for RecorderSession {
        async fn list_tools(&mut self) -> Result<Vec<RemoteTool>, ProviderError> {
            Ok(vec![RemoteTool {
                name: "telegram_send_message".into(),
                description: "Send a Telegram message".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }])
        }

        async fn call(&mut self, tool: &str, arguments: Value) -> Result<RemoteCallOutcome, ProviderError> {
            self.0.lock().unwrap().push((tool.to_string(), arguments));
            Ok(RemoteCallOutcome::text("sent"))
        }
    }

    #[async_trait]
    impl ProviderConnector for Recorder {
        async fn connect(&self, _: &ProviderEndpoint) -> Result<Box<dyn ProviderSession>, ProviderError> {
            Ok(Box::new(RecorderSession(self.0.clone())))
        }
    }

    #[tokio::test]
    async fn test_tool_sink_sends_user_message() {
        let sent: Sent = Arc::default();
        let mux = Arc::new(SessionMultiplexer::new(
            &[ProviderEndpoint::new("telegram", "mem://telegram")],
            Arc::new(Recorder(sent.clone())),
            MultiplexerSettings::default(),
        ));
        let registry = Arc::new(ToolRegistry::new(mux.clone()));
        registry.discover().await;

        let sink = ToolSink::new(mux, registry, "telegram_send_message", "chat_id", "text");
        let outcome = LoopOutcome::Failed {
            error: ErrorInfo::new(ErrorKind::DecisionService, "upstream 503 body"),
        };
        sink.deliver("42", &outcome).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "telegram_send_message");
        assert_eq!(sent[0].1["chat_id"], "42");
        let text = sent[0].1["text"].as_str().unwrap();
        assert!(!text.contains("upstream 503 body"));
    }
}
