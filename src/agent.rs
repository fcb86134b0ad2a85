//! Agent 运行时
//!
//! 进程级装配：多路复用器、工具目录、Planner、会话监管与结果投递。
//! 每条外部消息启动一个独立的 ExecutionLoop；各循环只共享只读目录快照与提供方连接。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, SinkKind};
use crate::core::{AgentError, RecoveryEngine, SessionSupervisor};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::mcp::McpConnector;
use crate::perception::Perception;
use crate::react::{ExecutionLoop, LoopEvent, LoopOutcome, LoopReport, LoopSettings, Planner};
use crate::sink::{LogSink, OutcomeSink, ToolSink};
use crate::tools::{ProviderConnector, SessionMultiplexer, ToolCatalog, ToolRegistry};

pub struct AgentRuntime {
    mux: Arc<SessionMultiplexer>,
    registry: Arc<ToolRegistry>,
    planner: Planner,
    perception: Perception,
    recovery: RecoveryEngine,
    settings: LoopSettings,
    supervisor: SessionSupervisor,
    sink: Arc<dyn OutcomeSink>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRuntime {
    /// 校验配置、启动提供方工作任务并完成首次工具发现
    ///
    /// 不可达的提供方只会被记为降级，不会导致启动失败。
    pub async fn start(
        cfg: &AppConfig,
        connector: Arc<dyn ProviderConnector>,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Self, AgentError> {
        cfg.validate()?;

        let mux = Arc::new(SessionMultiplexer::new(
            &cfg.providers,
            connector,
            cfg.multiplexer_settings(),
        ));
        let registry = Arc::new(ToolRegistry::new(mux.clone()));
        let catalog = registry.discover().await;
        if catalog.is_empty() {
            tracing::warn!("no tools available; requests can only be answered directly");
        }
        let refresh_task = registry.spawn_refresh_on_reconnect();

        let sink: Arc<dyn OutcomeSink> = match (cfg.sink.kind, cfg.sink.tool.as_deref()) {
            (SinkKind::Tool, Some(tool)) => Arc::new(ToolSink::new(
                mux.clone(),
                registry.clone(),
                tool,
                cfg.sink.recipient_arg.clone(),
                cfg.sink.text_arg.clone(),
            )),
            _ => Arc::new(LogSink),
        };

        tracing::info!(
            providers = mux.providers().len(),
            tools = catalog.len(),
            degraded = catalog.degraded().len(),
            "agent runtime started"
        );

        Ok(Self {
            planner: Planner::new(llm, cfg.completion_constraints(), cfg.llm_timeout()),
            perception: Perception::new(),
            recovery: RecoveryEngine::new(cfg.agent.max_consecutive_parse_failures),
            settings: cfg.loop_settings(),
            supervisor: SessionSupervisor::new(),
            mux,
            registry,
            sink,
            refresh_task: Mutex::new(Some(refresh_task)),
        })
    }

    /// 使用 MCP over HTTP 连接器与配置中的决策服务启动
    pub async fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let connector = McpConnector::with_timeouts(
            Duration::from_secs(cfg.tools.connect_timeout_secs),
            Duration::from_secs(cfg.tools.call_timeout_secs),
        )
        .map_err(|e| AgentError::Config(format!("failed to build http client: {e}")))?;
        Self::start(cfg, Arc::new(connector), create_llm_from_config(cfg)).await
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    /// 当前工具目录快照
    pub fn catalog(&self) -> Arc<ToolCatalog> {
        self.registry.snapshot()
    }

    /// 处理一条消息并投递终止结果
    pub async fn handle_message(&self, session_id: &str, text: &str) -> LoopOutcome {
        self.run(session_id, text, None).await.outcome
    }

    /// 同 handle_message，并把过程事件推到 event_tx；返回完整的上下文与记忆
    pub async fn handle_message_with_events(
        &self,
        session_id: &str,
        text: &str,
        event_tx: &mpsc::UnboundedSender<LoopEvent>,
    ) -> LoopReport {
        self.run(session_id, text, Some(event_tx)).await
    }

    async fn run(
        &self,
        session_id: &str,
        text: &str,
        event_tx: Option<&mpsc::UnboundedSender<LoopEvent>>,
    ) -> LoopReport {
        let lease = self.supervisor.begin(session_id);
        let mut exec = ExecutionLoop::new(
            &self.planner,
            &self.mux,
            &self.perception,
            &self.recovery,
            &self.settings,
            self.registry.snapshot(),
        )
        .with_cancel_token(lease.token.clone());
        if let Some(tx) = event_tx {
            exec = exec.with_event_tx(tx);
        }
        let report = exec.run(session_id, text).await;
        self.supervisor.finish(&lease);
        self.sink.deliver(session_id, &report.outcome).await;
        report
    }

    /// 取消会话中正在运行的循环
    pub fn cancel(&self, session_id: &str) -> bool {
        self.supervisor.cancel(session_id)
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.supervisor.is_running(session_id)
    }

    /// 取消全部循环并停止提供方工作任务
    pub fn shutdown(&self) {
        self.supervisor.shutdown();
        if let Some(task) = self
            .refresh_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.mux.shutdown();
        tracing::info!("agent runtime stopped");
    }
}
