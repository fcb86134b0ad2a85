//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ORCA__*` 覆盖（双下划线表示嵌套，如 `ORCA__AGENT__MAX_STEPS=12`）。
//! 配置在进程启动时加载一次，之后只读。

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::core::AgentError;
use crate::llm::CompletionConstraints;
use crate::react::{LoopSettings, Strategy};
use crate::tools::{MultiplexerSettings, ProviderEndpoint, QUALIFIER};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    /// [[providers]]：工具提供方列表
    pub providers: Vec<ProviderEndpoint>,
    pub sink: SinkSection,
    pub inbound: InboundSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [agent] 段：执行循环参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 每个请求最多执行的工具步骤数
    pub max_steps: usize,
    /// 每轮规划注入的记忆条数
    pub memory_top_k: usize,
    pub memory_type_filter: Option<String>,
    /// 连续解析失败达到该轮数时终止会话
    pub max_consecutive_parse_failures: usize,
    /// 整个循环的截止秒数；0 或缺省表示不限
    pub loop_deadline_secs: Option<u64>,
    pub strategy: Strategy,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: 8,
            memory_top_k: 5,
            memory_type_filter: None,
            max_consecutive_parse_failures: 3,
            loop_deadline_secs: None,
            strategy: Strategy::default(),
        }
    }
}

/// 决策服务后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Mock,
}

/// [llm] 段：后端选择、采样参数与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: LlmProvider,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            temperature: 0.2,
            max_tokens: 1024,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次规划请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [tools] 段：调用与连接超时、每个提供方的排队上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub call_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub queue_depth: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            connect_timeout_secs: 10,
            queue_depth: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Log,
    /// 通过消息类工具把结果发回用户
    Tool,
}

/// [sink] 段：终止消息的投递方式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkSection {
    pub kind: SinkKind,
    /// kind = tool 时使用的工具名，如 telegram.telegram_send_message
    pub tool: Option<String>,
    /// 接收方参数名，取值为 session_id
    pub recipient_arg: String,
    pub text_arg: String,
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            kind: SinkKind::Log,
            tool: None,
            recipient_arg: "chat_id".to_string(),
            text_arg: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundKind {
    /// 标准输入逐行读取
    #[default]
    Stdin,
    /// 订阅消息提供方的 SSE 推送流
    Sse,
}

/// [inbound] 段：外部消息来源
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InboundSection {
    pub kind: InboundKind,
    /// kind = sse 时的事件流地址，如 http://localhost:8000/telegram_mcp_sse/
    pub url: Option<String>,
    /// 事件流断开后的重连间隔
    pub reconnect_delay_secs: u64,
}

impl Default for InboundSection {
    fn default() -> Self {
        Self {
            kind: InboundKind::Stdin,
            url: None,
            reconnect_delay_secs: 5,
        }
    }
}

impl AppConfig {
    /// 拒绝无法运行的配置
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.agent.max_steps == 0 {
            return Err(AgentError::Config("agent.max_steps must be at least 1".into()));
        }
        if self.agent.memory_top_k == 0 {
            return Err(AgentError::Config("agent.memory_top_k must be at least 1".into()));
        }
        let mut seen = HashSet::new();
        for p in &self.providers {
            if p.name.trim().is_empty() {
                return Err(AgentError::Config("provider name must not be empty".into()));
            }
            if p.name.contains(QUALIFIER) {
                return Err(AgentError::Config(format!(
                    "provider name '{}' must not contain '{QUALIFIER}'",
                    p.name
                )));
            }
            if !seen.insert(p.name.as_str()) {
                return Err(AgentError::Config(format!("duplicate provider name '{}'", p.name)));
            }
        }
        if self.sink.kind == SinkKind::Tool && self.sink.tool.is_none() {
            return Err(AgentError::Config("sink.kind = tool requires sink.tool".into()));
        }
        if self.inbound.kind == InboundKind::Sse
            && self.inbound.url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(AgentError::Config("inbound.kind = sse requires inbound.url".into()));
        }
        Ok(())
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            max_steps: self.agent.max_steps,
            memory_top_k: NonZeroUsize::new(self.agent.memory_top_k).unwrap_or(NonZeroUsize::MIN),
            memory_type_filter: self.agent.memory_type_filter.clone(),
            call_timeout: Duration::from_secs(self.tools.call_timeout_secs),
            deadline: self
                .agent
                .loop_deadline_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            strategy: self.agent.strategy,
        }
    }

    pub fn multiplexer_settings(&self) -> MultiplexerSettings {
        MultiplexerSettings {
            call_timeout: Duration::from_secs(self.tools.call_timeout_secs),
            connect_timeout: Duration::from_secs(self.tools.connect_timeout_secs),
            queue_depth: self.tools.queue_depth.max(1),
        }
    }

    pub fn completion_constraints(&self) -> CompletionConstraints {
        CompletionConstraints {
            temperature: self.llm.temperature,
            max_tokens: self.llm.max_tokens,
        }
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeouts.request)
    }

    pub fn inbound_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.inbound.reconnect_delay_secs.max(1))
    }
}

/// 从 config 目录加载配置，环境变量 ORCA__* 可覆盖
///
/// 1. 按顺序查找 config/default、../config/default、default（toml / yaml），找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ORCA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    'search: for name in default_names {
        for ext in ["toml", "yaml", "yml"] {
            if Path::new(&format!("{name}.{ext}")).exists() {
                builder = builder.add_source(config::File::with_name(name).required(false));
                break 'search;
            }
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ORCA")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
