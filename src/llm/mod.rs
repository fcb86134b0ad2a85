//! LLM 层：决策服务客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{CompletionConstraints, LlmClient, LlmError};

use crate::config::{AppConfig, LlmProvider};

/// 按配置创建决策服务客户端；openai 缺少 API Key 时回退到 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    match cfg.llm.provider {
        LlmProvider::OpenAi => {
            let api_key = cfg
                .llm
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .filter(|k| !k.trim().is_empty());
            match api_key {
                Some(key) => {
                    tracing::info!(model = %cfg.llm.model, "using OpenAI-compatible decision service");
                    Arc::new(OpenAiClient::new(
                        cfg.llm.base_url.as_deref(),
                        &cfg.llm.model,
                        &key,
                    ))
                }
                None => {
                    tracing::warn!("OPENAI_API_KEY not set, falling back to mock decision service");
                    Arc::new(MockLlmClient::new())
                }
            }
        }
        LlmProvider::Mock => Arc::new(MockLlmClient::new()),
    }
}
