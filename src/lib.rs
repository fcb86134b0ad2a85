//! Orca - 多工具提供方的智能体编排器
//!
//! 模块划分：
//! - **agent**: 运行时装配，每条外部消息一个执行循环
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、循环状态机、会话监管
//! - **inbound**: 外部消息入口（SSE 推送流）
//! - **llm**: 决策服务客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **mcp**: MCP over HTTP 的工具提供方实现
//! - **memory**: 会话内记忆与关键词检索
//! - **perception**: 基于规则的意图识别与实体抽取
//! - **react**: Planner、计划解析、回溯引用、执行循环
//! - **sink**: 终止消息投递
//! - **tools**: 提供方边界、会话多路复用、工具目录

pub mod agent;
pub mod config;
pub mod core;
pub mod inbound;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod observability;
pub mod perception;
pub mod react;
pub mod sink;
pub mod tools;

pub use agent::AgentRuntime;
pub use config::{load_config, AppConfig};
pub use react::{LoopEvent, LoopOutcome, LoopReport};
