//! Orca 命令行入口
//!
//! 消息来源由 `[inbound]` 决定：
//! - stdin：逐行读取 `<session_id>\t<text>`，或纯文本（会话 id 为 "cli"），结果打印到标准输出；
//! - sse：订阅消息提供方的事件流，chat_id 作为会话 id，回复经 `[sink]` 投递。
//!
//! 每条消息启动一个执行循环；同一会话的新请求会取消旧请求。Ctrl-C 退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use orca::config::InboundKind;
use orca::inbound::SseListener;
use orca::{load_config, observability, AgentRuntime, AppConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const DEFAULT_SESSION: &str = "cli";

fn split_line(line: &str) -> Option<(String, String)> {
    let line = line.trim_end();
    if line.trim().is_empty() {
        return None;
    }
    match line.split_once('\t') {
        Some((session, text)) if !session.trim().is_empty() && !text.trim().is_empty() => {
            Some((session.trim().to_string(), text.trim().to_string()))
        }
        _ => Some((DEFAULT_SESSION.to_string(), line.trim().to_string())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });

    let runtime = Arc::new(
        AgentRuntime::from_config(&cfg)
            .await
            .context("Failed to start agent runtime")?,
    );

    let served = match cfg.inbound.kind {
        InboundKind::Stdin => serve_stdin(&runtime).await,
        InboundKind::Sse => serve_events(&runtime, &cfg).await,
    };
    runtime.shutdown();
    served
}

async fn serve_stdin(runtime: &Arc<AgentRuntime>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let Some((session_id, text)) = split_line(&line) else {
                    continue;
                };
                let rt = runtime.clone();
                tasks.spawn(async move {
                    let outcome = rt.handle_message(&session_id, &text).await;
                    println!("[{session_id}] {}", outcome.user_message());
                });
            }
        }
    }
    while tasks.join_next().await.is_some() {}
    Ok(())
}

async fn serve_events(runtime: &Arc<AgentRuntime>, cfg: &AppConfig) -> anyhow::Result<()> {
    let url = cfg
        .inbound
        .url
        .clone()
        .context("inbound.url is required when inbound.kind = sse")?;
    let listener = SseListener::new(url, cfg.inbound_reconnect_delay())
        .context("Failed to build inbound event client")?;

    let (tx, mut rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let listen = tokio::spawn({
        let cancel = cancel.clone();
        async move { listener.run(tx, cancel).await }
    });

    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                let rt = runtime.clone();
                tasks.spawn(async move {
                    let outcome = rt.handle_message(&msg.chat_id, &msg.text).await;
                    tracing::info!(chat_id = %msg.chat_id, completed = outcome.is_completed(), "message handled");
                });
            }
            // 回收已结束的任务
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }
    cancel.cancel();
    let _ = listen.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_line() {
        assert_eq!(
            split_line("chat-7\tfind flights"),
            Some(("chat-7".to_string(), "find flights".to_string()))
        );
        assert_eq!(
            split_line("just text"),
            Some((DEFAULT_SESSION.to_string(), "just text".to_string()))
        );
        assert_eq!(split_line("   "), None);
    }
}
