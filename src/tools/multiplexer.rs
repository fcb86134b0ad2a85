//! 会话多路复用器
//!
//! 每个提供方一个工作任务：独占该提供方的会话（懒连接），通过有界队列串行处理调用，
//! 因而同一连接上不会出现交错写入。调用超时只取消该次调用；调用方放弃等待时
//! （其 future 被 drop）工作任务中止正在进行的请求。连接断开时重连一次；只有调用路径上的
//! 重连会广播事件供注册表刷新工具目录，列举工具时的重连不广播，否则刷新会不断触发自身。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::{ErrorInfo, ErrorKind};
use crate::tools::{
    ProviderConnector, ProviderEndpoint, ProviderError, ProviderSession, RemoteTool,
    ToolCallResult,
};

/// 限定名分隔符：`provider.tool`
pub const QUALIFIER: char = '.';

#[derive(Debug, Clone)]
pub struct MultiplexerSettings {
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
    pub queue_depth: usize,
}

impl Default for MultiplexerSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            queue_depth: 32,
        }
    }
}

enum Job {
    ListTools {
        reply: oneshot::Sender<Result<Vec<RemoteTool>, ProviderError>>,
    },
    Call {
        tool: String,
        arguments: Value,
        timeout: Duration,
        reply: oneshot::Sender<ToolCallResult>,
    },
}

pub struct SessionMultiplexer {
    workers: HashMap<String, mpsc::Sender<Job>>,
    providers: Vec<String>,
    settings: MultiplexerSettings,
    reconnects: broadcast::Sender<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionMultiplexer {
    /// 为每个提供方启动工作任务（须在 tokio 运行时内调用）；连接推迟到首次使用
    pub fn new(
        endpoints: &[ProviderEndpoint],
        connector: Arc<dyn ProviderConnector>,
        settings: MultiplexerSettings,
    ) -> Self {
        let (reconnects, _) = broadcast::channel(16);
        let mut workers = HashMap::new();
        let mut providers = Vec::new();
        let mut tasks = Vec::new();
        for endpoint in endpoints {
            if workers.contains_key(&endpoint.name) {
                tracing::warn!(provider = %endpoint.name, "duplicate provider ignored");
                continue;
            }
            let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
            let worker = ProviderWorker {
                endpoint: endpoint.clone(),
                connector: connector.clone(),
                session: None,
                connect_timeout: settings.connect_timeout,
                reconnects: reconnects.clone(),
                ever_connected: false,
            };
            tasks.push(tokio::spawn(worker.run(rx)));
            workers.insert(endpoint.name.clone(), tx);
            providers.push(endpoint.name.clone());
        }
        Self {
            workers,
            providers,
            settings,
            reconnects,
            tasks: Mutex::new(tasks),
        }
    }

    /// 配置顺序的提供方名称
    pub fn providers(&self) -> &[String] {
        &self.providers
    }

    pub fn default_timeout(&self) -> Duration {
        self.settings.call_timeout
    }

    /// 订阅「会话已重建」事件（负载为提供方名称）
    pub fn subscribe_reconnects(&self) -> broadcast::Receiver<String> {
        self.reconnects.subscribe()
    }

    /// 列出某提供方的工具（必要时先建立会话）
    pub async fn list_tools(&self, provider: &str) -> Result<Vec<RemoteTool>, ProviderError> {
        let tx = self
            .workers
            .get(provider)
            .ok_or_else(|| ProviderError::Rejected(format!("unknown provider: {provider}")))?;
        let (reply, rx) = oneshot::channel();
        tx.send(Job::ListTools { reply })
            .await
            .map_err(|_| ProviderError::Connection("provider worker stopped".into()))?;
        rx.await
            .map_err(|_| ProviderError::Connection("provider worker stopped".into()))?
    }

    /// 按限定名 `provider.tool` 调用工具；失败以 ToolCallResult 的 error 返回，不会 panic
    pub async fn invoke(
        &self,
        qualified_name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> ToolCallResult {
        let Some((provider, tool)) = qualified_name.split_once(QUALIFIER) else {
            return ToolCallResult::failure(ErrorInfo::new(
                ErrorKind::ToolRejected,
                format!("unknown tool: {qualified_name}"),
            ));
        };
        let Some(tx) = self.workers.get(provider) else {
            return ToolCallResult::failure(ErrorInfo::new(
                ErrorKind::ToolRejected,
                format!("unknown provider: {provider}"),
            ));
        };
        let (reply, rx) = oneshot::channel();
        let job = Job::Call {
            tool: tool.to_string(),
            arguments,
            timeout: timeout.unwrap_or(self.settings.call_timeout),
            reply,
        };
        if tx.send(job).await.is_err() {
            return ToolCallResult::failure(ErrorInfo::new(
                ErrorKind::ToolUnavailable,
                format!("{provider}: provider worker stopped"),
            ));
        }
        rx.await.unwrap_or_else(|_| {
            ToolCallResult::failure(ErrorInfo::new(
                ErrorKind::ToolUnavailable,
                format!("{provider}: provider worker stopped"),
            ))
        })
    }

    /// 关闭全部工作任务（会话随之 close）
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

struct ProviderWorker {
    endpoint: ProviderEndpoint,
    connector: Arc<dyn ProviderConnector>,
    session: Option<Box<dyn ProviderSession>>,
    connect_timeout: Duration,
    reconnects: broadcast::Sender<String>,
    ever_connected: bool,
}

impl ProviderWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Job>) {
        while let Some(job) = rx.recv().await {
            match job {
                Job::ListTools { reply } => {
                    let res = self.list_tools().await;
                    let _ = reply.send(res);
                }
                Job::Call {
                    tool,
                    arguments,
                    timeout,
                    mut reply,
                } => {
                    let result = tokio::select! {
                        res = self.call(&tool, arguments, timeout) => Some(res),
                        _ = reply.closed() => None,
                    };
                    match result {
                        Some(res) => {
                            let _ = reply.send(res);
                        }
                        None => {
                            tracing::warn!(provider = %self.endpoint.name, tool = %tool, "call abandoned by caller");
                        }
                    }
                }
            }
        }
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        tracing::debug!(provider = %self.endpoint.name, "provider worker stopped");
    }

    /// announce 为 true 且此前连过时广播重连事件
    async fn connect(&mut self, announce: bool) -> Result<(), ProviderError> {
        let session = tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(&self.endpoint),
        )
        .await
        .map_err(|_| {
            ProviderError::Connection(format!("connect timed out after {:?}", self.connect_timeout))
        })??;
        self.session = Some(session);
        if self.ever_connected {
            tracing::info!(provider = %self.endpoint.name, announce, "provider session re-established");
            if announce {
                let _ = self.reconnects.send(self.endpoint.name.clone());
            }
        }
        self.ever_connected = true;
        Ok(())
    }

    async fn drop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }

    async fn ensure_session(
        &mut self,
        announce: bool,
    ) -> Result<&mut Box<dyn ProviderSession>, ProviderError> {
        if self.session.is_none() {
            self.connect(announce).await?;
        }
        self.session
            .as_mut()
            .ok_or_else(|| ProviderError::Connection("no session".into()))
    }

    async fn list_tools(&mut self) -> Result<Vec<RemoteTool>, ProviderError> {
        let first = self.ensure_session(false).await?.list_tools().await;
        match first {
            Err(ProviderError::Connection(reason)) => {
                tracing::warn!(provider = %self.endpoint.name, %reason, "listing failed, reconnecting once");
                self.drop_session().await;
                self.ensure_session(false).await?.list_tools().await
            }
            other => other,
        }
    }

    async fn call(&mut self, tool: &str, arguments: Value, timeout: Duration) -> ToolCallResult {
        let started = Instant::now();
        let args_preview = args_preview(&arguments);
        let provider = self.endpoint.name.clone();

        let (result, outcome) = match self.ensure_session(true).await {
            Err(e) => (
                ToolCallResult::failure(ErrorInfo::new(
                    ErrorKind::ToolUnavailable,
                    format!("{provider}: {e}"),
                )),
                "unavailable",
            ),
            Ok(session) => match tokio::time::timeout(timeout, session.call(tool, arguments)).await {
                Ok(Ok(outcome)) => {
                    let res = ToolCallResult::from_outcome(outcome);
                    let label = if res.ok { "ok" } else { "rejected" };
                    (res, label)
                }
                Ok(Err(ProviderError::Connection(reason))) => {
                    self.drop_session().await;
                    match self.connect(true).await {
                        Ok(()) => (
                            ToolCallResult::failure(
                                ErrorInfo::new(
                                    ErrorKind::ToolUnavailable,
                                    format!("{provider}: connection lost ({reason}); session re-established"),
                                )
                                .retryable(),
                            ),
                            "reconnected",
                        ),
                        Err(e) => (
                            ToolCallResult::failure(ErrorInfo::new(
                                ErrorKind::ToolUnavailable,
                                format!("{provider}: connection lost ({reason}); reconnect failed: {e}"),
                            )),
                            "unavailable",
                        ),
                    }
                }
                Ok(Err(e)) => (
                    ToolCallResult::failure(ErrorInfo::new(
                        ErrorKind::ToolRejected,
                        format!("{provider}.{tool}: {e}"),
                    )),
                    "rejected",
                ),
                Err(_) => (
                    ToolCallResult::failure(ErrorInfo::new(
                        ErrorKind::ToolTimeout,
                        format!("{provider}.{tool} timed out after {timeout:?}"),
                    )),
                    "timeout",
                ),
            },
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "provider": provider,
            "tool": tool,
            "ok": result.ok,
            "outcome": outcome,
            "duration_ms": started.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::tools::RemoteCallOutcome;

    /// fail_first_call 时，首个会话的第一次调用返回 Connection 错误
    struct FlakyConnector {
        connects: Arc<AtomicUsize>,
        fail_first_call: bool,
        refuse_reconnect: bool,
        delay: Duration,
    }

    struct FlakySession {
        generation: usize,
        fail_next: bool,
        delay: Duration,
    }

    #[async_trait]
    impl ProviderConnector for FlakyConnector {
        async fn connect(
            &self,
            _endpoint: &ProviderEndpoint,
        ) -> Result<Box<dyn ProviderSession>, ProviderError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n > 0 && self.refuse_reconnect {
                return Err(ProviderError::Connection("refused".into()));
            }
            Ok(Box::new(FlakySession {
                generation: n,
                fail_next: self.fail_first_call && n == 0,
                delay: self.delay,
            }))
        }
    }

    #[async_trait]
    impl ProviderSession for FlakySession {
        async fn list_tools(&mut self) -> Result<Vec<RemoteTool>, ProviderError> {
            Ok(vec![RemoteTool {
                name: "echo".into(),
                description: "Echo".into(),
                input_schema: json!({"type": "object"}),
            }])
        }

        async fn call(&mut self, tool: &str, arguments: Value) -> Result<RemoteCallOutcome, ProviderError> {
            tokio::time::sleep(self.delay).await;
            if std::mem::take(&mut self.fail_next) {
                return Err(ProviderError::Connection("reset by peer".into()));
            }
            Ok(RemoteCallOutcome::structured(
                json!({"tool": tool, "args": arguments, "generation": self.generation}),
            ))
        }
    }

    fn mux(connector: FlakyConnector) -> SessionMultiplexer {
        SessionMultiplexer::new(
            &[ProviderEndpoint::new("alpha", "mem://alpha")],
            Arc::new(connector),
            MultiplexerSettings::default(),
        )
    }

    fn connector() -> (FlakyConnector, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        (
            FlakyConnector {
                connects: connects.clone(),
                fail_first_call: false,
                refuse_reconnect: false,
                delay: Duration::ZERO,
            },
            connects,
        )
    }

    #[tokio::test]
    async fn test_session_is_reused_across_calls() {
        let (c, connects) = connector();
        let mux = mux(c);
        for i in 0..3 {
            let res = mux.invoke("alpha.echo", json!({"i": i}), None).await;
            assert!(res.ok);
        }
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broken_connection_reconnects_once_and_broadcasts() {
        let (mut c, connects) = connector();
        c.fail_first_call = true;
        let mux = mux(c);
        let mut events = mux.subscribe_reconnects();

        let res = mux.invoke("alpha.echo", json!({}), None).await;
        assert!(!res.ok);
        let err = res.error.unwrap();
        assert_eq!(err.kind, ErrorKind::ToolUnavailable);
        assert!(err.retryable);
        assert_eq!(events.recv().await.unwrap(), "alpha");

        let retry = mux.invoke("alpha.echo", json!({}), None).await;
        assert!(retry.ok);
        assert_eq!(retry.value.unwrap()["generation"], 1);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_reconnect_is_not_retryable() {
        let (mut c, _) = connector();
        c.fail_first_call = true;
        c.refuse_reconnect = true;
        let mux = mux(c);
        let res = mux.invoke("alpha.echo", json!({}), None).await;
        let err = res.error.unwrap();
        assert_eq!(err.kind, ErrorKind::ToolUnavailable);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_timeout_cancels_only_that_call() {
        let (mut c, connects) = connector();
        c.delay = Duration::from_millis(200);
        let mux = mux(c);
        let slow = mux
            .invoke("alpha.echo", json!({}), Some(Duration::from_millis(20)))
            .await;
        assert_eq!(slow.error_kind(), Some(ErrorKind::ToolTimeout));

        let ok = mux.invoke("alpha.echo", json!({}), Some(Duration::from_secs(2))).await;
        assert!(ok.ok);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_rejected() {
        let (c, _) = connector();
        let mux = mux(c);
        let res = mux.invoke("beta.echo", json!({}), None).await;
        assert_eq!(res.error_kind(), Some(ErrorKind::ToolRejected));
        let res = mux.invoke("echo", json!({}), None).await;
        assert_eq!(res.error_kind(), Some(ErrorKind::ToolRejected));
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_serialized_per_provider() {
        let (mut c, connects) = connector();
        c.delay = Duration::from_millis(10);
        let mux = Arc::new(mux(c));
        let mut handles = Vec::new();
        for i in 0..8 {
            let mux = mux.clone();
            handles.push(tokio::spawn(async move {
                mux.invoke("alpha.echo", json!({ "i": i }), None).await
            }));
        }
        for h in handles {
            let res = h.await.unwrap();
            assert!(res.ok);
        }
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }
}
