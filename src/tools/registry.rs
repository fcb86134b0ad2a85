//! 工具注册表：跨提供方的工具目录
//!
//! discover 并发查询所有提供方，汇总为不可变的 ToolCatalog 快照；查询失败的提供方记为降级，
//! 不影响其余提供方。工具以 `provider.tool` 限定名唯一标识；若裸名只出现在一个提供方，
//! 也可用裸名引用。会话重建后可重新 discover，原子替换快照，运行中的循环继续持有旧快照。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;

use crate::tools::{ProviderError, RemoteTool, SessionMultiplexer, QUALIFIER};

/// 目录中的单个工具
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    /// `provider.tool`，全局唯一
    pub qualified_name: String,
    /// 向决策服务展示的名称：无冲突时为裸名，否则为限定名
    pub display_name: String,
    pub provider_id: String,
    /// 提供方侧的工具名
    pub remote_name: String,
    pub description: String,
    pub parameter_schema: Value,
}

impl ToolDescriptor {
    fn from_remote(provider: &str, tool: RemoteTool) -> Self {
        let schema = if tool.input_schema.is_object() {
            tool.input_schema
        } else {
            json!({"type": "object", "properties": {}})
        };
        Self {
            qualified_name: format!("{provider}{QUALIFIER}{}", tool.name),
            display_name: tool.name.clone(),
            provider_id: provider.to_string(),
            remote_name: tool.name,
            description: tool.description,
            parameter_schema: schema,
        }
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.parameter_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn required_parameters(&self) -> Vec<String> {
        self.parameter_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|req| {
                req.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 唯一参数为 `input` 的工具
    pub fn wants_single_input(&self) -> bool {
        self.parameter_names() == ["input"]
    }

    /// 唯一参数为 `input` 时，把参数整体包进 `input`（已包好的不再包）
    pub fn prepare_arguments(&self, arguments: Value) -> Value {
        if !self.wants_single_input() {
            return arguments;
        }
        match arguments {
            Value::Object(map) if map.len() == 1 && map.contains_key("input") => Value::Object(map),
            other => json!({ "input": other }),
        }
    }
}

/// discover 时不可用的提供方
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedProvider {
    pub provider: String,
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown tool: {0}")]
    NotFound(String),

    #[error("ambiguous tool name '{name}', use one of: {}", .candidates.join(", "))]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },
}

/// 不可变的工具目录快照
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
    degraded: Vec<DegradedProvider>,
    index: HashMap<String, usize>,
    ambiguous: HashMap<String, Vec<String>>,
}

impl ToolCatalog {
    /// 由各提供方的 tools/list 结果构建（顺序即提供方顺序）
    pub fn build(listings: Vec<(String, Result<Vec<RemoteTool>, ProviderError>)>) -> Self {
        let mut tools: Vec<ToolDescriptor> = Vec::new();
        let mut degraded = Vec::new();
        for (provider, listing) in listings {
            match listing {
                Ok(remote) => {
                    for tool in remote {
                        let desc = ToolDescriptor::from_remote(&provider, tool);
                        if tools.iter().any(|t| t.qualified_name == desc.qualified_name) {
                            tracing::warn!(tool = %desc.qualified_name, "duplicate tool in listing ignored");
                            continue;
                        }
                        tools.push(desc);
                    }
                }
                Err(e) => degraded.push(DegradedProvider {
                    provider,
                    reason: e.to_string(),
                }),
            }
        }

        let mut by_remote: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, t) in tools.iter().enumerate() {
            by_remote.entry(t.remote_name.clone()).or_default().push(i);
        }
        let mut ambiguous = HashMap::new();
        for (name, owners) in &by_remote {
            if owners.len() > 1 {
                for &i in owners {
                    tools[i].display_name = tools[i].qualified_name.clone();
                }
                ambiguous.insert(
                    name.clone(),
                    owners.iter().map(|&i| tools[i].qualified_name.clone()).collect(),
                );
            }
        }

        let mut index = HashMap::new();
        for (i, t) in tools.iter().enumerate() {
            index.insert(t.qualified_name.clone(), i);
            index.insert(t.display_name.clone(), i);
        }
        Self {
            tools,
            degraded,
            index,
            ambiguous,
        }
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn degraded(&self) -> &[DegradedProvider] {
        &self.degraded
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 按展示名或限定名查找；大小写不敏感作为兜底
    pub fn resolve(&self, name: &str) -> Result<&ToolDescriptor, ResolveError> {
        let name = name.trim();
        if let Some(&i) = self.index.get(name) {
            return Ok(&self.tools[i]);
        }
        if let Some(candidates) = self.ambiguous.get(name) {
            return Err(ResolveError::Ambiguous {
                name: name.to_string(),
                candidates: candidates.clone(),
            });
        }
        let lower = name.to_lowercase();
        let mut hits = self.tools.iter().filter(|t| {
            t.display_name.to_lowercase() == lower || t.qualified_name.to_lowercase() == lower
        });
        match (hits.next(), hits.next()) {
            (Some(t), None) => Ok(t),
            _ => Err(ResolveError::NotFound(name.to_string())),
        }
    }
}

/// 持有当前目录快照，并负责（重新）发现
pub struct ToolRegistry {
    mux: Arc<SessionMultiplexer>,
    current: RwLock<Arc<ToolCatalog>>,
}

impl ToolRegistry {
    pub fn new(mux: Arc<SessionMultiplexer>) -> Self {
        Self {
            mux,
            current: RwLock::new(Arc::new(ToolCatalog::default())),
        }
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<ToolCatalog> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 并发查询全部提供方并发布新快照；单个提供方失败只记为降级
    pub async fn discover(&self) -> Arc<ToolCatalog> {
        let timeout = self.mux.default_timeout();
        let listings = join_all(self.mux.providers().iter().map(|provider| async move {
            let listing = match tokio::time::timeout(timeout, self.mux.list_tools(provider)).await {
                Ok(res) => res,
                Err(_) => Err(ProviderError::Connection(format!(
                    "discovery timed out after {timeout:?}"
                ))),
            };
            (provider.clone(), listing)
        }))
        .await;

        let catalog = Arc::new(ToolCatalog::build(listings));
        for d in catalog.degraded() {
            tracing::warn!(provider = %d.provider, reason = %d.reason, "provider degraded during discovery");
        }
        tracing::info!(
            tools = catalog.len(),
            degraded = catalog.degraded().len(),
            "tool catalog published"
        );
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = catalog.clone();
        catalog
    }

    /// 收到会话重建事件时重新 discover
    ///
    /// 已排队的事件合并为一次刷新。discover 自身的重连不广播，因此刷新不会触发新的刷新。
    pub fn spawn_refresh_on_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut events = self.mux.subscribe_reconnects();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(provider) => {
                        let coalesced = drain_pending(&mut events);
                        tracing::info!(%provider, coalesced, "refreshing tool catalog after reconnect");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        let coalesced = drain_pending(&mut events);
                        tracing::info!(skipped, coalesced, "refreshing tool catalog after missed reconnects");
                    }
                    Err(RecvError::Closed) => break,
                }
                registry.discover().await;
            }
        })
    }
}

fn drain_pending(events: &mut tokio::sync::broadcast::Receiver<String>) -> usize {
    let mut n = 0;
    loop {
        match events.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => n += 1,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return n,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::tools::{
        MultiplexerSettings, ProviderConnector, ProviderEndpoint, ProviderSession,
        RemoteCallOutcome,
    };

    fn tool(name: &str, props: &[&str]) -> RemoteTool {
        let properties: serde_json::Map<String, Value> = props
            .iter()
            .map(|p| (p.to_string(), json!({"type": "string"})))
            .collect();
        RemoteTool {
            name: name.into(),
            description: format!("{name} tool"),
            input_schema: json!({"type": "object", "properties": properties, "required": props}),
        }
    }

    fn catalog() -> ToolCatalog {
        ToolCatalog::build(vec![
            ("serpapi".into(), Ok(vec![tool("search", &["query"]), tool("status", &[])])),
            ("gdrive".into(), Ok(vec![tool("create_sheet", &["title"]), tool("status", &[])])),
            ("telegram".into(), Err(ProviderError::Connection("refused".into()))),
        ])
    }

    #[test]
    fn test_unique_names_display_bare() {
        let c = catalog();
        let search = c.resolve("search").unwrap();
        assert_eq!(search.qualified_name, "serpapi.search");
        assert_eq!(search.display_name, "search");
        assert_eq!(c.resolve("serpapi.search").unwrap(), search);
    }

    #[test]
    fn test_collisions_use_qualified_display() {
        let c = catalog();
        let a = c.resolve("serpapi.status").unwrap();
        let b = c.resolve("gdrive.status").unwrap();
        assert_eq!(a.display_name, "serpapi.status");
        assert_ne!(a.qualified_name, b.qualified_name);
        assert!(matches!(c.resolve("status"), Err(ResolveError::Ambiguous { .. })));
    }

    #[test]
    fn test_degraded_provider_recorded() {
        let c = catalog();
        assert_eq!(c.len(), 4);
        assert_eq!(c.degraded().len(), 1);
        assert_eq!(c.degraded()[0].provider, "telegram");
        assert!(matches!(c.resolve("send_message"), Err(ResolveError::NotFound(_))));
    }

    #[test]
    fn test_case_insensitive_fallback() {
        let c = catalog();
        assert_eq!(c.resolve("Create_Sheet").unwrap().provider_id, "gdrive");
    }

    #[test]
    fn test_single_input_wrapping() {
        let c = ToolCatalog::build(vec![("x".into(), Ok(vec![tool("extract", &["input"])]))]);
        let d = c.resolve("extract").unwrap();
        assert!(d.wants_single_input());
        assert_eq!(
            d.prepare_arguments(json!({"url": "https://a"})),
            json!({"input": {"url": "https://a"}})
        );
        assert_eq!(
            d.prepare_arguments(json!({"input": "already"})),
            json!({"input": "already"})
        );
    }

    #[test]
    fn test_required_parameters() {
        let c = catalog();
        assert_eq!(c.resolve("search").unwrap().required_parameters(), vec!["query"]);
    }

    /// 第 n 次连接得到的会话列出 `echo_v{n}`；第 0 代会话的调用以连接错误失败
    struct GenerationConnector {
        connects: Arc<AtomicUsize>,
        listing_fails: bool,
    }

    struct GenerationSession {
        generation: usize,
        listing_fails: bool,
    }

    #[async_trait]
    impl ProviderConnector for GenerationConnector {
        async fn connect(&self, _: &ProviderEndpoint) -> Result<Box<dyn ProviderSession>, ProviderError> {
            let generation = self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(GenerationSession {
                generation,
                listing_fails: self.listing_fails,
            }))
        }
    }

    #[async_trait]
    impl ProviderSession for GenerationSession {
        async fn list_tools(&mut self) -> Result<Vec<RemoteTool>, ProviderError> {
            if self.listing_fails {
                return Err(ProviderError::Connection("server returned 500".into()));
            }
            Ok(vec![tool(&format!("echo_v{}", self.generation), &[])])
        }

        async fn call(&mut self, _tool: &str, _arguments: Value) -> Result<RemoteCallOutcome, ProviderError> {
            if self.generation == 0 {
                return Err(ProviderError::Connection("reset by peer".into()));
            }
            Ok(RemoteCallOutcome::text("ok"))
        }
    }

    fn live_registry(listing_fails: bool) -> (Arc<ToolRegistry>, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let mux = Arc::new(SessionMultiplexer::new(
            &[ProviderEndpoint::new("alpha", "mem://alpha")],
            Arc::new(GenerationConnector {
                connects: connects.clone(),
                listing_fails,
            }),
            MultiplexerSettings::default(),
        ));
        (Arc::new(ToolRegistry::new(mux)), connects)
    }

    #[tokio::test]
    async fn test_failing_listing_does_not_refresh_itself() {
        let (registry, connects) = live_registry(true);
        let refresh = registry.spawn_refresh_on_reconnect();

        let catalog = registry.discover().await;
        assert_eq!(catalog.degraded().len(), 1);
        // 首次连接 + 列举失败后的一次重连
        assert_eq!(connects.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        refresh.abort();
    }

    #[tokio::test]
    async fn test_call_reconnect_refreshes_catalog_once() {
        let (registry, connects) = live_registry(false);
        let refresh = registry.spawn_refresh_on_reconnect();
        registry.discover().await;
        assert!(registry.snapshot().resolve("echo_v0").is_ok());

        let res = registry.mux.invoke("alpha.echo_v0", json!({}), None).await;
        assert!(!res.ok);
        assert!(res.error.unwrap().retryable);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while registry.snapshot().resolve("echo_v1").is_err() {
            assert!(tokio::time::Instant::now() < deadline, "catalog was not refreshed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        refresh.abort();
    }
}
