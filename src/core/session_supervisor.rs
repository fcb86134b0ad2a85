//! 会话监管：每个 session_id 一个取消令牌
//!
//! 同一会话的新请求到达时取消仍在运行的旧循环（请求被替代）；shutdown 时取消全部。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// 运行中循环的登记凭据，finish 时用于确认仍是同一代
#[derive(Debug, Clone)]
pub struct LoopLease {
    pub session_id: String,
    pub generation: u64,
    pub token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct SessionSupervisor {
    root: CancellationToken,
    active: Mutex<HashMap<String, (u64, CancellationToken)>>,
    next_generation: AtomicU64,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, (u64, CancellationToken)>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 登记一个新循环；若该会话已有运行中的循环则先取消它
    pub fn begin(&self, session_id: &str) -> LoopLease {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = self.root.child_token();
        let previous = self
            .active()
            .insert(session_id.to_string(), (generation, token.clone()));
        if let Some((_, old)) = previous {
            tracing::info!(session_id, "superseding running loop");
            old.cancel();
        }
        LoopLease {
            session_id: session_id.to_string(),
            generation,
            token,
        }
    }

    /// 循环结束后注销（仅当登记的仍是同一代时）
    pub fn finish(&self, lease: &LoopLease) {
        let mut active = self.active();
        if matches!(active.get(&lease.session_id), Some((g, _)) if *g == lease.generation) {
            active.remove(&lease.session_id);
        }
    }

    /// 取消指定会话的运行中循环；返回是否存在
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.active().remove(session_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.active().contains_key(session_id)
    }

    /// 取消全部循环
    pub fn shutdown(&self) {
        self.root.cancel();
        self.active().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_supersedes_previous() {
        let sup = SessionSupervisor::new();
        let first = sup.begin("chat-1");
        let second = sup.begin("chat-1");
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        sup.finish(&first);
        assert!(sup.is_running("chat-1"));
        sup.finish(&second);
        assert!(!sup.is_running("chat-1"));
    }

    #[test]
    fn test_sessions_are_independent() {
        let sup = SessionSupervisor::new();
        let a = sup.begin("a");
        let b = sup.begin("b");
        assert!(sup.cancel("a"));
        assert!(a.token.is_cancelled());
        assert!(!b.token.is_cancelled());
        assert!(!sup.cancel("a"));
    }

    #[test]
    fn test_shutdown_cancels_all() {
        let sup = SessionSupervisor::new();
        let a = sup.begin("a");
        let b = sup.begin("b");
        sup.shutdown();
        assert!(a.token.is_cancelled() && b.token.is_cancelled());
    }
}
