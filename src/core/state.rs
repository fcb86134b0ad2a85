//! 执行循环状态机
//!
//! Init → Perceiving → Planning → Executing → Deciding → {Planning | Completed | Failed | Exhausted}。
//! 任意非终态都可转入 Failed（决策服务失败、取消）或 Exhausted（截止时间）；终态不可再转移。

use serde::Serialize;

/// 循环阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Init,
    Perceiving,
    Planning,
    Executing,
    Deciding,
    Completed,
    Failed,
    Exhausted,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopState::Completed | LoopState::Failed | LoopState::Exhausted
        )
    }

    pub fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) | (_, Exhausted) => true,
            (Init, Perceiving)
            | (Perceiving, Planning)
            | (Planning, Executing)
            | (Executing, Deciding)
            | (Deciding, Planning)
            | (Deciding, Completed) => true,
            _ => false,
        }
    }

    /// 对外可见的会话状态
    pub fn status(self) -> AgentStatus {
        match self {
            LoopState::Completed => AgentStatus::Completed,
            LoopState::Failed => AgentStatus::Failed,
            LoopState::Exhausted => AgentStatus::Exhausted,
            _ => AgentStatus::Running,
        }
    }
}

/// AgentContext 的粗粒度状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Completed,
    Failed,
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            LoopState::Init,
            LoopState::Perceiving,
            LoopState::Planning,
            LoopState::Executing,
            LoopState::Deciding,
            LoopState::Planning,
            LoopState::Executing,
            LoopState::Deciding,
            LoopState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for s in [LoopState::Completed, LoopState::Failed, LoopState::Exhausted] {
            assert!(s.is_terminal());
            assert!(!s.can_transition_to(LoopState::Planning));
            assert!(!s.can_transition_to(LoopState::Failed));
        }
    }

    #[test]
    fn test_perceiving_runs_once() {
        assert!(!LoopState::Deciding.can_transition_to(LoopState::Perceiving));
        assert!(!LoopState::Planning.can_transition_to(LoopState::Completed));
    }

    #[test]
    fn test_status_projection() {
        assert_eq!(LoopState::Executing.status(), AgentStatus::Running);
        assert_eq!(LoopState::Exhausted.status(), AgentStatus::Exhausted);
    }
}
