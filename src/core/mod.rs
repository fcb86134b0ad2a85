//! 核心层：错误与恢复、循环状态机、会话监管

pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{AgentError, ErrorInfo, ErrorKind, RecoveryAction};
pub use recovery::{RecoveryEngine, MAX_ATTEMPTS_PER_ACTION};
pub use session_supervisor::{LoopLease, SessionSupervisor};
pub use state::{AgentStatus, LoopState};
