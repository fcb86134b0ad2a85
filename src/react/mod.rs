//! 认知层：规划、计划解析、回溯引用、执行循环

pub mod context;
pub mod events;
pub mod loop_;
pub mod parser;
pub mod planner;
pub mod reference;

pub use context::{Action, AgentContext, StepRecord};
pub use events::LoopEvent;
pub use loop_::{partial_summary, ExecutionLoop, LoopOutcome, LoopReport, LoopSettings, Strategy};
pub use parser::{parse_plan, ParsedPlan, PlanEntry, PlanError};
pub use planner::{PlanRequest, Planner};
pub use reference::{resolve_arguments, ArgValue, BackReference, PathSegment, ReferenceError};
