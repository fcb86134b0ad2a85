//! 记忆层：单次会话内的工具输出与规划提示

pub mod store;

pub use store::{tags, MemoryItem, MemoryStore};
