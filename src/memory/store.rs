//! 会话内记忆：按类型标签与关键词重叠检索
//!
//! 每个 AgentContext 独占一个 MemoryStore，循环结束即丢弃；只追加，不修改已有条目。

use std::collections::HashSet;
use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// 内置类型标签
pub mod tags {
    pub const USER_REQUEST: &str = "user_request";
    pub const TOOL_OUTPUT: &str = "tool_output";
    pub const TOOL_ERROR: &str = "tool_error";
    pub const PLAN_NOTE: &str = "plan_note";
}

/// 重叠分数之外的时近性加权（< 1，不会压过一个关键词的差距）
const RECENCY_WEIGHT: f64 = 0.5;

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
pub(crate) fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryItem {
    pub id: String,
    pub type_tag: String,
    pub content: String,
    /// 产生该条目的步骤（0 起）；用户请求与规划提示为 None
    pub source_step: Option<usize>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    keywords: HashSet<String>,
}

impl MemoryItem {
    pub fn new(type_tag: &str, content: impl Into<String>, source_step: Option<usize>) -> Self {
        let content = content.into();
        Self {
            id: Uuid::new_v4().to_string(),
            type_tag: type_tag.to_string(),
            keywords: tokenize_lower(&content),
            content,
            source_step,
            created_at: Utc::now(),
        }
    }

    pub fn keywords(&self) -> &HashSet<String> {
        &self.keywords
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Vec<MemoryItem>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, item: MemoryItem) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[MemoryItem] {
        &self.items
    }

    /// 返回至多 top_k 条：先按类型过滤，再按关键词重叠排序，时近性打破平局
    pub fn query(
        &self,
        text: &str,
        top_k: NonZeroUsize,
        type_filter: Option<&str>,
    ) -> Vec<MemoryItem> {
        let query_tokens = tokenize_lower(text);
        let n = self.items.len().max(1) as f64;
        let mut scored: Vec<(f64, usize)> = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| type_filter.map_or(true, |t| item.type_tag == t))
            .map(|(pos, item)| {
                let overlap = query_tokens.intersection(&item.keywords).count() as f64;
                let recency = RECENCY_WEIGHT * (pos as f64 + 1.0) / n;
                (overlap + recency, pos)
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));
        scored
            .into_iter()
            .take(top_k.get())
            .map(|(_, pos)| self.items[pos].clone())
            .collect()
    }

    /// 拼成提示中的 Memory 段落
    pub fn to_prompt_section(items: &[MemoryItem]) -> String {
        if items.is_empty() {
            return String::new();
        }
        items
            .iter()
            .map(|i| format!("- [{}] {}", i.type_tag, i.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_query_never_exceeds_top_k() {
        let mut store = MemoryStore::new();
        for i in 0..10 {
            store.append(MemoryItem::new(tags::TOOL_OUTPUT, format!("result {i}"), Some(i)));
        }
        assert_eq!(store.query("result", k(3), None).len(), 3);
        assert_eq!(store.query("anything", k(50), None).len(), 10);
    }

    #[test]
    fn test_keyword_overlap_ranks_first() {
        let mut store = MemoryStore::new();
        store.append(MemoryItem::new(tags::TOOL_OUTPUT, "weather in Paris is sunny", Some(0)));
        store.append(MemoryItem::new(tags::TOOL_OUTPUT, "stock prices fell", Some(1)));
        let hits = store.query("what is the weather in paris", k(1), None);
        assert_eq!(hits[0].source_step, Some(0));
    }

    #[test]
    fn test_recency_breaks_ties() {
        let mut store = MemoryStore::new();
        store.append(MemoryItem::new(tags::TOOL_OUTPUT, "alpha", Some(0)));
        store.append(MemoryItem::new(tags::TOOL_OUTPUT, "beta", Some(1)));
        let hits = store.query("unrelated", k(2), None);
        assert_eq!(hits[0].content, "beta");
        assert_eq!(hits[1].content, "alpha");
    }

    #[test]
    fn test_type_filter() {
        let mut store = MemoryStore::new();
        store.append(MemoryItem::new(tags::USER_REQUEST, "find news", None));
        store.append(MemoryItem::new(tags::TOOL_ERROR, "search failed", Some(0)));
        store.append(MemoryItem::new(tags::TOOL_OUTPUT, "news list", Some(1)));
        let hits = store.query("news", k(5), Some(tags::TOOL_OUTPUT));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].type_tag, tags::TOOL_OUTPUT);
    }

    #[test]
    fn test_tokenize_splits_punctuation() {
        let t = tokenize_lower("search(query=\"Rust async\") → ok");
        assert!(t.contains("search") && t.contains("rust") && t.contains("async"));
        assert!(!t.contains("→"));
    }
}
