//! 感知：对原始请求做确定性规则分析
//!
//! 得到意图标签、工具提示（候选工具的限定名）与抽取出的实体。不调用决策服务；
//! 同一输入与同一目录总是得到同一结果。提示为空表示没有把握，规划时提供整个目录。

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::memory::store::tokenize_lower;
use crate::tools::ToolCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Search,
    Extract,
    Spreadsheet,
    Share,
    Messaging,
    General,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Intent::Search => "search",
            Intent::Extract => "extract",
            Intent::Spreadsheet => "spreadsheet",
            Intent::Share => "share",
            Intent::Messaging => "messaging",
            Intent::General => "general",
        };
        f.write_str(s)
    }
}

struct IntentRule {
    intent: Intent,
    /// 请求中出现任一触发词即命中
    triggers: &'static [&'static str],
    /// 命中后，名称含这些词的工具成为提示
    tool_keywords: &'static [&'static str],
}

/// 按优先级排列；第一个命中的规则决定 intent_tag
const RULES: &[IntentRule] = &[
    IntentRule {
        intent: Intent::Search,
        triggers: &["search", "find", "lookup", "latest", "news", "google", "搜索", "查一下", "新闻"],
        tool_keywords: &["search", "serp", "serpapi", "google", "news"],
    },
    IntentRule {
        intent: Intent::Extract,
        triggers: &["extract", "scrape", "summarize", "summarise", "article", "page", "content", "提取", "摘要"],
        tool_keywords: &["extract", "fetch", "scrape", "content", "trafilatura", "page"],
    },
    IntentRule {
        intent: Intent::Spreadsheet,
        triggers: &["sheet", "spreadsheet", "table", "csv", "excel", "表格"],
        tool_keywords: &["sheet", "spreadsheet", "gdrive", "table"],
    },
    IntentRule {
        intent: Intent::Share,
        triggers: &["share", "invite", "分享", "共享"],
        tool_keywords: &["share", "permission", "gdrive"],
    },
    IntentRule {
        intent: Intent::Messaging,
        triggers: &["send", "message", "telegram", "notify", "发送", "通知"],
        tool_keywords: &["send", "message", "telegram", "chat", "notify"],
    },
];

/// 工具名中不具区分度的词
const NAME_STOPWORDS: &[&str] = &["get", "set", "the", "and", "for", "with", "new", "tool", "to"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Entities {
    pub urls: Vec<String>,
    pub emails: Vec<String>,
    pub numbers: Vec<String>,
    /// 引号内的文本
    pub quoted: Vec<String>,
}

impl Entities {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.emails.is_empty() && self.numbers.is_empty() && self.quoted.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerceptionResult {
    pub intent_tag: Intent,
    /// 命中的全部意图（按优先级）
    pub intents: Vec<Intent>,
    /// 候选工具的限定名
    pub tool_hints: BTreeSet<String>,
    pub extracted_entities: Entities,
}

impl PerceptionResult {
    pub fn to_prompt_section(&self) -> String {
        let mut out = format!("Intent: {}", self.intent_tag);
        let e = &self.extracted_entities;
        for (label, values) in [
            ("URLs", &e.urls),
            ("Emails", &e.emails),
            ("Numbers", &e.numbers),
            ("Quoted", &e.quoted),
        ] {
            if !values.is_empty() {
                out.push_str(&format!("\n{label}: {}", values.join(", ")));
            }
        }
        out
    }
}

static URL_RE: OnceLock<Option<Regex>> = OnceLock::new();
static EMAIL_RE: OnceLock<Option<Regex>> = OnceLock::new();
static NUMBER_RE: OnceLock<Option<Regex>> = OnceLock::new();
static QUOTED_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn find_all(re: Option<&Regex>, text: &str, group: usize) -> Vec<String> {
    let Some(re) = re else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.captures_iter(text)
        .filter_map(|c| c.get(group).map(|m| m.as_str().trim().to_string()))
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

/// 抽取 URL、邮箱、数字与引号文本
pub fn extract_entities(text: &str) -> Entities {
    let urls = find_all(cached(&URL_RE, r#"https?://[^\s"'<>)\]]+"#), text, 0);
    let emails = find_all(
        cached(&EMAIL_RE, r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"),
        text,
        0,
    );
    // 去掉 URL 与邮箱后再找数字，避免抽出路径或域名里的数字
    let mut rest = text.to_string();
    for s in urls.iter().chain(emails.iter()) {
        rest = rest.replace(s.as_str(), " ");
    }
    let numbers = find_all(cached(&NUMBER_RE, r"(?:^|[\s(])(-?\d+(?:\.\d+)?)\b"), &rest, 1);
    let mut quoted: Vec<String> = Vec::new();
    if let Some(re) = cached(&QUOTED_RE, r#""([^"]+)"|“([^”]+)”|'([^']{2,})'"#) {
        for caps in re.captures_iter(text) {
            if let Some(m) = (1..=3).find_map(|g| caps.get(g)) {
                let s = m.as_str().trim().to_string();
                if !s.is_empty() && !quoted.contains(&s) {
                    quoted.push(s);
                }
            }
        }
    }
    Entities {
        urls,
        emails,
        numbers,
        quoted,
    }
}

fn rule_matches(rule: &IntentRule, lower: &str, tokens: &HashSet<String>) -> bool {
    rule.triggers.iter().any(|t| {
        if t.is_ascii() {
            tokens.contains(*t)
        } else {
            lower.contains(t)
        }
    })
}

fn name_tokens(provider: &str, remote_name: &str) -> HashSet<String> {
    let mut tokens = tokenize_lower(&remote_name.replace('_', " "));
    tokens.insert(provider.to_lowercase());
    tokens.retain(|t| !NAME_STOPWORDS.contains(&t.as_str()));
    tokens
}

/// 规则感知器（无状态）
#[derive(Debug, Clone, Default)]
pub struct Perception;

impl Perception {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, raw_input: &str, catalog: &ToolCatalog) -> PerceptionResult {
        let lower = raw_input.to_lowercase();
        let tokens = tokenize_lower(raw_input);
        let extracted_entities = extract_entities(raw_input);

        let mut intents: Vec<Intent> = RULES
            .iter()
            .filter(|r| rule_matches(r, &lower, &tokens))
            .map(|r| r.intent)
            .collect();
        if !extracted_entities.urls.is_empty() && !intents.contains(&Intent::Extract) {
            intents.push(Intent::Extract);
        }
        let intent_tag = intents.first().copied().unwrap_or(Intent::General);

        let keywords: HashSet<&str> = RULES
            .iter()
            .filter(|r| intents.contains(&r.intent))
            .flat_map(|r| r.tool_keywords.iter().copied())
            .collect();

        let tool_hints = catalog
            .tools()
            .iter()
            .filter(|t| {
                let names = name_tokens(&t.provider_id, &t.remote_name);
                names.iter().any(|n| tokens.contains(n) || keywords.contains(n.as_str()))
            })
            .map(|t| t.qualified_name.clone())
            .collect();

        PerceptionResult {
            intent_tag,
            intents,
            tool_hints,
            extracted_entities,
        }
    }
}
