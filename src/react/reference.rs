//! 回溯引用：参数中的 `{{step K}}` / `{{step K.field.path}}`
//!
//! K 从 1 开始，指第 K 个已执行步骤；路径段可以是对象键或数组下标（`.0` 或 `[0]`）。
//! 整个字符串就是一个占位符时替换为 JSON 值本身；嵌在文本中时替换为其文本形式。
//! 解析在执行该 Action 前进行，引用尚未执行、已失败或缺字段的步骤都得到 ReferenceError。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::react::StepRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, ".{k}"),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// 指向历史步骤结果（或其中某个字段）的引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackReference {
    /// 1 起的步骤编号，按书写保留
    pub step: usize,
    pub path: Vec<PathSegment>,
}

impl fmt::Display for BackReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{{step {}", self.step)?;
        for seg in &self.path {
            write!(f, "{seg}")?;
        }
        f.write_str("}}")
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("{reference}: step {step} has not been executed yet")]
    NotYetExecuted { reference: String, step: usize },

    #[error("{reference}: step {step} failed, its result cannot be used")]
    StepFailed { reference: String, step: usize },

    #[error("{reference}: step {step} result has no field '{path}'")]
    MissingField {
        reference: String,
        step: usize,
        path: String,
    },
}

impl BackReference {
    pub fn resolve(&self, history: &[StepRecord]) -> Result<Value, ReferenceError> {
        let reference = self.to_string();
        let record = self
            .step
            .checked_sub(1)
            .and_then(|i| history.get(i))
            .ok_or_else(|| ReferenceError::NotYetExecuted {
                reference: reference.clone(),
                step: self.step,
            })?;
        if !record.result.ok {
            return Err(ReferenceError::StepFailed {
                reference,
                step: self.step,
            });
        }
        let root = record
            .result
            .value
            .clone()
            .unwrap_or_else(|| Value::String(record.result.raw_text.clone()));

        let mut current = &root;
        for (n, seg) in self.path.iter().enumerate() {
            let next = match (seg, current) {
                (PathSegment::Key(k), Value::Object(map)) => map.get(k),
                (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
                (PathSegment::Index(i), Value::Object(map)) => map.get(&i.to_string()),
                _ => None,
            };
            current = next.ok_or_else(|| ReferenceError::MissingField {
                reference: reference.clone(),
                step: self.step,
                path: self.path[..=n].iter().map(|s| s.to_string()).collect(),
            })?;
        }
        Ok(current.clone())
    }
}

/// 模板片段：字面文本或引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    Text(String),
    Reference(BackReference),
}

/// 一个参数值：可能含回溯引用
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Literal(Value),
    Reference(BackReference),
    Template(Vec<TemplatePart>),
    List(Vec<ArgValue>),
    Map(BTreeMap<String, ArgValue>),
}

static PLACEHOLDER_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn placeholder_re() -> Option<&'static Regex> {
    PLACEHOLDER_RE
        .get_or_init(|| {
            Regex::new(r"\{\{\s*step\s*_?(\d+)((?:\.[^\s.\[\]{}]+|\[\d+\])*)\s*\}\}").ok()
        })
        .as_ref()
}

fn parse_path(raw: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('[') {
            let end = after.find(']').unwrap_or(after.len());
            if let Ok(i) = after[..end].parse() {
                segments.push(PathSegment::Index(i));
            }
            rest = after.get(end + 1..).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(['.', '[']).unwrap_or(after.len());
            let key = &after[..end];
            segments.push(match key.parse::<usize>() {
                Ok(i) => PathSegment::Index(i),
                Err(_) => PathSegment::Key(key.to_string()),
            });
            rest = &after[end..];
        } else {
            break;
        }
    }
    segments
}

impl ArgValue {
    /// 从 JSON 值构造，识别字符串中的占位符
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::String(s) => Self::from_text(s),
            Value::Array(items) => ArgValue::List(items.into_iter().map(Self::from_json).collect()),
            Value::Object(map) => ArgValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
            other => ArgValue::Literal(other),
        }
    }

    fn from_text(s: String) -> Self {
        let Some(re) = placeholder_re() else {
            return ArgValue::Literal(Value::String(s));
        };
        let mut parts = Vec::new();
        let mut last = 0;
        for caps in re.captures_iter(&s) {
            let (Some(whole), Some(step)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let Ok(step) = step.as_str().parse::<usize>() else {
                continue;
            };
            if whole.start() > last {
                parts.push(TemplatePart::Text(s[last..whole.start()].to_string()));
            }
            parts.push(TemplatePart::Reference(BackReference {
                step,
                path: parse_path(caps.get(2).map_or("", |m| m.as_str())),
            }));
            last = whole.end();
        }
        if parts.is_empty() {
            return ArgValue::Literal(Value::String(s));
        }
        if last < s.len() {
            parts.push(TemplatePart::Text(s[last..].to_string()));
        }
        match parts.as_slice() {
            [TemplatePart::Reference(r)] => ArgValue::Reference(r.clone()),
            _ => ArgValue::Template(parts),
        }
    }

    pub fn has_references(&self) -> bool {
        match self {
            ArgValue::Literal(_) => false,
            ArgValue::Reference(_) | ArgValue::Template(_) => true,
            ArgValue::List(items) => items.iter().any(ArgValue::has_references),
            ArgValue::Map(map) => map.values().any(ArgValue::has_references),
        }
    }

    /// 用历史结果替换全部引用
    pub fn resolve(&self, history: &[StepRecord]) -> Result<Value, ReferenceError> {
        Ok(match self {
            ArgValue::Literal(v) => v.clone(),
            ArgValue::Reference(r) => r.resolve(history)?,
            ArgValue::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(t) => out.push_str(t),
                        TemplatePart::Reference(r) => match r.resolve(history)? {
                            Value::String(s) => out.push_str(&s),
                            other => out.push_str(&other.to_string()),
                        },
                    }
                }
                Value::String(out)
            }
            ArgValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(|i| i.resolve(history))
                    .collect::<Result<_, _>>()?,
            ),
            ArgValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.resolve(history)?)))
                    .collect::<Result<_, ReferenceError>>()?,
            ),
        })
    }

    /// 还原为展示用 JSON（引用保留占位符文本）
    pub fn to_display_json(&self) -> Value {
        match self {
            ArgValue::Literal(v) => v.clone(),
            ArgValue::Reference(r) => Value::String(r.to_string()),
            ArgValue::Template(parts) => Value::String(
                parts
                    .iter()
                    .map(|p| match p {
                        TemplatePart::Text(t) => t.clone(),
                        TemplatePart::Reference(r) => r.to_string(),
                    })
                    .collect(),
            ),
            ArgValue::List(items) => Value::Array(items.iter().map(ArgValue::to_display_json).collect()),
            ArgValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_display_json()))
                    .collect(),
            ),
        }
    }
}

/// 解析整组参数
pub fn resolve_arguments(
    arguments: &BTreeMap<String, ArgValue>,
    history: &[StepRecord],
) -> Result<Value, ReferenceError> {
    let mut map = serde_json::Map::new();
    for (k, v) in arguments {
        map.insert(k.clone(), v.resolve(history)?);
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorInfo, ErrorKind};
    use crate::react::Action;
    use crate::tools::ToolCallResult;
    use serde_json::json;

    fn record(index: usize, result: ToolCallResult) -> StepRecord {
        StepRecord::new(
            index,
            Action::ToolCall {
                tool_name: "t".into(),
                arguments: BTreeMap::new(),
            },
            json!({}),
            result,
            1,
        )
    }

    fn history() -> Vec<StepRecord> {
        vec![
            record(0, ToolCallResult::success(json!({"items": [{"url": "https://a"}, {"url": "https://b"}]}), "")),
            record(1, ToolCallResult::success(json!({"id": "S1", "url": "https://sheet"}), "")),
            record(2, ToolCallResult::failure(ErrorInfo::new(ErrorKind::ToolTimeout, "slow"))),
        ]
    }

    #[test]
    fn test_whole_string_reference_keeps_json_type() {
        let arg = ArgValue::from_json(json!("{{step 1.items}}"));
        assert!(matches!(arg, ArgValue::Reference(_)));
        let v = arg.resolve(&history()).unwrap();
        assert_eq!(v.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_embedded_reference_is_text() {
        let arg = ArgValue::from_json(json!("Sheet ready: {{step 2.url}} (id {{step2.id}})"));
        let v = arg.resolve(&history()).unwrap();
        assert_eq!(v, json!("Sheet ready: https://sheet (id S1)"));
    }

    #[test]
    fn test_index_segments() {
        let h = history();
        let dot = ArgValue::from_json(json!("{{step 1.items.1.url}}")).resolve(&h).unwrap();
        let bracket = ArgValue::from_json(json!("{{step 1.items[0].url}}")).resolve(&h).unwrap();
        assert_eq!(dot, json!("https://b"));
        assert_eq!(bracket, json!("https://a"));
    }

    #[test]
    fn test_future_step_is_unresolved() {
        let h = history();
        let err = ArgValue::from_json(json!("{{step 4}}")).resolve(&h).unwrap_err();
        assert!(matches!(err, ReferenceError::NotYetExecuted { step: 4, .. }));
        let err = ArgValue::from_json(json!("{{step 0}}")).resolve(&h).unwrap_err();
        assert!(matches!(err, ReferenceError::NotYetExecuted { step: 0, .. }));
    }

    #[test]
    fn test_failed_step_is_unresolved() {
        let err = ArgValue::from_json(json!("{{step 3}}")).resolve(&history()).unwrap_err();
        assert!(matches!(err, ReferenceError::StepFailed { step: 3, .. }));
    }

    #[test]
    fn test_missing_field() {
        let err = ArgValue::from_json(json!("{{step 2.owner.name}}"))
            .resolve(&history())
            .unwrap_err();
        match err {
            ReferenceError::MissingField { path, .. } => assert_eq!(path, ".owner"),
            other => panic!("Expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_structures_and_literals() {
        let arg = ArgValue::from_json(json!({"rows": ["{{step 1.items.0.url}}", 3], "title": "News"}));
        assert!(arg.has_references());
        let v = arg.resolve(&history()).unwrap();
        assert_eq!(v, json!({"rows": ["https://a", 3], "title": "News"}));
        assert!(!ArgValue::from_json(json!({"a": "{{ not a ref }}"})).has_references());
    }

    #[test]
    fn test_display_keeps_placeholder() {
        let arg = ArgValue::from_json(json!("see {{step 1.items[0].url}}"));
        assert_eq!(arg.to_display_json(), json!("see {{step 1.items[0].url}}"));
    }
}
