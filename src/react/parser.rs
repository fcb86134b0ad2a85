//! 计划解析：把决策服务的文本输出转为有序 Action 序列
//!
//! 支持的行格式：
//! - `FUNCTION_CALL: tool(a="x", n=3)`，值为 JSON / Python 字面量或裸字符串
//! - `FUNCTION_CALL: tool|a=x|input.value=y`，点号键嵌套
//! - JSON 对象 / 数组（可在 ```json 代码块内，可跨多行）：
//!   `{"tool_name": .., "parameters": {..}}`、`{"tool": .., "tool_input": ..}`、
//!   `{"tool": .., 其余键即参数}`、`{"tool_name": null, "direct_answer": ..}`
//! - `FINAL_ANSWER: 文本`，延续到下一个标记行为止
//!
//! 行首编号、列表符号与反引号会被去掉；其余行视为说明文字并忽略。
//! 格式错误的标记行 / JSON 记为 PlanError，不中断后续行的解析。

use serde_json::{Map, Value};
use thiserror::Error;

use crate::react::Action;

const FUNCTION_CALL: &str = "FUNCTION_CALL";
const FINAL_ANSWER: &str = "FINAL_ANSWER";
const FRAGMENT_CHARS: usize = 80;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {reason}: {fragment}")]
pub struct PlanError {
    pub line: usize,
    pub fragment: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    /// 1 起的行号
    pub line: usize,
    pub action: Action,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPlan {
    pub entries: Vec<PlanEntry>,
    pub errors: Vec<PlanError>,
}

impl ParsedPlan {
    /// 至少一个动作且没有错误
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.entries.is_empty()
    }

    pub fn actions(&self) -> Vec<Action> {
        self.entries.iter().map(|e| e.action.clone()).collect()
    }

    /// 第一个错误行之前的动作
    pub fn usable_actions(&self) -> Vec<Action> {
        let cutoff = self.errors.iter().map(|e| e.line).min().unwrap_or(usize::MAX);
        self.entries
            .iter()
            .filter(|e| e.line < cutoff)
            .map(|e| e.action.clone())
            .collect()
    }

    pub fn describe_errors(&self) -> String {
        if self.errors.is_empty() {
            return "no FUNCTION_CALL or FINAL_ANSWER line found".to_string();
        }
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// 解析整段计划文本
pub fn parse_plan(text: &str) -> ParsedPlan {
    let lines: Vec<&str> = text.lines().collect();
    let mut plan = ParsedPlan::default();
    parse_lines(&lines, 0, &mut plan);
    plan
}

fn parse_lines(lines: &[&str], offset: usize, plan: &mut ParsedPlan) {
    let mut i = 0;
    while i < lines.len() {
        let line_no = offset + i + 1;
        let line = normalize(lines[i]);
        if line.is_empty() {
            i += 1;
            continue;
        }

        if line.starts_with("```") {
            let end = (i + 1..lines.len())
                .find(|&j| lines[j].trim().starts_with("```"))
                .unwrap_or(lines.len());
            let inner = lines[i + 1..end].join("\n");
            let body = inner.trim();
            if body.starts_with('{') || body.starts_with('[') {
                match parse_structured(body) {
                    Ok(actions) => push_all(plan, line_no, actions),
                    Err(reason) => push_error(plan, line_no, body, reason),
                }
            } else {
                parse_lines(&lines[i + 1..end], offset + i + 1, plan);
            }
            i = end + 1;
            continue;
        }

        if let Some(rest) = strip_marker(&line, FINAL_ANSWER) {
            let mut text = rest.to_string();
            let mut j = i + 1;
            while j < lines.len() {
                let next = normalize(lines[j]);
                if is_marker_line(&next) || next.starts_with("```") {
                    break;
                }
                text.push('\n');
                text.push_str(lines[j].trim_end());
                j += 1;
            }
            let text = text.trim();
            if text.is_empty() {
                push_error(plan, line_no, &line, "empty final answer".into());
            } else {
                push_all(plan, line_no, vec![Action::final_answer(text)]);
            }
            i = j;
            continue;
        }

        if let Some(rest) = strip_marker(&line, FUNCTION_CALL) {
            let (body, consumed) = if rest.starts_with('{') || rest.starts_with('[') {
                gather_json(lines, i, rest)
            } else {
                (rest.to_string(), 1)
            };
            match parse_call(&body) {
                Ok(actions) => push_all(plan, line_no, actions),
                Err(reason) => push_error(plan, line_no, &line, reason),
            }
            i += consumed;
            continue;
        }

        if line.starts_with('{') || line.starts_with('[') {
            let (body, consumed) = gather_json(lines, i, &line);
            match parse_structured(&body) {
                Ok(actions) => {
                    push_all(plan, line_no, actions);
                    i += consumed;
                }
                // 以 `[` 开头的说明文字（脚注等）不算错误
                Err(_) if line.starts_with('[') => i += 1,
                Err(reason) => {
                    push_error(plan, line_no, &line, reason);
                    i += consumed;
                }
            }
            continue;
        }

        i += 1;
    }
}

fn push_all(plan: &mut ParsedPlan, line: usize, actions: Vec<Action>) {
    plan.entries
        .extend(actions.into_iter().map(|action| PlanEntry { line, action }));
}

fn push_error(plan: &mut ParsedPlan, line: usize, fragment: &str, reason: String) {
    let fragment: String = fragment.trim().chars().take(FRAGMENT_CHARS).collect();
    plan.errors.push(PlanError {
        line,
        fragment,
        reason,
    });
}

/// 去掉行首编号 / 列表符号 / 强调符与包裹的单反引号
fn normalize(raw: &str) -> String {
    let mut s = raw.trim();
    let digits = s.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &s[digits..];
        if let Some(r) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            if r.starts_with(char::is_whitespace) {
                s = r.trim_start();
            }
        }
    }
    for bullet in ["- ", "* ", "• "] {
        if let Some(r) = s.strip_prefix(bullet) {
            s = r.trim_start();
            break;
        }
    }
    let s = s.trim_start_matches("**").trim();
    if s.starts_with('`') && !s.starts_with("```") {
        return s.trim_matches('`').trim().to_string();
    }
    s.to_string()
}

fn is_marker_line(line: &str) -> bool {
    strip_marker(line, FUNCTION_CALL).is_some() || strip_marker(line, FINAL_ANSWER).is_some()
}

/// 行中出现 `MARKER:`（允许 `**` 包裹）时返回冒号后的内容
fn strip_marker<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let start = if line
        .get(..marker.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(marker))
    {
        0
    } else {
        line.find(marker)?
    };
    let rest = line[start + marker.len()..].trim_start_matches('*').trim_start();
    let rest = rest.strip_prefix(':')?;
    Some(rest.trim_start_matches('*').trim())
}

/// 从 lines[start] 的 first 开始累积到括号配平；返回文本与消耗的行数
fn gather_json(lines: &[&str], start: usize, first: &str) -> (String, usize) {
    let mut scanner = BracketScanner::default();
    let mut body = first.to_string();
    scanner.feed(first);
    let mut consumed = 1;
    while !scanner.balanced() && start + consumed < lines.len() {
        let next = lines[start + consumed];
        body.push('\n');
        body.push_str(next);
        scanner.feed(next);
        consumed += 1;
    }
    (body, consumed)
}

#[derive(Default)]
struct BracketScanner {
    depth: i32,
    opened: bool,
    quote: Option<char>,
    escaped: bool,
}

impl BracketScanner {
    fn feed(&mut self, text: &str) {
        for c in text.chars() {
            if let Some(q) = self.quote {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == q {
                    self.quote = None;
                }
                continue;
            }
            match c {
                '"' | '\'' => self.quote = Some(c),
                '{' | '[' | '(' => {
                    self.depth += 1;
                    self.opened = true;
                }
                '}' | ']' | ')' => self.depth -= 1,
                _ => {}
            }
        }
    }

    fn balanced(&self) -> bool {
        self.opened && self.depth <= 0
    }
}

fn is_tool_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn parse_call(body: &str) -> Result<Vec<Action>, String> {
    let body = body.trim().trim_matches('`').trim();
    if body.is_empty() {
        return Err("missing tool call".into());
    }
    if body.starts_with('{') || body.starts_with('[') {
        return parse_structured(body);
    }
    if let Some(open) = body.find('(') {
        let name = body[..open].trim();
        if !is_tool_name(name) {
            return Err(format!("invalid tool name '{name}'"));
        }
        let Some(inner) = body[open + 1..].trim_end().strip_suffix(')') else {
            return Err("unbalanced parentheses".into());
        };
        let args = parse_keyword_args(inner, ',')?;
        return Ok(vec![Action::tool_call(name, Value::Object(args))]);
    }
    if body.contains('|') {
        let parts = split_top_level(body, '|');
        let name = parts[0].trim();
        if !is_tool_name(name) {
            return Err(format!("invalid tool name '{name}'"));
        }
        let args = parse_keyword_args(&parts[1..].join("|"), '|')?;
        return Ok(vec![Action::tool_call(name, Value::Object(args))]);
    }
    if is_tool_name(body) {
        return Ok(vec![Action::tool_call(body, Value::Object(Map::new()))]);
    }
    Err("expected tool_name(param=value, ...)".into())
}

fn parse_keyword_args(inner: &str, sep: char) -> Result<Map<String, Value>, String> {
    let mut args = Map::new();
    for part in split_top_level(inner, sep) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((key, value)) = part.split_once('=') else {
            return Err(format!("expected key=value, got '{part}'"));
        };
        let key = key.trim();
        if key.is_empty() || !key.split('.').all(is_tool_name) {
            return Err(format!("invalid parameter name '{key}'"));
        }
        insert_nested(&mut args, key, parse_literal(value));
    }
    Ok(args)
}

fn insert_nested(map: &mut Map<String, Value>, dotted: &str, value: Value) {
    match dotted.split_once('.') {
        None => {
            map.insert(dotted.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(inner) = slot {
                insert_nested(inner, rest, value);
            }
        }
    }
}

/// 按分隔符切分，忽略引号与括号内部的分隔符
fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in s.chars() {
        if let Some(q) = quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                quote = Some(c);
                current.push(c);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                current.push(c);
            }
            c if c == sep && depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// JSON / Python 字面量，失败时作为裸字符串
fn parse_literal(raw: &str) -> Value {
    let t = raw.trim();
    if t.is_empty() {
        return Value::String(String::new());
    }
    if let Ok(v) = serde_json::from_str::<Value>(t) {
        return v;
    }
    match t {
        "True" => return Value::Bool(true),
        "False" => return Value::Bool(false),
        "None" => return Value::Null,
        _ => {}
    }
    if t.len() >= 2 && t.starts_with('\'') && t.ends_with('\'') {
        return Value::String(t[1..t.len() - 1].replace("\\'", "'"));
    }
    if t.starts_with('[') || t.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<Value>(&python_to_json(t)) {
            return v;
        }
    }
    if t.len() >= 2 && t.starts_with('"') && t.ends_with('"') {
        return Value::String(t[1..t.len() - 1].to_string());
    }
    Value::String(t.to_string())
}

/// 单引号字符串与 True/False/None 转为 JSON 写法
fn python_to_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                out.push('"');
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some('\'') => out.push('\''),
                            Some(other) => {
                                out.push('\\');
                                out.push(other);
                            }
                            None => {}
                        },
                        '"' => out.push_str("\\\""),
                        '\'' => break,
                        other => out.push(other),
                    }
                }
                out.push('"');
            }
            '"' => {
                out.push('"');
                while let Some(c) = chars.next() {
                    out.push(c);
                    match c {
                        '\\' => {
                            if let Some(next) = chars.next() {
                                out.push(next);
                            }
                        }
                        '"' => break,
                        _ => {}
                    }
                }
            }
            c if c.is_ascii_alphabetic() => {
                let mut word = String::from(c);
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        word.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            other => out.push(other),
        }
    }
    out
}

fn parse_structured(text: &str) -> Result<Vec<Action>, String> {
    let value = serde_json::from_str::<Value>(text)
        .or_else(|e| serde_json::from_str::<Value>(&python_to_json(text)).map_err(|_| e))
        .map_err(|e| format!("invalid JSON ({e})"))?;
    match value {
        Value::Array(items) => items.into_iter().map(object_to_action).collect(),
        Value::Object(_) => Ok(vec![object_to_action(value)?]),
        _ => Err("expected a JSON object or array".into()),
    }
}

const NAME_KEYS: [&str; 4] = ["tool_name", "tool", "name", "function"];
const ARG_KEYS: [&str; 4] = ["parameters", "tool_input", "args", "arguments"];
const ANSWER_KEYS: [&str; 3] = ["final_answer", "direct_answer", "answer"];

fn object_to_action(value: Value) -> Result<Action, String> {
    let Value::Object(mut map) = value else {
        return Err("plan entries must be JSON objects".into());
    };
    let name_key = NAME_KEYS.iter().copied().find(|k| {
        map.get(*k)
            .and_then(Value::as_str)
            .is_some_and(|n| !n.trim().is_empty())
    });
    let name = name_key
        .and_then(|k| map.remove(k))
        .and_then(|v| v.as_str().map(|n| n.trim().to_string()));

    let Some(name) = name else {
        let answer = ANSWER_KEYS
            .iter()
            .find_map(|k| map.get(*k))
            .map(|v| match v {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty());
        return answer
            .map(Action::final_answer)
            .ok_or_else(|| "missing tool_name".to_string());
    };
    if !is_tool_name(&name) {
        return Err(format!("invalid tool name '{name}'"));
    }

    let explicit = ARG_KEYS.iter().find_map(|k| map.remove(*k));
    let args = match explicit {
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(v @ Value::Object(_)) => v,
            _ => Value::String(s),
        },
        Some(Value::Null) => Value::Object(Map::new()),
        Some(other) => other,
        None => {
            map.retain(|k, v| {
                !(NAME_KEYS.contains(&k.as_str()) && v.is_null())
                    && k != "direct_answer"
                    && k != "final_answer"
            });
            Value::Object(map)
        }
    };
    Ok(Action::tool_call(name, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::ArgValue;
    use serde_json::json;

    fn call(action: &Action) -> (&str, Value) {
        match action {
            Action::ToolCall {
                tool_name,
                arguments,
            } => (
                tool_name.as_str(),
                Value::Object(
                    arguments
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_display_json()))
                        .collect(),
                ),
            ),
            other => panic!("Expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn test_function_call_with_literals() {
        let plan = parse_plan(r#"FUNCTION_CALL: search(query="rust async", num=3, safe=True, tags=['a', 'b'])"#);
        assert!(plan.is_clean());
        let actions = plan.actions();
        let (name, args) = call(&actions[0]);
        assert_eq!(name, "search");
        assert_eq!(args, json!({"query": "rust async", "num": 3, "safe": true, "tags": ["a", "b"]}));
    }

    #[test]
    fn test_commas_inside_quotes() {
        let plan = parse_plan(r#"FUNCTION_CALL: send(text="Hello, world", chat_id=42)"#);
        let (_, args) = call(&plan.actions()[0]);
        assert_eq!(args["text"], "Hello, world");
        assert_eq!(args["chat_id"], 42);
    }

    #[test]
    fn test_pipe_format_with_nested_keys() {
        let plan = parse_plan("FUNCTION_CALL: extract|input.url=https://a.com/x|input.mode=fast|limit=5");
        let actions = plan.actions();
        let (name, args) = call(&actions[0]);
        assert_eq!(name, "extract");
        assert_eq!(args, json!({"input": {"url": "https://a.com/x", "mode": "fast"}, "limit": 5}));
    }

    #[test]
    fn test_numbered_lines_commentary_and_final_answer() {
        let text = "I'll search first, then answer.\n\
                    1. FUNCTION_CALL: search(query=\"weather Paris\")\n\
                    2. `FUNCTION_CALL: summarize(text=\"{{step 1}}\")`\n\
                    FINAL_ANSWER: It is sunny.\n\
                    Enjoy your day!";
        let plan = parse_plan(text);
        assert!(plan.is_clean());
        let actions = plan.actions();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[2], Action::final_answer("It is sunny.\nEnjoy your day!"));
        match &actions[1] {
            Action::ToolCall { arguments, .. } => {
                assert!(matches!(arguments["text"], ArgValue::Reference(_)))
            }
            other => panic!("Expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn test_json_forms() {
        let text = r#"{"tool_name": "search", "parameters": {"query": "x"}}
{"tool": "extract", "tool_input": "https://a"}
{"tool": "create_sheet", "title": "News", "name": "daily"}"#;
        let plan = parse_plan(text);
        assert!(plan.is_clean());
        let actions = plan.actions();
        assert_eq!(call(&actions[0]).1, json!({"query": "x"}));
        assert_eq!(call(&actions[1]).1, json!({"input": "https://a"}));
        assert_eq!(call(&actions[2]).1, json!({"title": "News", "name": "daily"}));
    }

    #[test]
    fn test_fenced_json_array_with_direct_answer() {
        let text = "Plan:\n```json\n[\n  {\"tool_name\": \"search\", \"tool_input\": {\"query\": \"x\"}},\n  {\"tool_name\": null, \"direct_answer\": \"done\"}\n]\n```";
        let plan = parse_plan(text);
        assert!(plan.is_clean(), "{:?}", plan.errors);
        let actions = plan.actions();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[1], Action::final_answer("done"));
        assert_eq!(plan.entries[0].line, 2);
    }

    #[test]
    fn test_multiline_json_without_fence() {
        let text = "{\n  \"tool\": \"search\",\n  \"args\": {\"query\": \"a}b\"}\n}\nFINAL_ANSWER: ok";
        let plan = parse_plan(text);
        assert!(plan.is_clean(), "{:?}", plan.errors);
        assert_eq!(plan.actions().len(), 2);
    }

    #[test]
    fn test_errors_keep_prefix() {
        let text = "FUNCTION_CALL: search(query=\"a\")\nFUNCTION_CALL: 123bad(x=1)\nFUNCTION_CALL: share(id=\"1\")";
        let plan = parse_plan(text);
        assert_eq!(plan.errors.len(), 1);
        assert_eq!(plan.errors[0].line, 2);
        assert!(plan.errors[0].fragment.contains("123bad"));
        assert_eq!(plan.actions().len(), 2);
        let usable = plan.usable_actions();
        assert_eq!(usable.len(), 1);
        assert_eq!(call(&usable[0]).0, "search");
    }

    #[test]
    fn test_malformed_json_is_error() {
        let plan = parse_plan("{\"tool\": \"search\", \"args\": ");
        assert!(plan.entries.is_empty());
        assert_eq!(plan.errors.len(), 1);
        assert!(plan.errors[0].reason.contains("invalid JSON"));
    }

    #[test]
    fn test_pure_commentary_is_empty_plan() {
        let plan = parse_plan("I am not sure what to do.\n[1] see notes");
        assert!(plan.entries.is_empty());
        assert!(plan.errors.is_empty());
        assert!(!plan.is_clean());
    }

    #[test]
    fn test_empty_final_answer_is_error() {
        let plan = parse_plan("FINAL_ANSWER:\nFUNCTION_CALL: search(query=\"a\")");
        assert_eq!(plan.errors.len(), 1);
        assert_eq!(plan.errors[0].line, 1);
    }

    #[test]
    fn test_bare_tool_name_and_python_dict() {
        let plan = parse_plan("FUNCTION_CALL: list_sheets\nFUNCTION_CALL: create(meta={'title': 'A', 'public': False})");
        let actions = plan.actions();
        assert_eq!(call(&actions[0]), ("list_sheets", json!({})));
        assert_eq!(call(&actions[1]).1, json!({"meta": {"title": "A", "public": false}}));
    }

    #[test]
    fn test_unquoted_placeholder_value() {
        let plan = parse_plan("FUNCTION_CALL: share(file_id={{step 2.id}}, email=bob@example.com)");
        let (_, args) = call(&plan.actions()[0]);
        assert_eq!(args["file_id"], "{{step 2.id}}");
        assert_eq!(args["email"], "bob@example.com");
    }

    #[test]
    fn test_bold_marker() {
        let plan = parse_plan("**FUNCTION_CALL:** search(query=\"x\")");
        assert!(plan.is_clean());
    }
}
