//! 工具摘要：生成提示中的 Available tools 段落，并按感知提示缩小候选集

use std::collections::BTreeSet;

use serde_json::Value;

use crate::tools::{ToolCatalog, ToolDescriptor};

/// 每个工具一段：名称、描述、参数、示例调用
pub fn summarize_tools(tools: &[&ToolDescriptor]) -> String {
    if tools.is_empty() {
        return "(no tools available)".to_string();
    }
    let mut out = String::new();
    for t in tools {
        let required = t.required_parameters();
        let params: Vec<String> = t
            .parameter_names()
            .into_iter()
            .map(|name| {
                let ty = t.parameter_schema["properties"][&name]
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("any")
                    .to_string();
                if required.contains(&name) {
                    format!("{name}: {ty}, required")
                } else {
                    format!("{name}: {ty}")
                }
            })
            .collect();
        let description = if t.description.is_empty() {
            "(no description)"
        } else {
            t.description.as_str()
        };
        out.push_str(&format!("- {}: {}\n", t.display_name, description));
        if !params.is_empty() {
            out.push_str(&format!("  Parameters: {}\n", params.join("; ")));
        }
        out.push_str(&format!("  Example: FUNCTION_CALL: {}\n", example_call(t)));
    }
    out
}

fn example_call(t: &ToolDescriptor) -> String {
    let args: Vec<String> = t
        .parameter_names()
        .into_iter()
        .map(|name| {
            let ty = t.parameter_schema["properties"][&name]
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("string");
            let sample = match ty {
                "integer" | "number" => "1".to_string(),
                "boolean" => "true".to_string(),
                "array" => "[]".to_string(),
                "object" => "{}".to_string(),
                _ => format!("\"<{name}>\""),
            };
            format!("{name}={sample}")
        })
        .collect();
    format!("{}({})", t.display_name, args.join(", "))
}

/// 按限定名集合筛选；集合为空或无一命中时返回整个目录
pub fn filter_by_hints<'a>(catalog: &'a ToolCatalog, hints: &BTreeSet<String>) -> Vec<&'a ToolDescriptor> {
    let narrowed: Vec<&ToolDescriptor> = catalog
        .tools()
        .iter()
        .filter(|t| hints.contains(&t.qualified_name))
        .collect();
    if narrowed.is_empty() {
        catalog.tools().iter().collect()
    } else {
        narrowed
    }
}
