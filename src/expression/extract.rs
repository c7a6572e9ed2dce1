use std::collections::BTreeMap;

use serde_json::Value;

use super::Context;
use crate::template::ResponseFormat;

/// Written for any path that cannot be resolved against the response.
pub const UNKNOWN_VALUE: &str = "N/A";

/// Parse a raw response body according to the declared format.
///
/// Returns `None` for `text` and for bodies that are not valid JSON.
pub fn parse_body(body: &str, format: ResponseFormat) -> Option<Value> {
    match format {
        ResponseFormat::Text => None,
        ResponseFormat::Json => serde_json::from_str(body.trim()).ok(),
        ResponseFormat::Jsonp => serde_json::from_str(strip_jsonp(body)).ok(),
    }
}

/// `callback({...});` → `{...}`. Bodies without a wrapper pass through.
pub fn strip_jsonp(body: &str) -> &str {
    let trimmed = body.trim();
    match (trimmed.find('('), trimmed.rfind(')')) {
        (Some(open), Some(close)) if open < close => trimmed[open + 1..close].trim(),
        _ => trimmed,
    }
}

/// Apply every `var → path` rule to `body`, writing into `ctx`.
///
/// In `text` mode each rule receives the whole body.
pub fn extract_rules(
    body: &str,
    format: ResponseFormat,
    rules: &BTreeMap<String, String>,
    ctx: &mut Context,
) {
    if rules.is_empty() {
        return;
    }
    if format == ResponseFormat::Text {
        for var in rules.keys() {
            ctx.insert(var.clone(), body.to_string());
        }
        return;
    }
    match parse_body(body, format) {
        Some(root) => {
            for (var, path) in rules {
                ctx.insert(var.clone(), extract_path(&root, path));
            }
        }
        None => {
            for var in rules.keys() {
                ctx.insert(var.clone(), UNKNOWN_VALUE.to_string());
            }
        }
    }
}

/// Follow a dot path like `data.items[0].id` and stringify what is found.
pub fn extract_path(root: &Value, path: &str) -> String {
    lookup(root, path)
        .map(stringify)
        .unwrap_or_else(|| UNKNOWN_VALUE.to_string())
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in path.split('.') {
        let (name, indices) = split_segment(segment)?;
        if !name.is_empty() {
            current = current.as_object()?.get(name)?;
        }
        for index in indices {
            current = current.as_array()?.get(index)?;
        }
    }
    Some(current)
}

/// `items[2][0]` → (`items`, [2, 0])
fn split_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(open) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };
    let name = &segment[..open];
    let mut indices = Vec::new();
    let mut rest = &segment[open..];
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        indices.push(inner[..close].trim().parse().ok()?);
        rest = &inner[close + 1..];
    }
    Some((name, indices))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
