use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use super::{Context, resolve_template};
use crate::template::{Transform, TransformKind};

/// Value written by `threshold_switch` when it cannot classify its input.
pub const THRESHOLD_FALLBACK: &str = "0";

/// Compiled patterns, shared by every template.
static REGEX_CACHE: Lazy<DashMap<String, Regex>> = Lazy::new(DashMap::new);

fn compiled(pattern: &str) -> Option<Regex> {
    if let Some(re) = REGEX_CACHE.get(pattern) {
        return Some(re.clone());
    }
    match Regex::new(pattern) {
        Ok(re) => {
            REGEX_CACHE.insert(pattern.to_string(), re.clone());
            Some(re)
        }
        Err(e) => {
            warn!(%pattern, error = %e, "invalid transform pattern");
            None
        }
    }
}

/// Apply `transforms` in order. A transform whose source variable is absent
/// leaves the context untouched.
pub fn apply_transforms(transforms: &[Transform], ctx: &mut Context) {
    for t in transforms {
        let Some(source) = ctx.get(t.source()).cloned() else {
            continue;
        };
        if let Some(value) = apply_one(t, &source, ctx) {
            ctx.insert(t.var.clone(), value);
        }
    }
}

fn apply_one(t: &Transform, value: &str, ctx: &Context) -> Option<String> {
    match t.function {
        TransformKind::RegexReplace => {
            let re = compiled(t.pattern.as_deref().unwrap_or_default())?;
            let replacement = resolve_template(t.to.as_deref().unwrap_or_default(), ctx);
            Some(re.replace_all(value, replacement.as_str()).into_owned())
        }
        TransformKind::RegexMatch => {
            let re = compiled(t.pattern.as_deref().unwrap_or_default())?;
            let group = t
                .to
                .as_deref()
                .and_then(|g| g.trim().parse::<usize>().ok())
                .unwrap_or(1);
            Some(
                re.captures(value)
                    .and_then(|caps| caps.get(group))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
            )
        }
        TransformKind::Map => Some(t.map.get(value).cloned().unwrap_or_else(|| value.to_string())),
        TransformKind::ResolveTemplate => Some(resolve_template(value, ctx)),
        TransformKind::ThresholdSwitch => Some(threshold_switch(value, t)),
    }
}

fn threshold_switch(value: &str, t: &Transform) -> String {
    let Ok(number) = value.trim().parse::<f64>() else {
        return THRESHOLD_FALLBACK.to_string();
    };
    let mut table: Vec<(f64, &str)> = t
        .map
        .iter()
        .filter_map(|(k, v)| k.trim().parse::<f64>().ok().map(|k| (k, v.as_str())))
        .collect();
    if table.is_empty() {
        return THRESHOLD_FALLBACK.to_string();
    }
    table.sort_by(|a, b| a.0.total_cmp(&b.0));

    table
        .iter()
        .rev()
        .find(|(threshold, _)| *threshold <= number)
        .unwrap_or(&table[0])
        .1
        .to_string()
}
