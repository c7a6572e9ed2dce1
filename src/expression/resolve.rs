use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::Context;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("placeholder regex"));

/// Replace every `{{expr}}` in `template`.
///
/// `expr` is a variable name or a `a ?? b ?? c` chain; the first candidate with
/// a non-empty value in `ctx` wins. When nothing resolves the placeholder
/// becomes an empty string. Text without `{{` is returned as-is.
pub fn resolve_template(template: &str, ctx: &Context) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            resolve_expr(&caps[1], ctx).unwrap_or_default()
        })
        .into_owned()
}

fn resolve_expr(expr: &str, ctx: &Context) -> Option<String> {
    expr.split("??")
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .find_map(|name| ctx.get(name).filter(|v| !v.is_empty()).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> Context {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn resolves_fallback_chain() {
        let c = ctx(&[("a", "1"), ("c", "2")]);
        assert_eq!(resolve_template("{{a}}-{{b??c}}", &c), "1-2");
        assert_eq!(resolve_template("{{ b ?? a }}", &c), "1");
    }

    #[test]
    fn empty_values_fall_through() {
        let c = ctx(&[("b", ""), ("c", "x")]);
        assert_eq!(resolve_template("{{b??c}}", &c), "x");
        assert_eq!(resolve_template("[{{missing??also_missing}}]", &c), "[]");
    }

    #[test]
    fn malformed_braces_are_literal() {
        let c = ctx(&[("a", "1")]);
        assert_eq!(resolve_template("no placeholders", &c), "no placeholders");
        assert_eq!(resolve_template("{{a", &c), "{{a");
        assert_eq!(resolve_template("{a}} {{a}}", &c), "{a}} 1");
    }
}
