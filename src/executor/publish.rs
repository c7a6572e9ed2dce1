use std::sync::Arc;

use tracing::trace;

use crate::{
    expression::{Context, resolve_template},
    sink::ValueSink,
    template::{OutputDecl, Template},
};

/// Published when a target fails.
pub const ERROR_VALUE: &str = "Error";
/// Published when an output resolves to nothing.
pub const EMPTY_PLACEHOLDER: &str = "-";
/// Seeded into the sink for items that have not produced a value yet.
pub const LOADING_VALUE: &str = "...";

pub const LABEL_NAMESPACE: &str = "PROP.Label.";
pub const SHORT_LABEL_NAMESPACE: &str = "PROP.ShortLabel.";
pub const COLOR_SUFFIX: &str = ".Color";

/// `.N` for indexed targets, empty for the implicit single target.
pub fn target_suffix(target_index: Option<usize>) -> String {
    target_index.map(|i| format!(".{i}")).unwrap_or_default()
}

/// `<prefix>.<instance>[.<target>]`
pub fn instance_key(prefix: &str, instance_id: &str, target_index: Option<usize>) -> String {
    format!("{prefix}.{instance_id}{}", target_suffix(target_index))
}

/// `<prefix>.<instance>[.<target>].<output>`
pub fn item_key(
    prefix: &str,
    instance_id: &str,
    target_index: Option<usize>,
    output_key: &str,
) -> String {
    format!("{}.{output_key}", instance_key(prefix, instance_id, target_index))
}

/// Every sink key that belongs to one display item.
pub fn item_keys(item_key: &str) -> [String; 4] {
    [
        item_key.to_string(),
        format!("{item_key}{COLOR_SUFFIX}"),
        format!("{LABEL_NAMESPACE}{item_key}"),
        format!("{SHORT_LABEL_NAMESPACE}{item_key}"),
    ]
}

/// Label patterns may reference inputs that are empty or missing at run time;
/// fill those from the template defaults before resolving.
pub fn label_context(template: &Template, ctx: &Context) -> Context {
    let mut labels = ctx.clone();
    for input in &template.inputs {
        let slot = labels.entry(input.key.clone()).or_default();
        if slot.is_empty() {
            slot.clone_from(&input.default);
        }
    }
    labels
}

/// Static display label for an output: the declared pattern or `<name> <key>`.
pub fn output_label(template: &Template, output: &OutputDecl, ctx: &Context) -> String {
    match output.label.as_deref() {
        Some(pattern) => resolve_template(pattern, ctx),
        None => format!("{} {}", template.display_name(), output.key),
    }
}

pub fn output_short_label(output: &OutputDecl, ctx: &Context) -> String {
    match output.short_label.as_deref() {
        Some(pattern) => resolve_template(pattern, ctx),
        None => output.key.clone(),
    }
}

/// Writes one target's results into the [`ValueSink`].
#[derive(Clone)]
pub struct Publisher {
    sink: Arc<dyn ValueSink>,
    prefix: String,
}

impl Publisher {
    pub fn new(sink: Arc<dyn ValueSink>, prefix: impl Into<String>) -> Self {
        Self {
            sink,
            prefix: prefix.into(),
        }
    }

    /// Publish every declared output. Dynamic labels go to the `PROP.`
    /// namespace rather than into the persisted display list.
    pub fn publish_outputs(
        &self,
        template: &Template,
        instance_id: &str,
        target_index: Option<usize>,
        ctx: &Context,
    ) {
        let labels = label_context(template, ctx);
        for output in &template.outputs {
            let key = item_key(&self.prefix, instance_id, target_index, &output.key);

            let mut value = resolve_template(&output.format, ctx);
            if value.trim().is_empty() {
                value = EMPTY_PLACEHOLDER.to_string();
            }
            trace!(%key, %value, "publish");
            self.sink.inject_value(&key, &value);

            if let Some(color) = output.color.as_deref() {
                let color = resolve_template(color, ctx);
                if !color.is_empty() {
                    self.sink.inject_value(&format!("{key}{COLOR_SUFFIX}"), &color);
                }
            }
            self.sink.inject_value(
                &format!("{LABEL_NAMESPACE}{key}"),
                &output_label(template, output, &labels),
            );
            self.sink.inject_value(
                &format!("{SHORT_LABEL_NAMESPACE}{key}"),
                &output_short_label(output, &labels),
            );
        }
    }

    /// Templates without outputs publish the last raw body at the instance key.
    pub fn publish_raw(&self, instance_id: &str, target_index: Option<usize>, body: &str) {
        let key = instance_key(&self.prefix, instance_id, target_index);
        self.sink.inject_value(&key, body);
    }

    pub fn publish_error(&self, template: &Template, instance_id: &str, target_index: Option<usize>) {
        if template.outputs.is_empty() {
            self.publish_raw(instance_id, target_index, ERROR_VALUE);
            return;
        }
        for output in &template.outputs {
            let key = item_key(&self.prefix, instance_id, target_index, &output.key);
            self.sink.inject_value(&key, ERROR_VALUE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::InMemorySink;
    use serde_json::json;

    fn template() -> Template {
        serde_json::from_value(json!({
            "id": "weather",
            "meta": { "name": "Weather" },
            "inputs": [ { "key": "city", "default": "Berlin" } ],
            "execution": { "type": "api_json", "url": "https://w.example/{{city}}" },
            "outputs": [
                { "key": "temp", "format": "{{temp}}", "color": "{{temp_color}}",
                  "label": "{{city}} temp", "short_label": "T" },
                { "key": "wind", "format": "{{wind}}" }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn key_layout() {
        assert_eq!(item_key("DASH", "w", None, "temp"), "DASH.w.temp");
        assert_eq!(item_key("DASH", "w", Some(2), "temp"), "DASH.w.2.temp");
        assert_eq!(instance_key("X", "w", Some(0)), "X.w.0");
    }

    #[test]
    fn publishes_values_colors_and_labels() {
        let sink = InMemorySink::new();
        let publisher = Publisher::new(sink.clone(), "DASH");
        let ctx = Context::from([
            ("temp".to_string(), "21".to_string()),
            ("temp_color".to_string(), "#ff0000".to_string()),
        ]);

        publisher.publish_outputs(&template(), "w", None, &ctx);

        let values = sink.snapshot();
        assert_eq!(values["DASH.w.temp"], "21");
        assert_eq!(values["DASH.w.temp.Color"], "#ff0000");
        assert_eq!(values["PROP.Label.DASH.w.temp"], "Berlin temp");
        assert_eq!(values["PROP.ShortLabel.DASH.w.temp"], "T");
        assert_eq!(values["DASH.w.wind"], EMPTY_PLACEHOLDER);
        assert!(!values.contains_key("DASH.w.wind.Color"));
        assert_eq!(values["PROP.Label.DASH.w.wind"], "Weather wind");
        assert_eq!(values["PROP.ShortLabel.DASH.w.wind"], "wind");
    }

    #[test]
    fn error_and_raw_publishing() {
        let sink = InMemorySink::new();
        let publisher = Publisher::new(sink.clone(), "DASH");

        publisher.publish_error(&template(), "w", Some(1));
        assert_eq!(sink.get_value("DASH.w.1.temp").as_deref(), Some(ERROR_VALUE));
        assert_eq!(sink.get_value("DASH.w.1.wind").as_deref(), Some(ERROR_VALUE));

        let mut bare = template();
        bare.outputs.clear();
        publisher.publish_raw("w", None, "{\"raw\":true}");
        assert_eq!(sink.get_value("DASH.w").as_deref(), Some("{\"raw\":true}"));
        publisher.publish_error(&bare, "w", None);
        assert_eq!(sink.get_value("DASH.w").as_deref(), Some(ERROR_VALUE));
    }
}
