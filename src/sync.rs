// src/sync.rs

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    executor::{
        merge_inputs,
        publish::{LOADING_VALUE, item_key, item_keys, label_context, output_label, output_short_label},
    },
    settings::{InstanceConfig, MonitorItem, Settings, SettingsError, SettingsManager},
    sink::ValueSink,
    template::Template,
};

/// Keeps the persisted display list in line with running instances.
#[async_trait]
pub trait MonitorSync: Send + Sync {
    /// Create or update the display items of `instance`. Returns whether any
    /// record changed.
    async fn sync_monitor_item(
        &self,
        instance: &InstanceConfig,
        template: &Template,
    ) -> Result<bool, SettingsError>;

    /// Remove every display item that belongs to `instance_id`.
    async fn remove_monitor_items(&self, instance_id: &str) -> Result<bool, SettingsError>;
}

pub struct DisplaySync {
    settings: Arc<SettingsManager>,
    sink: Arc<dyn ValueSink>,
    prefix: String,
}

impl DisplaySync {
    pub fn new(
        settings: Arc<SettingsManager>,
        sink: Arc<dyn ValueSink>,
        prefix: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            sink,
            prefix: prefix.into(),
        })
    }

    /// The items an instance should have, in display order.
    fn expected_items(&self, instance: &InstanceConfig, template: &Template) -> Vec<MonitorItem> {
        let mut items = Vec::new();
        for (index, overrides) in instance.target_overrides() {
            let ctx = label_context(template, &merge_inputs(instance, overrides, template));
            for output in &template.outputs {
                items.push(MonitorItem {
                    key: item_key(&self.prefix, &instance.id, index, &output.key),
                    instance_id: instance.id.clone(),
                    label: output_label(template, output, &ctx),
                    short_label: output_short_label(output, &ctx),
                    unit: output.unit.clone(),
                    sort_index: 0,
                });
            }
        }
        items
    }
}

fn renumber(settings: &mut Settings) {
    for (i, item) in settings.monitor_items.iter_mut().enumerate() {
        item.sort_index = i;
    }
}

/// Merge `expected` into the display list. Stale records of the instance are
/// dropped, existing ones updated in place, new ones inserted right after the
/// instance's last record.
fn merge_items(settings: &mut Settings, instance_id: &str, expected: Vec<MonitorItem>) -> bool {
    let mut changed = false;
    settings
        .monitor_items
        .sort_by_key(|item| item.sort_index);

    let wanted: HashSet<&str> = expected.iter().map(|i| i.key.as_str()).collect();
    let before = settings.monitor_items.len();
    settings
        .monitor_items
        .retain(|item| item.instance_id != instance_id || wanted.contains(item.key.as_str()));
    changed |= settings.monitor_items.len() != before;

    for item in expected {
        match settings.monitor_items.iter_mut().find(|i| i.key == item.key) {
            Some(existing) => {
                if existing.label != item.label
                    || existing.short_label != item.short_label
                    || existing.unit != item.unit
                    || existing.instance_id != item.instance_id
                {
                    existing.label = item.label;
                    existing.short_label = item.short_label;
                    existing.unit = item.unit;
                    existing.instance_id = item.instance_id;
                    changed = true;
                }
            }
            None => {
                let at = settings
                    .monitor_items
                    .iter()
                    .rposition(|i| i.instance_id == instance_id)
                    .map(|pos| pos + 1)
                    .unwrap_or(settings.monitor_items.len());
                settings.monitor_items.insert(at, item);
                changed = true;
            }
        }
    }

    let numbered = settings
        .monitor_items
        .iter()
        .enumerate()
        .all(|(i, item)| item.sort_index == i);
    if changed || !numbered {
        renumber(settings);
        changed = true;
    }
    changed
}

#[async_trait]
impl MonitorSync for DisplaySync {
    async fn sync_monitor_item(
        &self,
        instance: &InstanceConfig,
        template: &Template,
    ) -> Result<bool, SettingsError> {
        let expected = self.expected_items(instance, template);
        let keys: Vec<String> = expected.iter().map(|i| i.key.clone()).collect();

        let id = instance.id.clone();
        let changed = self
            .settings
            .update(move |settings| merge_items(settings, &id, expected))
            .await?;

        for key in &keys {
            if self.sink.get_value(key).is_none() {
                self.sink.inject_value(key, LOADING_VALUE);
            }
        }
        debug!(instance = %instance.id, items = keys.len(), changed, "display items synced");
        Ok(changed)
    }

    async fn remove_monitor_items(&self, instance_id: &str) -> Result<bool, SettingsError> {
        let id = instance_id.to_string();
        let mut removed = Vec::new();
        let removed_ref = &mut removed;
        let changed = self
            .settings
            .update(move |settings| {
                let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut settings.monitor_items)
                    .into_iter()
                    .partition(|item| item.instance_id == id);
                settings.monitor_items = kept;
                if gone.is_empty() {
                    return false;
                }
                renumber(settings);
                removed_ref.extend(gone.into_iter().map(|item| item.key));
                true
            })
            .await?;

        for key in &removed {
            for k in item_keys(key) {
                self.sink.remove_value(&k);
            }
        }
        if changed {
            debug!(instance = %instance_id, removed = removed.len(), "display items removed");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        settings::InMemorySettingsStore,
        sink::InMemorySink,
    };
    use serde_json::json;
    use std::collections::BTreeMap;

    fn template(outputs: serde_json::Value) -> Template {
        serde_json::from_value(json!({
            "id": "weather",
            "meta": { "name": "Weather" },
            "inputs": [ { "key": "city", "default": "Berlin" } ],
            "execution": { "type": "api_json", "url": "https://w.example/{{city}}" },
            "outputs": outputs
        }))
        .unwrap()
    }

    fn instance(id: &str) -> InstanceConfig {
        InstanceConfig {
            id: id.into(),
            template_id: "weather".into(),
            enabled: true,
            custom_interval: 0,
            inputs: BTreeMap::new(),
            targets: Vec::new(),
        }
    }

    async fn setup() -> (Arc<InMemorySettingsStore>, Arc<InMemorySink>, Arc<DisplaySync>) {
        let store = Arc::new(InMemorySettingsStore::default());
        let settings = SettingsManager::load(store.clone()).await.unwrap();
        let sink = InMemorySink::new();
        let sync = DisplaySync::new(settings, sink.clone(), "DASH");
        (store, sink, sync)
    }

    #[tokio::test]
    async fn creates_items_and_seeds_loading_values() {
        let (store, sink, sync) = setup().await;
        let t = template(json!([
            { "key": "temp", "format": "{{temp}}", "label": "{{city}} temperature", "unit": "°C" },
            { "key": "wind", "format": "{{wind}}" }
        ]));

        assert!(sync.sync_monitor_item(&instance("w1"), &t).await.unwrap());

        let items = store.stored().await.monitor_items;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].key, "DASH.w1.temp");
        assert_eq!(items[0].label, "Berlin temperature");
        assert_eq!(items[0].unit.as_deref(), Some("°C"));
        assert_eq!(items[1].label, "Weather wind");
        assert_eq!(items[1].sort_index, 1);
        assert_eq!(sink.get_value("DASH.w1.temp").as_deref(), Some(LOADING_VALUE));

        // second sync is a no-op and does not persist again
        assert!(!sync.sync_monitor_item(&instance("w1"), &t).await.unwrap());
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn new_items_go_after_the_instance_and_stale_ones_leave() {
        let (store, _, sync) = setup().await;
        let one = template(json!([ { "key": "temp", "format": "{{temp}}" } ]));
        sync.sync_monitor_item(&instance("a"), &one).await.unwrap();
        sync.sync_monitor_item(&instance("b"), &one).await.unwrap();

        let two = template(json!([
            { "key": "wind", "format": "{{wind}}" },
            { "key": "rain", "format": "{{rain}}" }
        ]));
        assert!(sync.sync_monitor_item(&instance("a"), &two).await.unwrap());

        let keys: Vec<_> = store
            .stored()
            .await
            .monitor_items
            .into_iter()
            .map(|i| (i.key, i.sort_index))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("DASH.b.temp".to_string(), 0),
                ("DASH.a.wind".to_string(), 1),
                ("DASH.a.rain".to_string(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn targets_get_indexed_items() {
        let (store, _, sync) = setup().await;
        let t = template(json!([ { "key": "temp", "format": "{{temp}}", "label": "{{city}}" } ]));
        let mut inst = instance("w");
        inst.targets = vec![
            BTreeMap::from([("city".into(), "Paris".into())]),
            BTreeMap::new(),
        ];

        sync.sync_monitor_item(&inst, &t).await.unwrap();

        let items = store.stored().await.monitor_items;
        assert_eq!(items[0].key, "DASH.w.0.temp");
        assert_eq!(items[0].label, "Paris");
        assert_eq!(items[1].key, "DASH.w.1.temp");
        assert_eq!(items[1].label, "Berlin");
    }

    #[tokio::test]
    async fn remove_drops_records_and_values() {
        let (store, sink, sync) = setup().await;
        let t = template(json!([ { "key": "temp", "format": "{{temp}}" } ]));
        sync.sync_monitor_item(&instance("a"), &t).await.unwrap();
        sync.sync_monitor_item(&instance("b"), &t).await.unwrap();

        assert!(sync.remove_monitor_items("a").await.unwrap());
        assert!(!sync.remove_monitor_items("a").await.unwrap());

        let items = store.stored().await.monitor_items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, "DASH.b.temp");
        assert_eq!(items[0].sort_index, 0);
        assert!(sink.get_value("DASH.a.temp").is_none());
        assert!(sink.get_value("DASH.b.temp").is_some());
    }
}
