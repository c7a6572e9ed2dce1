use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashMap;

/// Flat key/value store the display layer polls for published results.
pub trait ValueSink: Send + Sync {
    fn inject_value(&self, key: &str, value: &str);
    fn get_value(&self, key: &str) -> Option<String>;
    fn remove_value(&self, key: &str);
}

#[derive(Debug, Default)]
pub struct InMemorySink {
    values: DashMap<String, String>,
}

impl InMemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sorted copy of everything published so far.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ValueSink for InMemorySink {
    fn inject_value(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn get_value(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }

    fn remove_value(&self, key: &str) {
        self.values.remove(key);
    }
}
