// src/settings.rs

use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::template::Template;

/// Everything the engine persists: configured instances and the display list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub plugin_instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub monitor_items: Vec<MonitorItem>,
}

impl Settings {
    pub fn instance(&self, id: &str) -> Option<&InstanceConfig> {
        self.plugin_instances.iter().find(|i| i.id == id)
    }
}

/// One configured use of a template.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct InstanceConfig {
    pub id: String,
    pub template_id: String,
    #[serde(default)]
    pub enabled: bool,
    /// Milliseconds; `<= 0` falls back to the template interval.
    #[serde(default)]
    pub custom_interval: i64,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Per-target input overrides. Empty means a single implicit target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<BTreeMap<String, String>>,
}

impl InstanceConfig {
    /// The record created for a template that has no instance yet.
    pub fn new_disabled(id: impl Into<String>, template: &Template) -> Self {
        Self {
            id: id.into(),
            template_id: template.id.clone(),
            enabled: false,
            custom_interval: 0,
            inputs: template
                .inputs
                .iter()
                .map(|i| (i.key.clone(), i.default.clone()))
                .collect(),
            targets: Vec::new(),
        }
    }

    /// Content hash over the whole record; equal hashes mean nothing to restart.
    pub fn config_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }

    /// `(target index, overrides)` pairs. A config without targets yields one
    /// unindexed entry with no overrides.
    pub fn target_overrides(&self) -> Vec<(Option<usize>, &BTreeMap<String, String>)> {
        static NO_OVERRIDES: BTreeMap<String, String> = BTreeMap::new();
        if self.targets.is_empty() {
            vec![(None, &NO_OVERRIDES)]
        } else {
            self.targets.iter().enumerate().map(|(i, t)| (Some(i), t)).collect()
        }
    }
}

/// A display-list entry pointing at one published key.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MonitorItem {
    pub key: String,
    pub instance_id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub short_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub sort_index: usize,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file {path} is malformed: {message}")]
    Malformed { path: String, message: String },

    #[error("could not serialize settings: {0}")]
    Serialize(String),
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<Settings, SettingsError>;
    async fn save(&self, settings: &Settings) -> Result<(), SettingsError>;
}

/// Settings persisted as pretty JSON. A missing file reads as empty settings.
pub struct JsonFileSettingsStore {
    path: PathBuf,
}

impl JsonFileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_err(&self, source: std::io::Error) -> SettingsError {
        SettingsError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl SettingsStore for JsonFileSettingsStore {
    async fn load(&self) -> Result<Settings, SettingsError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no settings file yet, starting empty");
            return Ok(Settings::default());
        }
        let contents = fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;
        if contents.trim().is_empty() {
            return Ok(Settings::default());
        }
        serde_json::from_str(&contents).map_err(|e| SettingsError::Malformed {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })
    }

    async fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| SettingsError::Serialize(e.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        // write-then-rename so the watcher never sees a half-written file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }
}

/// Keeps settings in memory and counts saves.
#[derive(Default)]
pub struct InMemorySettingsStore {
    stored: RwLock<Settings>,
    saves: AtomicUsize,
}

impl InMemorySettingsStore {
    pub fn new(initial: Settings) -> Self {
        Self {
            stored: RwLock::new(initial),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn stored(&self) -> Settings {
        self.stored.read().await.clone()
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn load(&self) -> Result<Settings, SettingsError> {
        Ok(self.stored.read().await.clone())
    }

    async fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        *self.stored.write().await = settings.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The single owner of the live [`Settings`]. Every read-modify-write goes
/// through [`SettingsManager::update`], which holds the lock across the save.
pub struct SettingsManager {
    store: Arc<dyn SettingsStore>,
    current: Mutex<Settings>,
}

impl SettingsManager {
    pub async fn load(store: Arc<dyn SettingsStore>) -> Result<Arc<Self>, SettingsError> {
        let current = store.load().await?;
        info!(
            instances = current.plugin_instances.len(),
            items = current.monitor_items.len(),
            "settings loaded"
        );
        Ok(Arc::new(Self {
            store,
            current: Mutex::new(current),
        }))
    }

    /// Re-read the backing store, replacing the in-memory copy.
    pub async fn reload(&self) -> Result<Settings, SettingsError> {
        let fresh = self.store.load().await?;
        *self.current.lock().await = fresh.clone();
        Ok(fresh)
    }

    pub async fn snapshot(&self) -> Settings {
        self.current.lock().await.clone()
    }

    /// Run `mutate` under the settings lock. When it reports a change the
    /// result is persisted before the lock is released.
    pub async fn update<F>(&self, mutate: F) -> Result<bool, SettingsError>
    where
        F: FnOnce(&mut Settings) -> bool + Send,
    {
        let mut guard = self.current.lock().await;
        let changed = mutate(&mut guard);
        if changed {
            self.store.save(&guard).await?;
        }
        Ok(changed)
    }
}
