// src/apps.rs
use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::{
    config::EngineConfig,
    executor::{InstanceExecutor, Publisher, StepExecutor},
    fetch::{HttpFetcher, ResponseCache},
    scheduler::{
        PluginManager,
        reload::{SettingsWatcher, TemplateWatcher},
    },
    settings::{JsonFileSettingsStore, SettingsManager, SettingsStore},
    sink::ValueSink,
    sync::DisplaySync,
    template::TEMPLATE_EXTENSIONS,
    watcher::DirectoryWatcher,
};

/// The wired-up engine: one of each component, shared as `Arc` handles.
pub struct App {
    manager: Arc<PluginManager>,
    watchers: Vec<DirectoryWatcher>,
}

impl App {
    /// Wire the components together, load templates and start every enabled
    /// instance. With `watch` the templates directory and the settings file
    /// are hot-reloaded.
    pub async fn bootstrap(
        config: &EngineConfig,
        fetcher: Arc<dyn HttpFetcher>,
        sink: Arc<dyn ValueSink>,
        watch: bool,
    ) -> Result<App> {
        let store: Arc<dyn SettingsStore> =
            Arc::new(JsonFileSettingsStore::new(&config.settings_file));
        let manager = Self::build(config, fetcher, sink, store).await?;

        std::fs::create_dir_all(&config.templates_dir).with_context(|| {
            format!("cannot create templates dir {}", config.templates_dir.display())
        })?;
        manager.load_templates(&config.templates_dir).await?;
        let settings = manager.settings().snapshot().await;
        manager.apply_configuration(&settings).await;
        info!(running = manager.running_instances().await.len(), "engine started");

        let mut watchers = Vec::new();
        if watch {
            watchers.push(
                DirectoryWatcher::new(
                    config.templates_dir.clone(),
                    TemplateWatcher::new(manager.clone(), &config.templates_dir),
                    TEMPLATE_EXTENSIONS,
                    false,
                    true,
                )
                .await?,
            );
            match settings_dir(&config.settings_file) {
                Some(dir) => watchers.push(
                    DirectoryWatcher::new(
                        dir,
                        SettingsWatcher::new(manager.clone(), &config.settings_file),
                        &[],
                        false,
                        true,
                    )
                    .await?,
                ),
                None => warn!("settings file has no parent directory, not watching it"),
            }
        }

        Ok(App { manager, watchers })
    }

    /// Build the manager and its collaborators without loading anything.
    pub async fn build(
        config: &EngineConfig,
        fetcher: Arc<dyn HttpFetcher>,
        sink: Arc<dyn ValueSink>,
        store: Arc<dyn SettingsStore>,
    ) -> Result<Arc<PluginManager>> {
        let settings = SettingsManager::load(store).await?;
        let cache = ResponseCache::new(fetcher);
        let executor = Arc::new(InstanceExecutor::new(
            StepExecutor::new(cache.clone()),
            Publisher::new(sink.clone(), &config.key_prefix),
            config.stagger,
        ));
        let sync = DisplaySync::new(settings.clone(), sink, &config.key_prefix);
        Ok(PluginManager::new(settings, sync, executor, cache))
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    pub async fn shutdown(self) {
        for watcher in self.watchers {
            watcher.shutdown();
        }
        self.manager.shutdown().await;
    }
}

fn settings_dir(settings_file: &Path) -> Option<std::path::PathBuf> {
    match settings_file.parent() {
        Some(p) if p.as_os_str().is_empty() => Some(".".into()),
        Some(p) => Some(p.to_path_buf()),
        None => None,
    }
}
