//! Hot reload: file-watcher hooks that feed template and settings changes
//! back into the [`PluginManager`].

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{PluginManager, has_template_extension};
use crate::watcher::WatchedType;

/// Any change in the templates directory reloads the whole set and resyncs.
pub struct TemplateWatcher {
    manager: Arc<PluginManager>,
    dir: PathBuf,
}

impl TemplateWatcher {
    pub fn new(manager: Arc<PluginManager>, dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            dir: dir.into(),
        })
    }

    async fn reload_all(&self, changed: &Path) -> Result<()> {
        info!(path = %changed.display(), "template change detected");
        self.manager.load_templates(&self.dir).await?;
        let settings = self.manager.settings().snapshot().await;
        self.manager.apply_configuration(&settings).await;
        Ok(())
    }
}

#[async_trait]
impl WatchedType for TemplateWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        has_template_extension(path)
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        self.reload_all(path).await
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        self.reload_all(path).await
    }
}

/// Edits to the settings file are re-read and reconciled, so only changed
/// instances restart.
pub struct SettingsWatcher {
    manager: Arc<PluginManager>,
    file: PathBuf,
}

impl SettingsWatcher {
    pub fn new(manager: Arc<PluginManager>, file: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            file: file.into(),
        })
    }
}

#[async_trait]
impl WatchedType for SettingsWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        path.file_name().is_some() && path.file_name() == self.file.file_name()
    }

    async fn on_create_or_modify(&self, _path: &Path) -> Result<()> {
        let settings = self.manager.settings().reload().await?;
        let report = self.manager.reconcile(&settings).await;
        if !report.started.is_empty() || !report.stopped.is_empty() {
            info!(started = ?report.started, stopped = ?report.stopped, "settings change applied");
        }
        Ok(())
    }

    async fn on_remove(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}
