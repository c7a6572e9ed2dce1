//! Instance lifecycle: template loading, start/stop/reconcile of per-instance
//! timers, and the event stream the display layer listens to.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    executor::{InstanceExecutor, RunReport},
    fetch::ResponseCache,
    settings::{InstanceConfig, Settings, SettingsError, SettingsManager},
    sync::MonitorSync,
    template::{TEMPLATE_EXTENSIONS, Template},
};

pub mod reload;
pub mod timer;

pub use timer::{InstanceTimer, TimerState};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Display records of an instance were created, updated or removed.
    MonitorItemsChanged { instance_id: String },
    InstanceStarted { instance_id: String },
    InstanceStopped { instance_id: String },
    InstanceExecuted {
        instance_id: String,
        started: DateTime<Utc>,
        elapsed_ms: u64,
        targets: usize,
        failed_targets: usize,
    },
    TemplatesReloaded { count: usize },
}

/// What [`PluginManager::reconcile`] did, by instance id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub unchanged: Vec<String>,
}

pub type TemplateSet = Arc<HashMap<String, Arc<Template>>>;

pub struct PluginManager {
    templates: RwLock<TemplateSet>,
    timers: Mutex<HashMap<String, InstanceTimer>>,
    settings: Arc<SettingsManager>,
    sync: Arc<dyn MonitorSync>,
    executor: Arc<InstanceExecutor>,
    cache: Arc<ResponseCache>,
    events: broadcast::Sender<EngineEvent>,
    shutdown: CancellationToken,
    // serializes start/stop decisions so two lifecycle calls never race
    lifecycle: Mutex<()>,
}

impl PluginManager {
    pub fn new(
        settings: Arc<SettingsManager>,
        sync: Arc<dyn MonitorSync>,
        executor: Arc<InstanceExecutor>,
        cache: Arc<ResponseCache>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            templates: RwLock::new(Arc::new(HashMap::new())),
            timers: Mutex::new(HashMap::new()),
            settings,
            sync,
            executor,
            cache,
            events,
            shutdown: CancellationToken::new(),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &Arc<SettingsManager> {
        &self.settings
    }

    pub async fn templates(&self) -> TemplateSet {
        self.templates.read().await.clone()
    }

    pub async fn template(&self, id: &str) -> Option<Arc<Template>> {
        self.templates.read().await.get(id).cloned()
    }

    /// Sorted ids of instances with a live timer.
    pub async fn running_instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.timers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn timer_state(&self, instance_id: &str) -> Option<TimerState> {
        self.timers.lock().await.get(instance_id).map(InstanceTimer::state)
    }

    fn emit(&self, event: EngineEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    /// Replace the template set with the definitions found in `dir`.
    ///
    /// Unreadable or invalid files are logged and skipped; of two files with
    /// the same id the first in path order wins. Templates without any
    /// instance get a disabled one, persisted in a single save.
    pub async fn load_templates(&self, dir: &Path) -> Result<usize, SettingsError> {
        let loaded = read_template_dir(dir);
        let count = loaded.len();

        let mut ordered: Vec<Arc<Template>> = loaded.values().cloned().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));
        *self.templates.write().await = Arc::new(loaded);
        self.cache.clear();

        let added = self
            .settings
            .update(move |settings| {
                let mut added = false;
                for template in &ordered {
                    let exists = settings
                        .plugin_instances
                        .iter()
                        .any(|i| i.template_id == template.id);
                    if !exists {
                        let id = unique_instance_id(settings, &template.id);
                        info!(instance = %id, template = %template.id, "created disabled instance");
                        settings
                            .plugin_instances
                            .push(InstanceConfig::new_disabled(id, template));
                        added = true;
                    }
                }
                added
            })
            .await?;

        info!(dir = %dir.display(), count, added, "templates loaded");
        self.emit(EngineEvent::TemplatesReloaded { count });
        Ok(count)
    }

    /// Full resync: stop everything, then start every enabled instance whose
    /// template is known.
    pub async fn apply_configuration(&self, settings: &Settings) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_all_timers().await;

        let templates = self.templates().await;
        for instance in enabled_instances(settings).into_values() {
            match templates.get(&instance.template_id) {
                Some(template) => self.start_instance(instance, template.clone()).await,
                None => warn!(
                    instance = %instance.id,
                    template = %instance.template_id,
                    "template not found, instance skipped"
                ),
            }
        }
    }

    /// Incremental resync. Instances whose configuration hash is unchanged and
    /// whose timer is alive keep running untouched.
    pub async fn reconcile(&self, settings: &Settings) -> ReconcileReport {
        let _lifecycle = self.lifecycle.lock().await;
        let templates = self.templates().await;
        let mut report = ReconcileReport::default();

        let enabled = enabled_instances(settings);

        for id in self.running_instances().await {
            if !enabled.contains_key(id.as_str()) && self.stop_timer(&id).await {
                report.stopped.push(id);
            }
        }

        for (id, instance) in enabled {
            let Some(template) = templates.get(&instance.template_id).cloned() else {
                warn!(
                    instance = %id,
                    template = %instance.template_id,
                    "template not found, instance skipped"
                );
                if self.stop_timer(id).await {
                    report.stopped.push(id.to_string());
                }
                continue;
            };

            let hash = instance.config_hash();
            let unchanged = self
                .timers
                .lock()
                .await
                .get(id)
                .is_some_and(|t| t.config_hash() == hash && !t.is_finished());
            if unchanged {
                report.unchanged.push(id.to_string());
                continue;
            }

            self.stop_timer(id).await;
            self.start_instance(instance, template).await;
            report.started.push(id.to_string());
        }

        debug!(?report, "reconciled");
        report
    }

    /// Stop one instance and bring it back in line with the current settings.
    pub async fn restart_instance(&self, instance_id: &str) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_timer(instance_id).await;

        let settings = self.settings.snapshot().await;
        let template = match settings.instance(instance_id) {
            Some(instance) if instance.enabled => self
                .template(&instance.template_id)
                .await
                .map(|t| (instance, t)),
            _ => None,
        };

        match template {
            Some((instance, template)) => self.start_instance(instance, template).await,
            None => {
                debug!(instance = %instance_id, "instance disabled or unresolvable, removing display items");
                self.remove_items(instance_id).await;
            }
        }
    }

    /// Stop an instance for good: timer, display items and cached responses.
    pub async fn remove_instance(&self, instance_id: &str) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_timer(instance_id).await;
        self.remove_items(instance_id).await;
        self.cache.clear_instance(instance_id);
    }

    pub async fn stop_all(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_all_timers().await;
    }

    /// Stop everything and refuse to run anything started afterwards.
    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.shutdown.cancel();
        info!("plugin manager shut down");
    }

    /// Run every enabled instance exactly once, without timers.
    pub async fn run_all_once(&self, settings: &Settings) -> Vec<(String, RunReport)> {
        let templates = self.templates().await;
        let runs = settings
            .plugin_instances
            .iter()
            .filter(|i| i.enabled)
            .filter_map(|i| templates.get(&i.template_id).map(|t| (i, t.clone())))
            .map(|(instance, template)| {
                let cancel = self.shutdown.child_token();
                async move {
                    if let Err(e) = self.sync.sync_monitor_item(instance, &template).await {
                        warn!(instance = %instance.id, error = %e, "display sync failed");
                    }
                    let report = self.executor.run(instance, &template, &cancel).await;
                    (instance.id.clone(), report)
                }
            });
        join_all(runs).await
    }

    async fn start_instance(&self, instance: &InstanceConfig, template: Arc<Template>) {
        match self.sync.sync_monitor_item(instance, &template).await {
            Ok(true) => self.emit(EngineEvent::MonitorItemsChanged {
                instance_id: instance.id.clone(),
            }),
            Ok(false) => {}
            Err(e) => warn!(instance = %instance.id, error = %e, "display sync failed"),
        }

        let timer = InstanceTimer::start(
            instance.clone(),
            template,
            self.executor.clone(),
            self.shutdown.child_token(),
            self.events.clone(),
        );
        let previous = self.timers.lock().await.insert(instance.id.clone(), timer);
        if let Some(previous) = previous {
            previous.stop().await;
        }
        self.emit(EngineEvent::InstanceStarted {
            instance_id: instance.id.clone(),
        });
    }

    async fn stop_timer(&self, instance_id: &str) -> bool {
        let removed = self.timers.lock().await.remove(instance_id);
        let Some(timer) = removed else {
            return false;
        };
        timer.stop().await;
        debug!(instance = %instance_id, "instance stopped");
        self.emit(EngineEvent::InstanceStopped {
            instance_id: instance_id.to_string(),
        });
        true
    }

    async fn stop_all_timers(&self) {
        let drained: Vec<(String, InstanceTimer)> = self.timers.lock().await.drain().collect();
        let stopped = join_all(drained.into_iter().map(|(id, timer)| async move {
            timer.stop().await;
            id
        }))
        .await;
        for id in stopped {
            self.emit(EngineEvent::InstanceStopped { instance_id: id });
        }
    }

    async fn remove_items(&self, instance_id: &str) {
        match self.sync.remove_monitor_items(instance_id).await {
            Ok(true) => self.emit(EngineEvent::MonitorItemsChanged {
                instance_id: instance_id.to_string(),
            }),
            Ok(false) => {}
            Err(e) => warn!(instance = %instance_id, error = %e, "could not remove display items"),
        }
    }
}

/// Parse every template file in `dir`, sorted by path.
pub fn read_template_dir(dir: &Path) -> HashMap<String, Arc<Template>> {
    let mut templates = HashMap::new();
    let mut paths: Vec<_> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && has_template_extension(p))
            .collect(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot read templates directory");
            return templates;
        }
    };
    paths.sort();

    for path in paths {
        match Template::load_from_file(&path) {
            Ok(template) => {
                if templates.contains_key(&template.id) {
                    warn!(path = %path.display(), id = %template.id, "duplicate template id, skipped");
                    continue;
                }
                debug!(path = %path.display(), id = %template.id, "template loaded");
                templates.insert(template.id.clone(), Arc::new(template));
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to load template"),
        }
    }
    templates
}

pub fn has_template_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| TEMPLATE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

/// Enabled instances by id. A duplicated id keeps its last occurrence.
fn enabled_instances(settings: &Settings) -> BTreeMap<&str, &InstanceConfig> {
    let mut enabled = BTreeMap::new();
    for instance in settings.plugin_instances.iter().filter(|i| i.enabled) {
        if enabled.insert(instance.id.as_str(), instance).is_some() {
            warn!(instance = %instance.id, "duplicate instance id, keeping the last one");
        }
    }
    enabled
}

fn unique_instance_id(settings: &Settings, base: &str) -> String {
    if settings.instance(base).is_none() {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}-{n}"))
        .find(|candidate| settings.instance(candidate).is_none())
        .unwrap_or_else(|| format!("{base}-{}", uuid::Uuid::new_v4()))
}
