use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{executor::Stagger, fetch::DEFAULT_FETCH_TIMEOUT};

pub const DEFAULT_KEY_PREFIX: &str = "DASH";

/// Where engine settings come from: the process environment (optionally
/// seeded from a `.env` file) or an in-memory map.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug)]
pub struct EnvConfigManager;

impl EnvConfigManager {
    /// Seed the process environment from `env_file` when it exists.
    pub fn new(env_file: &Path) -> Self {
        if env_file.exists() {
            match dotenvy::from_path(env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {e}", env_file.display()),
            }
        } else {
            debug!("no .env at {}", env_file.display())
        }

        Self
    }
}

#[async_trait]
impl ConfigSource for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl ConfigSource for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }
}

/// Resolved engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub templates_dir: PathBuf,
    pub settings_file: PathBuf,
    pub key_prefix: String,
    pub fetch_timeout: Duration,
    pub stagger: Stagger,
    pub log_level: String,
    pub log_dir: PathBuf,
    pub otel_endpoint: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            templates_dir: PathBuf::from("./plugins"),
            settings_file: PathBuf::from("./settings.json"),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            stagger: Stagger::default(),
            log_level: "info".to_string(),
            log_dir: PathBuf::from("./logs"),
            otel_endpoint: None,
        }
    }
}

impl EngineConfig {
    /// Read every `PLUGIN_*` key from `source`. Unparsable numbers are
    /// logged and replaced by their defaults.
    pub async fn load(source: &dyn ConfigSource) -> Self {
        let defaults = Self::default();
        let get = |key: &'static str| async move {
            source.get(key).await.filter(|v| !v.trim().is_empty())
        };

        Self {
            templates_dir: get("PLUGIN_TEMPLATES_DIR")
                .await
                .map(PathBuf::from)
                .unwrap_or(defaults.templates_dir),
            settings_file: get("PLUGIN_SETTINGS_FILE")
                .await
                .map(PathBuf::from)
                .unwrap_or(defaults.settings_file),
            key_prefix: get("PLUGIN_KEY_PREFIX")
                .await
                .unwrap_or(defaults.key_prefix),
            fetch_timeout: parse_number(get("PLUGIN_FETCH_TIMEOUT_SECS").await, "PLUGIN_FETCH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            stagger: Stagger {
                step: parse_number(get("PLUGIN_STAGGER_MS").await, "PLUGIN_STAGGER_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.stagger.step),
                max: parse_number(get("PLUGIN_STAGGER_MAX_MS").await, "PLUGIN_STAGGER_MAX_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.stagger.max),
            },
            log_level: get("PLUGIN_LOG_LEVEL").await.unwrap_or(defaults.log_level),
            log_dir: get("PLUGIN_LOG_DIR")
                .await
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            otel_endpoint: get("PLUGIN_OTEL_ENDPOINT").await,
        }
    }
}

fn parse_number(raw: Option<String>, key: &str) -> Option<u64> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(e) => {
            warn!(%key, value = %raw, error = %e, "ignoring invalid number");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn map_config_last_set_wins() {
        let mgr = MapConfigManager::new();
        mgr.set("a", "1");
        mgr.set("a", "3");

        assert_eq!(mgr.get("a").await.as_deref(), Some("3"));
        assert_eq!(mgr.get("b").await, None);
    }

    #[tokio::test]
    async fn engine_config_defaults() {
        let config = EngineConfig::load(&MapConfigManager::new()).await;
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.key_prefix, "DASH");
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn engine_config_overrides_and_bad_numbers() {
        let mgr = MapConfigManager::new();
        mgr.set("PLUGIN_KEY_PREFIX", "HUD");
        mgr.set("PLUGIN_TEMPLATES_DIR", "/srv/plugins");
        mgr.set("PLUGIN_STAGGER_MS", "100");
        mgr.set("PLUGIN_FETCH_TIMEOUT_SECS", "soon");
        mgr.set("PLUGIN_OTEL_ENDPOINT", "http://collector:4318");

        let config = EngineConfig::load(&mgr).await;
        assert_eq!(config.key_prefix, "HUD");
        assert_eq!(config.templates_dir, PathBuf::from("/srv/plugins"));
        assert_eq!(config.stagger.step, Duration::from_millis(100));
        assert_eq!(config.stagger.max, Duration::from_secs(2));
        assert_eq!(config.fetch_timeout, DEFAULT_FETCH_TIMEOUT);
        assert_eq!(config.otel_endpoint.as_deref(), Some("http://collector:4318"));
    }

    #[tokio::test]
    async fn env_config_reads_dotenv_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "PLUGIN_TEST_DOTENV_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(&env_path);
        assert_eq!(
            mgr.get("PLUGIN_TEST_DOTENV_KEY").await,
            Some("abc123".to_string())
        );
    }
}
