use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

/// Global config manager instance
static CONFIG_MANAGER: OnceLock<ConfigManager> = OnceLock::new();

/// Engine configuration stored as JSON at `<config_dir>/config.json`.
///
/// Registration fields (`server_url`, `auth_token`, `machine_name`,
/// `sync_folder`) are populated by the (out-of-scope) setup wizard; the
/// engine only reads them. The tunables below default to the values named
/// in the spec and may be overridden per installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server_url: String,
    pub auth_token: String,
    pub machine_name: String,
    pub sync_folder: PathBuf,

    pub max_workers: usize,
    pub coalesce_window_ms: u64,
    pub quiet_delay_ms: u64,
    pub reconnect_delay_secs: u64,
    pub request_timeout_secs: u64,

    pub retry_max_retries: u32,
    pub retry_initial_backoff_secs: u64,
    pub retry_max_backoff_secs: u64,
    pub retry_backoff_multiplier: f64,
    pub network_check_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            auth_token: String::new(),
            machine_name: String::new(),
            sync_folder: PathBuf::new(),

            max_workers: 4,
            coalesce_window_ms: 250,
            quiet_delay_ms: 3_000,
            reconnect_delay_secs: 5,
            request_timeout_secs: 30,

            retry_max_retries: 5,
            retry_initial_backoff_secs: 1,
            retry_max_backoff_secs: 60,
            retry_backoff_multiplier: 2.0,
            network_check_interval_secs: 5,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn is_registered(&self) -> bool {
        !self.server_url.is_empty() && !self.auth_token.is_empty()
    }
}

/// Thread-safe configuration manager that persists settings to JSON.
pub struct ConfigManager {
    config: RwLock<EngineConfig>,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Initialize the global config manager. Call once at startup.
    pub fn init() -> Result<&'static ConfigManager> {
        let config_path = Self::default_config_path()?;
        Self::init_at(config_path)
    }

    pub fn init_at(config_path: PathBuf) -> Result<&'static ConfigManager> {
        let config = Self::load_from_path(&config_path)?;
        let manager = ConfigManager {
            config: RwLock::new(config),
            config_path,
        };
        Ok(CONFIG_MANAGER.get_or_init(|| manager))
    }

    /// Get the global config manager instance.
    /// Panics if `init()` has not been called.
    pub fn get() -> &'static ConfigManager {
        CONFIG_MANAGER
            .get()
            .expect("ConfigManager::init() must be called before ConfigManager::get()")
    }

    pub fn try_get() -> Option<&'static ConfigManager> {
        CONFIG_MANAGER.get()
    }

    fn default_config_path() -> Result<PathBuf> {
        let home_dir = dirs::home_dir().context("Failed to get user home directory")?;
        Ok(home_dir.join(".cryptosync").join("config.json"))
    }

    fn load_from_path(path: &PathBuf) -> Result<EngineConfig> {
        if !path.exists() {
            tracing::info!(target: "config", path = %path.display(), "Config file not found, using defaults");
            return Ok(EngineConfig::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: EngineConfig =
            serde_json::from_str(&content).context("Failed to parse config file")?;

        tracing::info!(target: "config", path = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
        }

        let config = self
            .config
            .read()
            .map_err(|e| anyhow::anyhow!("Failed to acquire read lock on config: {}", e))?;

        let content = serde_json::to_string_pretty(&*config).context("Failed to serialize config")?;
        fs::write(&self.config_path, content).context("Failed to write config file")?;

        tracing::debug!(target: "config", path = %self.config_path.display(), "Configuration saved");
        Ok(())
    }

    pub fn get_config(&self) -> EngineConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|_| EngineConfig::default())
    }

    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut EngineConfig),
    {
        {
            let mut config = self
                .config
                .write()
                .map_err(|e| anyhow::anyhow!("Failed to acquire write lock on config: {}", e))?;
            f(&mut config);
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_tunables() {
        let config = EngineConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.coalesce_window_ms, 250);
        assert_eq!(config.quiet_delay_ms, 3_000);
        assert_eq!(config.reconnect_delay_secs, 5);
        assert_eq!(config.retry_max_retries, 5);
        assert_eq!(config.retry_max_backoff_secs, 60);
        assert!(!config.is_registered());
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let loaded = ConfigManager::load_from_path(&path).unwrap();
        assert_eq!(loaded.max_workers, EngineConfig::default().max_workers);
    }

    #[test]
    fn update_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = ConfigManager {
            config: RwLock::new(EngineConfig::default()),
            config_path: path.clone(),
        };
        config
            .update(|c| {
                c.server_url = "https://relay.example.com".to_string();
            })
            .unwrap();

        let reloaded = ConfigManager::load_from_path(&path).unwrap();
        assert_eq!(reloaded.server_url, "https://relay.example.com");
    }
}
