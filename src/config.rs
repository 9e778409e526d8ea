use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// How long a GET waits for a signal before answering `{}`
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_signal_ttl_secs")]
    pub signal_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_map_size_mb")]
    pub map_size_mb: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Re-announce `ready` this often until the peer answers
    #[serde(default = "default_ready_retry_ms")]
    pub ready_retry_ms: u64,
    /// Pause after a failed poll or send before trying again
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
}

fn default_bind_address() -> String {
    "127.0.0.1:8001".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    2
}

fn default_signal_ttl_secs() -> u64 {
    10
}

fn default_data_dir() -> String {
    get_duet_dir()
        .join("relay")
        .to_string_lossy()
        .to_string()
}

fn default_map_size_mb() -> usize {
    64
}

fn default_relay_url() -> String {
    "http://127.0.0.1:8001/api/poll".to_string()
}

fn default_ready_retry_ms() -> u64 {
    4000
}

fn default_retry_delay_ms() -> u64 {
    50
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            poll_timeout_secs: default_poll_timeout_secs(),
            signal_ttl_secs: default_signal_ttl_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            map_size_mb: default_map_size_mb(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            ready_retry_ms: default_ready_retry_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            stun_servers: default_stun_servers(),
        }
    }
}

impl ServerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn signal_ttl(&self) -> Duration {
        Duration::from_secs(self.signal_ttl_secs)
    }
}

impl ClientConfig {
    pub fn ready_retry(&self) -> Duration {
        Duration::from_millis(self.ready_retry_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Config {
    /// Load config from ~/.duet/config.toml, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(get_config_path())
    }

    /// Load config from a specific file, writing defaults there if missing
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to ~/.duet/config.toml
    pub fn save(&self) -> Result<()> {
        self.save_to(get_config_path())
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    pub fn store_options(&self) -> signal_store::StoreOptions {
        signal_store::StoreOptions {
            ttl: self.server.signal_ttl(),
            map_size: self.storage.map_size_mb * 1024 * 1024,
        }
    }
}

/// Get the duet directory (~/.duet)
pub fn get_duet_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".duet")
}

/// Get the config file path (~/.duet/config.toml)
pub fn get_config_path() -> PathBuf {
    get_duet_dir().join("config.toml")
}
