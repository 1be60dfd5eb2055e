use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::{BusTopology, DEFAULT_EXCHANGE, DEFAULT_PERSISTENCE_QUEUE};

/// Key-value store connection
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KvsConfig {
    #[serde(default = "default_kvs_endpoint")]
    pub endpoint: String,

    /// Prefix every agent key lives under
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

impl Default for KvsConfig {
    fn default() -> Self {
        Self {
            endpoint: default_kvs_endpoint(),
            base_path: default_base_path(),
        }
    }
}

fn default_kvs_endpoint() -> String {
    "http://127.0.0.1:2379".into()
}
fn default_base_path() -> String {
    "/orbit".into()
}

/// Message bus connection
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BusConfig {
    pub url: String,

    #[serde(default = "default_exchange")]
    pub exchange: String,

    #[serde(default = "default_persistence_queue")]
    pub persistence_queue: String,

    /// Forward check results to the bus as well as the KVS
    #[serde(default)]
    pub publish_service_state: bool,
}

impl BusConfig {
    pub fn topology(&self) -> BusTopology {
        BusTopology {
            exchange: self.exchange.clone(),
            persistence_queue: self.persistence_queue.clone(),
            ..Default::default()
        }
    }
}

fn default_exchange() -> String {
    DEFAULT_EXCHANGE.into()
}
fn default_persistence_queue() -> String {
    DEFAULT_PERSISTENCE_QUEUE.into()
}

/// Local load balancer
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HAProxyConfig {
    #[serde(default = "default_haproxy_binary")]
    pub binary: PathBuf,

    /// Directory holding the live config file
    pub config_path: PathBuf,

    #[serde(default = "default_haproxy_config_name")]
    pub config_name: String,

    /// Admin UNIX socket
    pub socket_path: PathBuf,

    /// Shell command that reloads the LB
    pub reload_command: String,

    /// Quiet period before a deferred reload fires
    #[serde(default = "default_no_updates_delay_window")]
    pub no_updates_delay_window_secs: u64,

    /// Deferred reloads fire at the latest this long after the first change
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

impl HAProxyConfig {
    pub fn config_file(&self) -> PathBuf {
        self.config_path.join(&self.config_name)
    }

    pub fn no_updates_delay_window(&self) -> Duration {
        Duration::from_secs(self.no_updates_delay_window_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

fn default_haproxy_binary() -> PathBuf {
    PathBuf::from("haproxy")
}
fn default_haproxy_config_name() -> String {
    "haproxy.cfg".into()
}
fn default_no_updates_delay_window() -> u64 {
    5
}
fn default_max_delay() -> u64 {
    60
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CheckEngineConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Also emit results for failing services. Off by default: a down
    /// endpoint normally disappears through TTL expiry.
    #[serde(default)]
    pub publish_down_events: bool,
}

impl Default for CheckEngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            publish_down_events: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KeepaliveConfig {
    #[serde(default = "default_keepalive_port")]
    pub port: u16,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            port: default_keepalive_port(),
        }
    }
}

fn default_keepalive_port() -> u16 {
    1500
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RelaunchConfig {
    /// Upper bound of the random delay before an automatic relaunch
    #[serde(default)]
    pub jitter_secs: u64,
}

/// Container runtime backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    /// In-memory containers, nothing is started
    Fake,
}

/// Root agent configuration file
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Address other machines reach this one at
    pub machine_address: String,

    #[serde(default)]
    pub availability_zone: String,

    /// Tags whose desired state this machine runs, lowest precedence first
    pub tags: Vec<String>,

    #[serde(default)]
    pub kvs: KvsConfig,

    #[serde(default)]
    pub bus: Option<BusConfig>,

    #[serde(default)]
    pub haproxy: Option<HAProxyConfig>,

    #[serde(default)]
    pub check_engine: CheckEngineConfig,

    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    #[serde(default)]
    pub relaunch: RelaunchConfig,

    #[serde(default)]
    pub runtime: RuntimeKind,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("machine_address must not be empty")]
    MissingMachineAddress,
    #[error("at least one tag is required")]
    NoTags,
    #[error("haproxy.no_updates_delay_window_secs must be greater than zero")]
    ZeroDelayWindow,
    #[error("no config file found, searched: {searched:?}")]
    NotFound { searched: Vec<PathBuf> },
}

impl AgentConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a string (useful for testing)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search for the config file in standard locations
    pub fn discover(start_dir: &Path) -> Result<(PathBuf, Self), ConfigError> {
        let mut searched = Vec::new();

        if let Ok(env_path) = std::env::var("ORBIT_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok((path.clone(), Self::load(&path)?));
            }
            searched.push(path);
        }

        let candidates = [
            start_dir.join("orbit.yaml"),
            start_dir.join("orbit.yml"),
            PathBuf::from("/etc/orbit/agent.yaml"),
        ];
        for path in candidates {
            if path.exists() {
                return Ok((path.clone(), Self::load(&path)?));
            }
            searched.push(path);
        }

        Err(ConfigError::NotFound { searched })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.machine_address.trim().is_empty() {
            return Err(ConfigError::MissingMachineAddress);
        }
        if self.tags.is_empty() {
            return Err(ConfigError::NoTags);
        }
        if let Some(haproxy) = &self.haproxy {
            if haproxy.no_updates_delay_window_secs == 0 {
                return Err(ConfigError::ZeroDelayWindow);
            }
        }
        Ok(())
    }
}
