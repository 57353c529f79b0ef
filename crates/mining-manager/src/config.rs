use mining_core::{CircuitBreakerConfig, MinerConfig};
use mining_events::EventHubConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub manager: ManagerConfig,
    pub events: EventsConfig,
    pub history: HistoryConfig,
    pub release_check: ReleaseCheckConfig,
    pub monitoring: MonitoringConfig,
    /// Miners started when the daemon boots
    pub autostart: Vec<AutostartMiner>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutostartMiner {
    pub miner_type: String,
    #[serde(flatten)]
    pub config: MinerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Host the miners' telemetry APIs bind to
    pub api_host: String,
    pub stats_interval_secs: u64,
    pub stats_timeout_secs: u64,
    /// Executable override per miner type, e.g. `xmrig: /opt/xmrig/xmrig`
    pub binaries: HashMap<String, PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub max_connections: i64,
    pub broadcast_buffer: usize,
    pub client_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub high_res_minutes: u64,
    pub retention_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseCheckConfig {
    pub api_base: String,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            api_host: "127.0.0.1".to_string(),
            stats_interval_secs: 10,
            stats_timeout_secs: 5,
            binaries: HashMap::new(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        let hub = EventHubConfig::default();
        EventsConfig {
            max_connections: hub.max_connections,
            broadcast_buffer: hub.broadcast_buffer,
            client_buffer: hub.client_buffer,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            high_res_minutes: 5,
            retention_hours: 24,
        }
    }
}

impl Default for ReleaseCheckConfig {
    fn default() -> Self {
        ReleaseCheckConfig {
            api_base: "https://api.github.com".to_string(),
            failure_threshold: 3,
            cooldown_secs: 60,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            server: ServerConfig::default(),
            manager: ManagerConfig::default(),
            events: EventsConfig::default(),
            history: HistoryConfig::default(),
            release_check: ReleaseCheckConfig::default(),
            monitoring: MonitoringConfig::default(),
            autostart: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: DaemonConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise use the defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn hub_config(&self) -> EventHubConfig {
        EventHubConfig {
            max_connections: self.events.max_connections,
            broadcast_buffer: self.events.broadcast_buffer,
            client_buffer: self.events.client_buffer,
        }
    }

    pub fn release_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.release_check.failure_threshold,
            cooldown: Duration::from_secs(self.release_check.cooldown_secs),
        }
    }
}

impl ManagerConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    pub fn stats_timeout(&self) -> Duration {
        Duration::from_secs(self.stats_timeout_secs.max(1))
    }
}

impl HistoryConfig {
    pub fn high_res_window(&self) -> Duration {
        Duration::from_secs(self.high_res_minutes.saturating_mul(60))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }
}
