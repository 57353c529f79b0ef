use crate::{MiningError, Result};
use serde::{Deserialize, Serialize};

/// Characters that never make it into a process argument.
const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '{', '}', '<', '>', '\n', '\r'];

/// Arguments that would override the telemetry API access settings.
const BLOCKED_ARG_PREFIXES: &[&str] = &["--api-access-token", "--api-worker-id"];

/// GPU compute backend requested by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuBackend {
    /// AMD/Intel devices
    OpenCl,
    /// NVIDIA devices
    Cuda,
}

impl GpuBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpuBackend::OpenCl => "opencl",
            GpuBackend::Cuda => "cuda",
        }
    }
}

/// Outcome of the GPU safety policy for one config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuSelection {
    /// No GPU participates
    Disabled,
    /// Only the explicitly listed devices participate
    Devices { backend: GpuBackend, devices: String },
}

impl GpuSelection {
    pub fn is_enabled(&self) -> bool {
        matches!(self, GpuSelection::Devices { .. })
    }
}

/// User intent for one miner instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerConfig {
    /// Optional explicit instance name; derived from type and algorithm otherwise
    #[serde(default)]
    pub name: Option<String>,

    /// Pool address, e.g. `stratum+tcp://pool.example.com:3333`
    pub pool: String,

    /// Wallet address or pool login
    pub wallet: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Algorithm identifier, e.g. `rx/0` or `kawpow`
    pub algo: String,

    #[serde(default = "default_true")]
    pub cpu_enabled: bool,

    /// Percentage of CPU threads the engine may use (1-100)
    #[serde(default)]
    pub cpu_max_threads_hint: Option<u8>,

    #[serde(default)]
    pub threads: Option<u32>,

    #[serde(default)]
    pub gpu_enabled: bool,

    #[serde(default)]
    pub gpu_backend: Option<GpuBackend>,

    /// Comma separated device indices, e.g. `0` or `0,1`
    #[serde(default)]
    pub devices: Option<String>,

    #[serde(default)]
    pub gpu_intensity: Option<u32>,

    #[serde(default)]
    pub tls: bool,

    #[serde(default = "default_true")]
    pub huge_pages: bool,

    /// Fixed telemetry port; a free port is picked when absent
    #[serde(default)]
    pub http_port: Option<u16>,

    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl MinerConfig {
    /// Minimal CPU-only config
    pub fn new(pool: impl Into<String>, wallet: impl Into<String>, algo: impl Into<String>) -> Self {
        MinerConfig {
            name: None,
            pool: pool.into(),
            wallet: wallet.into(),
            password: None,
            algo: algo.into(),
            cpu_enabled: true,
            cpu_max_threads_hint: None,
            threads: None,
            gpu_enabled: false,
            gpu_backend: None,
            devices: None,
            gpu_intensity: None,
            tls: false,
            huge_pages: true,
            http_port: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_gpu(mut self, backend: GpuBackend, devices: Option<&str>) -> Self {
        self.gpu_enabled = true;
        self.gpu_backend = Some(backend);
        self.devices = devices.map(str::to_string);
        self
    }

    /// Structural validation, performed before any side effect.
    pub fn validate(&self) -> Result<()> {
        if self.pool.trim().is_empty() {
            return Err(MiningError::InvalidConfig("pool is required".to_string()));
        }
        if self.wallet.trim().is_empty() {
            return Err(MiningError::InvalidConfig("wallet is required".to_string()));
        }
        if self.algo.trim().is_empty() {
            return Err(MiningError::InvalidConfig("algorithm is required".to_string()));
        }

        if let Some(hint) = self.cpu_max_threads_hint {
            if hint == 0 || hint > 100 {
                return Err(MiningError::InvalidConfig(format!(
                    "cpu_max_threads_hint must be between 1 and 100, got {}",
                    hint
                )));
            }
        }

        if let Some(port) = self.http_port {
            if port < 1024 {
                return Err(MiningError::InvalidConfig(format!(
                    "http_port must be between 1024 and 65535, got {}",
                    port
                )));
            }
        }

        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(MiningError::InvalidConfig("name must not be empty".to_string()));
            }
        }

        for arg in &self.extra_args {
            if !is_valid_cli_arg(arg) {
                return Err(MiningError::InvalidConfig(format!("invalid extra argument: {:?}", arg)));
            }
        }

        Ok(())
    }

    /// GPU safety policy: GPU participation requires an explicit, non-empty
    /// device selector and a backend. Anything less disables GPU entirely.
    pub fn gpu_selection(&self) -> GpuSelection {
        if !self.gpu_enabled {
            return GpuSelection::Disabled;
        }

        let devices = self.devices.as_deref().map(str::trim).unwrap_or("");
        if devices.is_empty() {
            return GpuSelection::Disabled;
        }

        match self.gpu_backend {
            Some(backend) => GpuSelection::Devices {
                backend,
                devices: devices.to_string(),
            },
            None => GpuSelection::Disabled,
        }
    }

    /// Registry key for a miner of `miner_type` started with this config.
    pub fn instance_name(&self, miner_type: &str) -> String {
        match &self.name {
            Some(name) => sanitize_instance_name(name.trim()),
            None => format!("{}-{}", miner_type, sanitize_instance_name(self.algo.trim())),
        }
    }

    pub fn password_or_default(&self) -> &str {
        match self.password.as_deref() {
            Some(p) if !p.is_empty() => p,
            _ => "x",
        }
    }
}

/// Replace everything outside `[A-Za-z0-9_/-]` with `_`.
pub fn sanitize_instance_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '/' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn is_valid_cli_arg(arg: &str) -> bool {
    if arg.contains(SHELL_METACHARACTERS) {
        return false;
    }

    let lower = arg.to_lowercase();
    !BLOCKED_ARG_PREFIXES.iter().any(|blocked| lower.starts_with(blocked))
}
