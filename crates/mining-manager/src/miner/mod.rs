//! Miner abstraction shared by every engine integration.

pub mod simulated;
pub mod ttminer;
pub mod xmrig;

pub use simulated::{SimulatedMiner, SimulatedProfile};
pub use ttminer::{TTMiner, TTMinerSummary};
pub use xmrig::{XMRigMiner, XMRigSummary};

use crate::process::{Invocation, ProcessHandle, ProcessLauncher};
use crate::stats::{self, TelemetrySummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mining_core::{MinerConfig, MiningError, PerformanceMetrics, RequestContext, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MinerType {
    #[serde(rename = "xmrig")]
    XMRig,
    #[serde(rename = "tt-miner")]
    TTMiner,
    #[serde(rename = "simulated")]
    Simulated,
}

impl MinerType {
    pub const ALL: [MinerType; 3] = [MinerType::XMRig, MinerType::TTMiner, MinerType::Simulated];

    pub fn as_str(&self) -> &'static str {
        match self {
            MinerType::XMRig => "xmrig",
            MinerType::TTMiner => "tt-miner",
            MinerType::Simulated => "simulated",
        }
    }

    /// Executable looked up on `PATH` unless overridden
    pub fn default_executable(&self) -> &'static str {
        match self {
            MinerType::XMRig => "xmrig",
            MinerType::TTMiner => "TT-Miner",
            MinerType::Simulated => "simulated",
        }
    }

    /// GitHub `(owner, repo)` publishing releases of this engine
    pub fn release_repo(&self) -> Option<(&'static str, &'static str)> {
        match self {
            MinerType::XMRig => Some(("xmrig", "xmrig")),
            MinerType::TTMiner => Some(("TrailingStop", "TT-Miner-release")),
            MinerType::Simulated => None,
        }
    }
}

impl fmt::Display for MinerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MinerType {
    type Err = MiningError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "xmrig" => Ok(MinerType::XMRig),
            "tt-miner" | "ttminer" => Ok(MinerType::TTMiner),
            "simulated" | "sim" => Ok(MinerType::Simulated),
            other => Err(MiningError::UnsupportedMiner(other.to_string())),
        }
    }
}

/// Static description of a supported engine
#[derive(Debug, Clone, Serialize)]
pub struct AvailableMiner {
    pub miner_type: MinerType,
    pub description: &'static str,
    pub homepage: &'static str,
    pub supports_cpu: bool,
    pub supports_gpu: bool,
}

pub fn available_miners() -> Vec<AvailableMiner> {
    vec![
        AvailableMiner {
            miner_type: MinerType::XMRig,
            description: "XMRig - CPU/GPU miner for RandomX, KawPow, CryptoNight",
            homepage: "https://github.com/xmrig/xmrig",
            supports_cpu: true,
            supports_gpu: true,
        },
        AvailableMiner {
            miner_type: MinerType::TTMiner,
            description: "TT-Miner - NVIDIA GPU miner for Ethash, KawPow, ProgPow",
            homepage: "https://github.com/TrailingStop/TT-Miner-release",
            supports_cpu: false,
            supports_gpu: true,
        },
        AvailableMiner {
            miner_type: MinerType::Simulated,
            description: "Simulated - Mock miner for testing and development",
            homepage: "",
            supports_cpu: true,
            supports_gpu: false,
        },
    ]
}

/// Where a miner's telemetry API listens; port 0 means not configured
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiDescriptor {
    pub host: String,
    pub port: u16,
}

impl ApiDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ApiDescriptor {
            host: host.into(),
            port,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.port != 0
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinerStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl MinerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MinerStatus::Stopped => "stopped",
            MinerStatus::Starting => "starting",
            MinerStatus::Running => "running",
            MinerStatus::Stopping => "stopping",
        }
    }
}

/// Per-instance mutable state, guarded by the instance lock
#[derive(Debug)]
pub struct MinerState<S> {
    pub status: MinerStatus,
    pub config: Option<MinerConfig>,
    pub api: ApiDescriptor,
    pub process: Option<ProcessHandle>,
    /// Last raw telemetry document
    pub summary: Option<S>,
    /// Metrics derived from `summary`
    pub metrics: Option<PerformanceMetrics>,
    pub started_at: Option<DateTime<Utc>>,
    /// Registered as running with no process: nothing left to mine
    pub idle: bool,
}

impl<S> Default for MinerState<S> {
    fn default() -> Self {
        MinerState {
            status: MinerStatus::Stopped,
            config: None,
            api: ApiDescriptor::default(),
            process: None,
            summary: None,
            metrics: None,
            started_at: None,
            idle: false,
        }
    }
}

/// Point-in-time copy of a miner's observable state
#[derive(Debug, Clone, Serialize)]
pub struct MinerInfo {
    pub name: String,
    pub miner_type: MinerType,
    pub status: MinerStatus,
    pub running: bool,
    pub api: ApiDescriptor,
    pub pool: Option<String>,
    pub algo: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub metrics: Option<PerformanceMetrics>,
    pub idle: bool,
}

/// Capability surface every engine integration implements
#[async_trait]
pub trait Miner: Send + Sync {
    fn name(&self) -> &str;

    fn miner_type(&self) -> MinerType;

    /// Engine-native command line for `config`, with the GPU safety policy applied
    fn translate(&self, config: &MinerConfig, api: &ApiDescriptor) -> Invocation;

    async fn start(&self, config: &MinerConfig) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn get_stats(&self, ctx: &RequestContext) -> Result<PerformanceMetrics>;

    fn logs(&self) -> Vec<String>;

    /// Running and the process has not exited on its own
    fn is_running(&self) -> bool;

    fn info(&self) -> MinerInfo;
}

/// Collaborators handed to every miner instance
#[derive(Clone)]
pub struct MinerDeps {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub http: reqwest::Client,
    pub api_host: String,
    pub binaries: HashMap<String, PathBuf>,
    /// Profile given to simulated instances
    pub simulated: SimulatedProfile,
}

impl MinerDeps {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, http: reqwest::Client) -> Self {
        MinerDeps {
            launcher,
            http,
            api_host: "127.0.0.1".to_string(),
            binaries: HashMap::new(),
            simulated: SimulatedProfile::default(),
        }
    }

    fn program_for(&self, miner_type: MinerType) -> PathBuf {
        self.binaries
            .get(miner_type.as_str())
            .cloned()
            .unwrap_or_else(|| PathBuf::from(miner_type.default_executable()))
    }
}

/// Record shared by composition between engine integrations
pub struct MinerBase<S> {
    name: String,
    miner_type: MinerType,
    program: PathBuf,
    api_host: String,
    launcher: Arc<dyn ProcessLauncher>,
    http: reqwest::Client,
    state: RwLock<MinerState<S>>,
}

impl<S: TelemetrySummary> MinerBase<S> {
    pub fn new(name: String, miner_type: MinerType, deps: &MinerDeps) -> Self {
        MinerBase {
            name,
            miner_type,
            program: deps.program_for(miner_type),
            api_host: deps.api_host.clone(),
            launcher: deps.launcher.clone(),
            http: deps.http.clone(),
            state: RwLock::new(MinerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn state(&self) -> &RwLock<MinerState<S>> {
        &self.state
    }

    /// API address for the next start: the configured port, or a free one
    pub fn allocate_api(&self, config: &MinerConfig) -> Result<ApiDescriptor> {
        let port = match config.http_port {
            Some(port) => port,
            None => free_port(&self.api_host)?,
        };
        Ok(ApiDescriptor::new(self.api_host.clone(), port))
    }

    /// Spawn `invocation` and mark the miner running. An idle invocation is
    /// registered as running without spawning anything.
    pub async fn launch(
        &self,
        config: &MinerConfig,
        api: ApiDescriptor,
        invocation: Invocation,
    ) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.status != MinerStatus::Stopped {
                return Err(MiningError::MinerExists(self.name.clone()));
            }
            if invocation.is_idle() {
                warn!(
                    "{} has no CPU or GPU work after the GPU device policy, running idle",
                    self.name
                );
                state.status = MinerStatus::Running;
                state.config = Some(config.clone());
                state.api = ApiDescriptor::default();
                state.process = None;
                state.summary = None;
                state.metrics = None;
                state.started_at = Some(Utc::now());
                state.idle = true;
                return Ok(());
            }
            state.status = MinerStatus::Starting;
        }

        info!(
            "Starting {} ({}) with API on {}",
            self.name,
            self.miner_type,
            api.address()
        );

        match self.launcher.spawn(&self.name, &invocation).await {
            Ok(handle) => {
                let mut state = self.state.write();
                state.status = MinerStatus::Running;
                state.config = Some(config.clone());
                state.api = api;
                state.process = Some(handle);
                state.summary = None;
                state.metrics = None;
                state.started_at = Some(Utc::now());
                state.idle = false;
                Ok(())
            }
            Err(e) => {
                self.state.write().status = MinerStatus::Stopped;
                Err(e)
            }
        }
    }

    /// Terminate the process. On failure the miner stays running unless the
    /// launcher has already let go of the process.
    pub async fn shutdown(&self) -> Result<()> {
        let handle = {
            let mut state = self.state.write();
            if state.status != MinerStatus::Running {
                return Err(MiningError::NotRunning(self.name.clone()));
            }
            state.status = MinerStatus::Stopping;
            state.process.take()
        };

        let Some(handle) = handle else {
            let mut state = self.state.write();
            state.status = MinerStatus::Stopped;
            state.idle = false;
            info!("Stopped {}", self.name);
            return Ok(());
        };

        match self.launcher.terminate(&handle).await {
            Ok(()) => {
                let mut state = self.state.write();
                state.status = MinerStatus::Stopped;
                state.api = ApiDescriptor::default();
                info!("Stopped {}", self.name);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to stop {}: {}", self.name, e);
                let alive = self.launcher.is_alive(&handle);
                let mut state = self.state.write();
                if alive {
                    state.status = MinerStatus::Running;
                    state.process = Some(handle);
                } else {
                    state.status = MinerStatus::Stopped;
                    state.api = ApiDescriptor::default();
                }
                Err(e)
            }
        }
    }

    pub async fn fetch_stats(&self, ctx: &RequestContext) -> Result<PerformanceMetrics> {
        stats::fetch_stats(&self.http, &self.state, &self.name, ctx).await
    }

    pub fn logs(&self) -> Vec<String> {
        let handle = self.state.read().process.clone();
        handle
            .map(|handle| self.launcher.recent_logs(&handle))
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        let handle = {
            let state = self.state.read();
            if state.status != MinerStatus::Running {
                return false;
            }
            if state.idle {
                return true;
            }
            state.process.clone()
        };
        handle
            .map(|handle| self.launcher.is_alive(&handle))
            .unwrap_or(false)
    }

    pub fn last_summary(&self) -> Option<S> {
        self.state.read().summary.clone()
    }

    pub fn info(&self) -> MinerInfo {
        let running = self.is_running();
        let state = self.state.read();
        MinerInfo {
            name: self.name.clone(),
            miner_type: self.miner_type,
            status: state.status,
            running,
            api: state.api.clone(),
            pool: state.config.as_ref().map(|c| c.pool.clone()),
            algo: state.config.as_ref().map(|c| c.algo.clone()),
            started_at: state.started_at,
            metrics: state.metrics.clone(),
            idle: state.idle,
        }
    }
}

/// Ask the OS for an unused TCP port on `host`
pub fn free_port(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Builds miner instances by type name
#[derive(Clone)]
pub struct MinerFactory {
    deps: MinerDeps,
}

impl MinerFactory {
    pub fn new(deps: MinerDeps) -> Self {
        MinerFactory { deps }
    }

    /// Validate `config` and build an unstarted miner of `miner_type`
    pub fn create(&self, miner_type: &str, config: &MinerConfig) -> Result<Arc<dyn Miner>> {
        let miner_type: MinerType = miner_type.parse()?;
        config.validate()?;

        let name = config.instance_name(miner_type.as_str());
        let miner: Arc<dyn Miner> = match miner_type {
            MinerType::XMRig => Arc::new(XMRigMiner::new(name, &self.deps)),
            MinerType::TTMiner => Arc::new(TTMiner::new(name, &self.deps)),
            MinerType::Simulated => Arc::new(SimulatedMiner::new(name, self.deps.simulated.clone())),
        };
        Ok(miner)
    }
}
