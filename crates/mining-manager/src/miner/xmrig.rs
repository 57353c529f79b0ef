use super::{ApiDescriptor, Miner, MinerBase, MinerDeps, MinerInfo, MinerType};
use crate::process::Invocation;
use crate::stats::TelemetrySummary;
use async_trait::async_trait;
use mining_core::{GpuBackend, GpuSelection, MinerConfig, PerformanceMetrics, RequestContext, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// `/2/summary` document served by XMRig's HTTP API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XMRigSummary {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub algo: String,
    pub hashrate: XMRigHashrate,
    pub results: XMRigResults,
    #[serde(default)]
    pub connection: XMRigConnection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XMRigHashrate {
    /// 10s, 60s and 15m averages; entries are null until measured
    #[serde(default)]
    pub total: Vec<Option<f64>>,
    #[serde(default)]
    pub highest: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XMRigResults {
    #[serde(default)]
    pub diff_current: u64,
    #[serde(default)]
    pub shares_good: u64,
    #[serde(default)]
    pub shares_total: u64,
    #[serde(default)]
    pub avg_time: u64,
    #[serde(default)]
    pub hashes_total: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XMRigConnection {
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub ping: u64,
    #[serde(default)]
    pub diff: u64,
    #[serde(default)]
    pub accepted: u64,
    #[serde(default)]
    pub rejected: u64,
}

impl TelemetrySummary for XMRigSummary {
    const ENDPOINT: &'static str = "/2/summary";

    fn to_metrics(&self) -> Result<PerformanceMetrics> {
        let hashrate = self
            .hashrate
            .total
            .first()
            .copied()
            .flatten()
            .unwrap_or(0.0);

        let avg_difficulty = if self.results.shares_good > 0 {
            self.results.hashes_total / self.results.shares_good
        } else {
            0
        };

        Ok(PerformanceMetrics {
            hashrate: hashrate.max(0.0) as u64,
            shares: self.results.shares_good,
            rejected: self
                .results
                .shares_total
                .saturating_sub(self.results.shares_good),
            uptime: self.uptime,
            algorithm: self.algo.clone(),
            diff_current: self.results.diff_current,
            avg_difficulty,
        })
    }
}

/// XMRig, a CPU miner with optional OpenCL/CUDA devices
pub struct XMRigMiner {
    base: MinerBase<XMRigSummary>,
}

impl XMRigMiner {
    pub fn new(name: String, deps: &MinerDeps) -> Self {
        XMRigMiner {
            base: MinerBase::new(name, MinerType::XMRig, deps),
        }
    }

    pub fn last_summary(&self) -> Option<XMRigSummary> {
        self.base.last_summary()
    }
}

#[async_trait]
impl Miner for XMRigMiner {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn miner_type(&self) -> MinerType {
        MinerType::XMRig
    }

    fn translate(&self, config: &MinerConfig, api: &ApiDescriptor) -> Invocation {
        let gpu = config.gpu_selection();
        let mut args = vec![
            "-o".to_string(),
            config.pool.clone(),
            "-u".to_string(),
            config.wallet.clone(),
            "-p".to_string(),
            config.password_or_default().to_string(),
            "-a".to_string(),
            config.algo.clone(),
            "--http-host".to_string(),
            api.host.clone(),
            "--http-port".to_string(),
            api.port.to_string(),
            "--donate-level".to_string(),
            "1".to_string(),
        ];

        if config.cpu_enabled {
            if let Some(hint) = config.cpu_max_threads_hint {
                args.push(format!("--cpu-max-threads-hint={}", hint));
            }
            if let Some(threads) = config.threads {
                args.push("-t".to_string());
                args.push(threads.to_string());
            }
            if !config.huge_pages {
                args.push("--no-huge-pages".to_string());
            }
        } else {
            args.push("--no-cpu".to_string());
        }

        if config.tls {
            args.push("--tls".to_string());
        }

        if let GpuSelection::Devices { backend, devices } = &gpu {
            match backend {
                GpuBackend::OpenCl => {
                    args.push("--opencl".to_string());
                    args.push(format!("--opencl-devices={}", devices));
                }
                GpuBackend::Cuda => {
                    args.push("--cuda".to_string());
                    args.push(format!("--cuda-devices={}", devices));
                }
            }
        }

        args.extend(config.extra_args.iter().cloned());

        Invocation {
            program: self.base.program().to_path_buf(),
            args,
            gpu,
            cpu_enabled: config.cpu_enabled,
        }
    }

    async fn start(&self, config: &MinerConfig) -> Result<()> {
        config.validate()?;
        let api = self.base.allocate_api(config)?;
        let invocation = self.translate(config, &api);
        if config.gpu_enabled && !invocation.gpu.is_enabled() {
            warn!(
                "GPU requested for {} without an explicit device selection; GPU disabled",
                self.base.name()
            );
        }
        self.base.launch(config, api, invocation).await
    }

    async fn stop(&self) -> Result<()> {
        self.base.shutdown().await
    }

    async fn get_stats(&self, ctx: &RequestContext) -> Result<PerformanceMetrics> {
        self.base.fetch_stats(ctx).await
    }

    fn logs(&self) -> Vec<String> {
        self.base.logs()
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }

    fn info(&self) -> MinerInfo {
        self.base.info()
    }
}
