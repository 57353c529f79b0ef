use super::{ApiDescriptor, Miner, MinerBase, MinerDeps, MinerInfo, MinerType};
use crate::process::Invocation;
use crate::stats::TelemetrySummary;
use async_trait::async_trait;
use mining_core::{GpuSelection, MinerConfig, MiningError, PerformanceMetrics, RequestContext, Result};
use serde::{Deserialize, Serialize};

/// `/summary` document served by TT-Miner's API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TTMinerSummary {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub algo: String,
    #[serde(default)]
    pub gpus: Vec<TTMinerGpu>,
    #[serde(default)]
    pub results: TTMinerResults,
    #[serde(default)]
    pub connection: TTMinerConnection,
    #[serde(default)]
    pub hashrate: Option<TTMinerHashrate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TTMinerGpu {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub hashrate: f64,
    #[serde(default)]
    pub temp: i32,
    #[serde(default)]
    pub fan: u32,
    #[serde(default)]
    pub power: u32,
    #[serde(default)]
    pub accepted: u64,
    #[serde(default)]
    pub rejected: u64,
    #[serde(default)]
    pub intensity: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TTMinerResults {
    #[serde(default)]
    pub shares_good: u64,
    #[serde(default)]
    pub shares_total: u64,
    #[serde(default)]
    pub avg_time: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TTMinerConnection {
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub ping: u64,
    #[serde(default)]
    pub diff: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TTMinerHashrate {
    #[serde(default)]
    pub total: Vec<f64>,
    #[serde(default)]
    pub highest: f64,
}

impl TelemetrySummary for TTMinerSummary {
    const ENDPOINT: &'static str = "/summary";

    fn to_metrics(&self) -> Result<PerformanceMetrics> {
        let reported = self
            .hashrate
            .as_ref()
            .and_then(|hashrate| hashrate.total.first().copied());

        let hashrate = match reported {
            Some(total) => total,
            None if !self.gpus.is_empty() => self.gpus.iter().map(|gpu| gpu.hashrate).sum(),
            None => {
                return Err(MiningError::Decode(
                    "summary has neither a hashrate total nor per-GPU hashrates".to_string(),
                ))
            }
        };

        // no per-share difficulty is exposed, so the pool difficulty stands in
        let diff = self.connection.diff;

        Ok(PerformanceMetrics {
            hashrate: hashrate.max(0.0) as u64,
            shares: self.results.shares_good,
            rejected: self
                .results
                .shares_total
                .saturating_sub(self.results.shares_good),
            uptime: self.uptime,
            algorithm: self.algo.clone(),
            diff_current: diff,
            avg_difficulty: diff,
        })
    }
}

/// TT-Miner, a GPU-only miner
pub struct TTMiner {
    base: MinerBase<TTMinerSummary>,
}

impl TTMiner {
    pub fn new(name: String, deps: &MinerDeps) -> Self {
        TTMiner {
            base: MinerBase::new(name, MinerType::TTMiner, deps),
        }
    }

    pub fn last_summary(&self) -> Option<TTMinerSummary> {
        self.base.last_summary()
    }
}

#[async_trait]
impl Miner for TTMiner {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn miner_type(&self) -> MinerType {
        MinerType::TTMiner
    }

    fn translate(&self, config: &MinerConfig, api: &ApiDescriptor) -> Invocation {
        let gpu = config.gpu_selection();
        let mut args = vec![
            "-P".to_string(),
            config.pool.clone(),
            "-u".to_string(),
            config.wallet.clone(),
            "-p".to_string(),
            config.password_or_default().to_string(),
            "-a".to_string(),
            config.algo.clone(),
            "-b".to_string(),
            api.address(),
        ];

        // without -d TT-Miner claims every GPU, so no selection means no launch
        if let GpuSelection::Devices { devices, .. } = &gpu {
            args.push("-d".to_string());
            args.push(devices.clone());
            if let Some(intensity) = config.gpu_intensity {
                args.push("-i".to_string());
                args.push(intensity.to_string());
            }
        }

        args.extend(config.extra_args.iter().cloned());

        Invocation {
            program: self.base.program().to_path_buf(),
            args,
            gpu,
            cpu_enabled: false,
        }
    }

    async fn start(&self, config: &MinerConfig) -> Result<()> {
        config.validate()?;
        let api = self.base.allocate_api(config)?;
        let invocation = self.translate(config, &api);
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
