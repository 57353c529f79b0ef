//! Simulated engine: synthetic telemetry with no process behind it.
//!
//! Useful for exercising the manager, history and event stream on machines
//! without mining binaries or hardware.

use super::{ApiDescriptor, Miner, MinerInfo, MinerStatus, MinerType};
use crate::process::Invocation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mining_core::{MinerConfig, MiningError, PerformanceMetrics, RequestContext, Result};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const MAX_LOG_LINES: usize = 100;
const REJECT_RATE: f64 = 0.02;

/// Shape of the synthetic hashrate and share stream
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedProfile {
    pub base_hashrate: u64,
    /// Relative noise around the base, 0.1 means up to 10% either way
    pub variance: f64,
    pub difficulty: u64,
    /// Time from start until the full base hashrate is reached
    pub ramp_up: Duration,
    /// Mean delay between simulated shares
    pub share_interval: Duration,
}

impl Default for SimulatedProfile {
    fn default() -> Self {
        SimulatedProfile {
            base_hashrate: 1000,
            variance: 0.1,
            difficulty: 10_000,
            ramp_up: Duration::from_secs(30),
            share_interval: Duration::from_secs(10),
        }
    }
}

impl SimulatedProfile {
    /// Named hardware presets
    pub fn preset(name: &str) -> Option<Self> {
        let (base_hashrate, variance, difficulty) = match name {
            "cpu-low" => (500, 0.15, 50_000),
            "cpu-medium" => (5_000, 0.10, 100_000),
            "cpu-high" => (15_000, 0.08, 200_000),
            "gpu-ethash" => (30_000_000, 0.05, 4_000_000_000),
            "gpu-kawpow" => (15_000_000, 0.06, 1_000_000_000),
            _ => return None,
        };
        Some(SimulatedProfile {
            base_hashrate,
            variance,
            difficulty,
            ..SimulatedProfile::default()
        })
    }

    /// Hashrate `uptime` into a run: linear ramp, slow sine drift and noise
    pub fn hashrate_at(&self, uptime: Duration, rng: &mut impl Rng) -> u64 {
        let secs = uptime.as_secs_f64();
        let ramp = if self.ramp_up.is_zero() {
            1.0
        } else {
            (secs / self.ramp_up.as_secs_f64()).min(1.0)
        };
        let drift = (secs / 10.0).sin() * 0.05;
        let noise = if self.variance > 0.0 {
            (rng.gen::<f64>() - 0.5) * 2.0 * self.variance
        } else {
            0.0
        };
        (self.base_hashrate as f64 * ramp * (1.0 + drift + noise)).max(0.0) as u64
    }

    fn jitter_difficulty(&self, rng: &mut impl Rng, spread: u64) -> u64 {
        match self.difficulty / spread {
            0 => self.difficulty,
            extra => self.difficulty + rng.gen_range(0..extra),
        }
    }

    fn next_share_delay(&self, rng: &mut impl Rng) -> Duration {
        let mean = self.share_interval.as_millis().max(2) as u64;
        Duration::from_millis(rng.gen_range(mean / 2..=mean + mean / 2))
    }
}

#[derive(Debug, Default)]
struct SimState {
    status: MinerStatus,
    config: Option<MinerConfig>,
    started_at: Option<DateTime<Utc>>,
    shares: u64,
    rejected: u64,
    metrics: Option<PerformanceMetrics>,
    logs: VecDeque<String>,
    stop: Option<CancellationToken>,
}

impl SimState {
    fn log(&mut self, line: String) {
        if self.logs.len() == MAX_LOG_LINES {
            self.logs.pop_front();
        }
        self.logs
            .push_back(format!("[{}] {}", Utc::now().format("%H:%M:%S"), line));
    }
}

pub struct SimulatedMiner {
    name: String,
    profile: SimulatedProfile,
    state: Arc<RwLock<SimState>>,
}

impl SimulatedMiner {
    pub fn new(name: String, profile: SimulatedProfile) -> Self {
        SimulatedMiner {
            name,
            profile,
            state: Arc::new(RwLock::new(SimState::default())),
        }
    }

    pub fn profile(&self) -> &SimulatedProfile {
        &self.profile
    }

    /// Accepted and rejected share counts so far
    pub fn share_counts(&self) -> (u64, u64) {
        let state = self.state.read();
        (state.shares, state.rejected)
    }

    fn spawn_share_loop(&self, stop: CancellationToken) {
        let state = self.state.clone();
        let profile = self.profile.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            loop {
                let delay = profile.next_share_delay(&mut rand::thread_rng());
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let mut rng = rand::thread_rng();
                let mut state = state.write();
                if rng.gen_bool(REJECT_RATE) {
                    state.rejected += 1;
                    state.log("Share rejected (stale)".to_string());
                } else {
                    state.shares += 1;
                    let diff = profile.jitter_difficulty(&mut rng, 2);
                    let line = format!(
                        "Share accepted ({}/{}) diff {}",
                        state.shares, state.rejected, diff
                    );
                    state.log(line);
                }
            }
            debug!("Share loop for {} finished", name);
        });
    }
}

#[async_trait]
impl Miner for SimulatedMiner {
    fn name(&self) -> &str {
        &self.name
    }

    fn miner_type(&self) -> MinerType {
        MinerType::Simulated
    }

    /// Nothing is executed; the invocation only records the resolved work
    fn translate(&self, config: &MinerConfig, _api: &ApiDescriptor) -> Invocation {
        Invocation {
            program: PathBuf::from(MinerType::Simulated.default_executable()),
            args: vec![
                "--pool".to_string(),
                config.pool.clone(),
                "--algo".to_string(),
                config.algo.clone(),
            ],
            gpu: config.gpu_selection(),
            cpu_enabled: config.cpu_enabled,
        }
    }

    async fn start(&self, config: &MinerConfig) -> Result<()> {
        config.validate()?;
        let stop = CancellationToken::new();
        {
            let mut state = self.state.write();
            if state.status != MinerStatus::Stopped {
                return Err(MiningError::MinerExists(self.name.clone()));
            }
            state.status = MinerStatus::Running;
            state.config = Some(config.clone());
            state.started_at = Some(Utc::now());
            state.shares = 0;
            state.rejected = 0;
            state.metrics = None;
            state.stop = Some(stop.clone());
            state.log("Simulated miner starting...".to_string());
            state.log(format!("Connecting to {}", config.pool));
            state.log(format!("Pool connected, algorithm: {}", config.algo));
        }

        self.spawn_share_loop(stop);
        info!("Started simulated miner {}", self.name);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let stop = {
            let mut state = self.state.write();
            if state.status != MinerStatus::Running {
                return Err(MiningError::NotRunning(self.name.clone()));
            }
            state.status = MinerStatus::Stopped;
            state.log("Miner stopped".to_string());
            state.stop.take()
        };
        if let Some(stop) = stop {
            stop.cancel();
        }
        info!("Stopped {}", self.name);
        Ok(())
    }

    async fn get_stats(&self, ctx: &RequestContext) -> Result<PerformanceMetrics> {
        if ctx.is_cancelled() {
            return Err(MiningError::Cancelled);
        }

        let mut state = self.state.write();
        if state.status != MinerStatus::Running {
            return Err(MiningError::NotRunning(self.name.clone()));
        }

        let uptime = state
            .started_at
            .and_then(|started| (Utc::now() - started).to_std().ok())
            .unwrap_or_default();
        let mut rng = rand::thread_rng();
        let avg_difficulty = if state.shares > 0 {
            self.profile.jitter_difficulty(&mut rng, 4)
        } else {
            self.profile.difficulty
        };
        let metrics = PerformanceMetrics {
            hashrate: self.profile.hashrate_at(uptime, &mut rng),
            shares: state.shares,
            rejected: state.rejected,
            uptime: uptime.as_secs(),
            algorithm: state.config.as_ref().map(|c| c.algo.clone()).unwrap_or_default(),
            diff_current: self.profile.jitter_difficulty(&mut rng, 2),
            avg_difficulty,
        };
        state.metrics = Some(metrics.clone());
        Ok(metrics)
    }

    fn logs(&self) -> Vec<String> {
        self.state.read().logs.iter().cloned().collect()
    }

    fn is_running(&self) -> bool {
        self.state.read().status == MinerStatus::Running
    }

    fn info(&self) -> MinerInfo {
        let state = self.state.read();
        MinerInfo {
            name: self.name.clone(),
            miner_type: MinerType::Simulated,
            status: state.status,
            running: state.status == MinerStatus::Running,
            api: ApiDescriptor::default(),
            pool: state.config.as_ref().map(|c| c.pool.clone()),
            algo: state.config.as_ref().map(|c| c.algo.clone()),
            started_at: state.started_at,
            metrics: state.metrics.clone(),
            idle: false,
        }
    }
}
