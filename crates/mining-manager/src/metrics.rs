use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// Prometheus metrics for the manager
pub struct ManagerMetrics {
    pub registry: Registry,

    // Lifecycle
    pub miners_running: IntGauge,
    pub miner_starts_total: IntCounterVec,

    // Telemetry
    pub stats_polls_total: IntCounterVec,
    pub hashrate: IntGaugeVec,

    // Event hub
    pub events_dropped: IntGauge,
}

impl ManagerMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let miners_running = IntGauge::new("mining_miners_running", "Number of registered miners")?;
        registry.register(Box::new(miners_running.clone()))?;

        let miner_starts_total = IntCounterVec::new(
            Opts::new("mining_miner_starts_total", "Miner start attempts by type and outcome"),
            &["miner_type", "outcome"],
        )?;
        registry.register(Box::new(miner_starts_total.clone()))?;

        let stats_polls_total = IntCounterVec::new(
            Opts::new("mining_stats_polls_total", "Telemetry polls by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(stats_polls_total.clone()))?;

        let hashrate = IntGaugeVec::new(
            Opts::new("mining_hashrate", "Last polled hashrate in H/s"),
            &["miner"],
        )?;
        registry.register(Box::new(hashrate.clone()))?;

        let events_dropped = IntGauge::new(
            "mining_events_dropped",
            "Events dropped by the event hub because a queue was full",
        )?;
        registry.register(Box::new(events_dropped.clone()))?;

        Ok(ManagerMetrics {
            registry,
            miners_running,
            miner_starts_total,
            stats_polls_total,
            hashrate,
            events_dropped,
        })
    }

    /// Count a start attempt
    pub fn inc_starts(&self, miner_type: &str, outcome: &str) {
        self.miner_starts_total
            .with_label_values(&[miner_type, outcome])
            .inc();
    }

    /// Count a telemetry poll
    pub fn inc_polls(&self, outcome: &str) {
        self.stats_polls_total.with_label_values(&[outcome]).inc();
    }

    pub fn set_hashrate(&self, miner: &str, hashrate: u64) {
        self.hashrate
            .with_label_values(&[miner])
            .set(hashrate.min(i64::MAX as u64) as i64);
    }

    /// Forget the per-miner series of a stopped miner
    pub fn remove_miner(&self, miner: &str) {
        let _ = self.hashrate.remove_label_values(&[miner]);
    }

    /// Render the registry in the text exposition format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
