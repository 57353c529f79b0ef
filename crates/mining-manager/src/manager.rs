//! Registry of running miners and their lifecycle.
//!
//! Two lock levels: the registry lock covers membership only (insert,
//! remove, lookup, list), each miner's own lock covers its state. Neither is
//! held across process or network I/O.

use crate::history::{HistoryStore, TimeRange};
use crate::metrics::ManagerMetrics;
use crate::miner::{available_miners, AvailableMiner, Miner, MinerFactory, MinerStatus};
use futures::future::join_all;
use mining_core::{HashratePoint, MinerConfig, MiningError, PerformanceMetrics, RequestContext, Result};
use mining_events::{Event, EventHub, EventType, MinerEventData, MinerStatsData};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of [`Manager::stop`]
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub failed: Vec<(String, MiningError)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Manager {
    miners: RwLock<HashMap<String, Arc<dyn Miner>>>,
    factory: MinerFactory,
    history: Arc<dyn HistoryStore>,
    history_window: Duration,
    hub: RwLock<Option<EventHub>>,
    metrics: Arc<ManagerMetrics>,
    stats_timeout: Duration,
    shutdown: CancellationToken,
    stopped: AtomicBool,
    stats_task: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(
        factory: MinerFactory,
        history: Arc<dyn HistoryStore>,
        metrics: Arc<ManagerMetrics>,
    ) -> Self {
        Manager {
            miners: RwLock::new(HashMap::new()),
            factory,
            history,
            history_window: Duration::from_secs(24 * 3600),
            hub: RwLock::new(None),
            metrics,
            stats_timeout: mining_core::STATS_TIMEOUT,
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            stats_task: Mutex::new(None),
        }
    }

    /// How far back hashrate history queries reach
    pub fn with_history_window(mut self, window: Duration) -> Self {
        self.history_window = window;
        self
    }

    /// Per-poll bound for periodic stats collection
    pub fn with_stats_timeout(mut self, timeout: Duration) -> Self {
        self.stats_timeout = timeout;
        self
    }

    /// Route lifecycle and stats events to `hub`, which also gets this
    /// manager's snapshot for the initial `state.sync` of each subscriber.
    pub fn set_event_hub(self: &Arc<Self>, hub: EventHub) {
        let manager = Arc::downgrade(self);
        hub.set_state_provider(move || match manager.upgrade() {
            Some(manager) => manager.state_snapshot(),
            None => json!({ "miners": [] }),
        });
        *self.hub.write() = Some(hub);
    }

    pub fn metrics(&self) -> Arc<ManagerMetrics> {
        self.metrics.clone()
    }

    /// Render metrics in the Prometheus text format
    pub fn metrics_text(&self) -> anyhow::Result<String> {
        if let Some(hub) = self.hub.read().as_ref() {
            self.metrics
                .events_dropped
                .set(hub.dropped_events().min(i64::MAX as u64) as i64);
        }
        self.metrics.render()
    }

    fn emit(&self, event: Event) {
        if let Some(hub) = self.hub.read().as_ref() {
            hub.broadcast(event);
        }
    }

    fn emit_miner(&self, event_type: EventType, data: MinerEventData) {
        self.emit(Event::with_data(event_type, &data));
    }

    fn update_running_gauge(&self) {
        let count = self.miners.read().len();
        self.metrics.miners_running.set(count as i64);
    }

    /// Validate, register and start a miner.
    ///
    /// The name is reserved in the registry before the process is spawned,
    /// so of two concurrent starts for one name exactly one proceeds. A
    /// failed start removes the reservation again.
    pub async fn start_miner(&self, miner_type: &str, config: &MinerConfig) -> Result<Arc<dyn Miner>> {
        if self.is_stopped() {
            self.metrics.inc_starts(miner_type, "shutdown");
            return Err(MiningError::ShuttingDown);
        }
        let miner = match self.factory.create(miner_type, config) {
            Ok(miner) => miner,
            Err(e) => {
                self.metrics.inc_starts(miner_type, "invalid");
                return Err(e);
            }
        };
        let name = miner.name().to_string();
        let type_label = miner.miner_type().as_str();

        {
            let mut miners = self.miners.write();
            // stop() may have drained the registry since the check above
            if self.is_stopped() {
                self.metrics.inc_starts(type_label, "shutdown");
                return Err(MiningError::ShuttingDown);
            }
            if miners.contains_key(&name) {
                self.metrics.inc_starts(type_label, "conflict");
                return Err(MiningError::MinerExists(name));
            }
            miners.insert(name.clone(), miner.clone());
        }

        let data = MinerEventData {
            name: name.clone(),
            miner_type: Some(type_label.to_string()),
            pool: Some(config.pool.clone()),
            ..Default::default()
        };
        self.emit_miner(EventType::MinerStarting, data.clone());

        match miner.start(config).await {
            Ok(()) => {
                info!("Started miner {} ({})", name, type_label);
                self.metrics.inc_starts(type_label, "ok");
                self.update_running_gauge();
                self.emit_miner(EventType::MinerStarted, data);
                Ok(miner)
            }
            Err(e) => {
                {
                    let mut miners = self.miners.write();
                    if miners.get(&name).is_some_and(|m| Arc::ptr_eq(m, &miner)) {
                        miners.remove(&name);
                    }
                }
                error!("Failed to start miner {}: {}", name, e);
                self.metrics.inc_starts(type_label, "error");
                self.emit_miner(
                    EventType::MinerError,
                    MinerEventData {
                        error: Some(e.to_string()),
                        ..data
                    },
                );
                Err(e)
            }
        }
    }

    /// Stop a miner and remove it from the registry. A miner whose stop
    /// fails stays registered.
    pub async fn stop_miner(&self, name: &str) -> Result<()> {
        let miner = self.get_miner(name)?;
        let data = MinerEventData {
            name: name.to_string(),
            miner_type: Some(miner.miner_type().as_str().to_string()),
            ..Default::default()
        };

        self.emit_miner(EventType::MinerStopping, data.clone());

        if let Err(e) = miner.stop().await {
            error!("Failed to stop miner {}: {}", name, e);
            self.emit_miner(
                EventType::MinerError,
                MinerEventData {
                    error: Some(e.to_string()),
                    ..data
                },
            );
            // a process the launcher released is gone either way
            if !miner.is_running() {
                self.deregister(name, &miner);
            }
            return Err(e);
        }

        self.deregister(name, &miner);
        info!("Stopped miner {}", name);
        self.emit_miner(
            EventType::MinerStopped,
            MinerEventData {
                reason: Some("stopped".to_string()),
                ..data
            },
        );
        Ok(())
    }

    fn deregister(&self, name: &str, miner: &Arc<dyn Miner>) {
        {
            let mut miners = self.miners.write();
            if miners.get(name).is_some_and(|m| Arc::ptr_eq(m, miner)) {
                miners.remove(name);
            }
        }
        self.history.remove(name);
        self.metrics.remove_miner(name);
        self.update_running_gauge();
    }

    pub fn get_miner(&self, name: &str) -> Result<Arc<dyn Miner>> {
        self.miners
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MiningError::MinerNotFound(name.to_string()))
    }

    /// Snapshot of every registered miner, ordered by name
    pub fn list_miners(&self) -> Vec<Arc<dyn Miner>> {
        let mut miners: Vec<Arc<dyn Miner>> = self.miners.read().values().cloned().collect();
        miners.sort_by(|a, b| a.name().cmp(b.name()));
        miners
    }

    pub fn list_available_miners(&self) -> Vec<AvailableMiner> {
        available_miners()
    }

    pub fn get_miner_hashrate_history(&self, name: &str) -> Result<Vec<HashratePoint>> {
        self.get_miner(name)?;
        self.history.query(name, TimeRange::last(self.history_window))
    }

    pub fn get_miner_logs(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.get_miner(name)?.logs())
    }

    /// Poll one miner now
    pub async fn get_miner_stats(&self, name: &str, ctx: &RequestContext) -> Result<PerformanceMetrics> {
        let miner = self.get_miner(name)?;
        self.poll_miner(&miner, ctx).await
    }

    async fn poll_miner(&self, miner: &Arc<dyn Miner>, ctx: &RequestContext) -> Result<PerformanceMetrics> {
        let name = miner.name();
        match miner.get_stats(ctx).await {
            Ok(metrics) => {
                self.metrics.inc_polls("ok");
                self.metrics.set_hashrate(name, metrics.hashrate);

                if let Err(e) = self.history.record(name, HashratePoint::now(metrics.hashrate)) {
                    warn!("Failed to record hashrate for {}: {}", name, e);
                }

                self.emit(Event::with_data(
                    EventType::MinerStats,
                    &MinerStatsData {
                        name: name.to_string(),
                        hashrate: metrics.hashrate,
                        shares: metrics.shares,
                        rejected: metrics.rejected,
                        uptime: metrics.uptime,
                        algorithm: metrics.algorithm.clone(),
                        diff_current: metrics.diff_current,
                    },
                ));
                Ok(metrics)
            }
            Err(e) => {
                self.metrics.inc_polls("error");
                debug!("Stats poll for {} failed: {}", name, e);
                Err(e)
            }
        }
    }

    /// Poll every running miner once, concurrently
    pub async fn collect_stats(&self) {
        let miners: Vec<Arc<dyn Miner>> = self
            .list_miners()
            .into_iter()
            .filter(|miner| miner.is_running())
            .collect();

        let polls = miners.iter().map(|miner| {
            let ctx = RequestContext::child_of(&self.shutdown).with_deadline_in(self.stats_timeout);
            async move { self.poll_miner(miner, &ctx).await }
        });
        join_all(polls).await;
    }

    /// Spawn the periodic stats loop. It ends on [`Manager::stop`].
    pub fn start_stats_collection(self: &Arc<Self>, interval: Duration) {
        let mut slot = self.stats_task.lock();
        if slot.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let manager = Arc::downgrade(self);
        let token = self.shutdown.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.collect_stats().await;
            }
            debug!("Stats collection stopped");
        }));
        info!("Stats collection started (every {:?})", interval);
    }

    /// Cached view of every miner for the initial `state.sync`. Performs no I/O.
    pub fn state_snapshot(&self) -> Value {
        let miners: Vec<Value> = self
            .list_miners()
            .iter()
            .map(|miner| {
                let info = miner.info();
                let status = match (info.running, info.status) {
                    (true, _) if info.idle => "idle",
                    (true, _) => "running",
                    (false, MinerStatus::Running) => "exited",
                    (false, status) => status.as_str(),
                };
                let metrics = info.metrics.unwrap_or_default();
                json!({
                    "name": info.name,
                    "status": status,
                    "hashrate": metrics.hashrate,
                    "shares": metrics.shares,
                    "rejected": metrics.rejected,
                    "uptime": metrics.uptime,
                })
            })
            .collect();

        json!({ "miners": miners })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop every miner, the stats loop and the event hub. Individual
    /// failures are collected, not fatal. Later calls do nothing.
    pub async fn stop(&self) -> ShutdownReport {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }
        info!("Manager shutting down");

        self.shutdown.cancel();
        let stats_task = self.stats_task.lock().take();
        if let Some(task) = stats_task {
            let _ = task.await;
        }

        let names: Vec<String> = self
            .list_miners()
            .iter()
            .map(|miner| miner.name().to_string())
            .collect();
        let results = join_all(names.iter().map(|name| self.stop_miner(name))).await;

        let mut report = ShutdownReport::default();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => report.stopped.push(name),
                Err(e) => report.failed.push((name, e)),
            }
        }

        let hub = self.hub.read().clone();
        if let Some(hub) = hub {
            hub.stop();
        }

        if report.is_clean() {
            info!("Manager stopped {} miners", report.stopped.len());
        } else {
            warn!(
                "Manager stopped {} miners, {} failed",
                report.stopped.len(),
                report.failed.len()
            );
        }
        report
    }
}
