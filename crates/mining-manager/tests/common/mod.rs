// Shared fixtures for the mining-manager integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{extract::State, routing::get, Json, Router};
use mining_core::{MinerConfig, MiningError, Result};
use mining_events::{Event, EventType, Subscription};
use mining_manager::{
    InMemoryHistory, Invocation, Manager, ManagerMetrics, MinerDeps, MinerFactory, ProcessHandle,
    ProcessLauncher,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Launcher that records invocations instead of running processes
#[derive(Default)]
pub struct FakeLauncher {
    pub spawns: AtomicUsize,
    pub terminations: AtomicUsize,
    pub fail_spawn: AtomicBool,
    pub fail_terminate: AtomicBool,
    pub invocations: Mutex<Vec<Invocation>>,
    alive: Mutex<HashMap<uuid::Uuid, bool>>,
    spawn_delay: Mutex<Option<Duration>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeLauncher::default())
    }

    pub fn set_spawn_delay(&self, delay: Duration) {
        *self.spawn_delay.lock() = Some(delay);
    }

    /// Mark every spawned process as exited
    pub fn kill_all(&self) {
        for alive in self.alive.lock().values_mut() {
            *alive = false;
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn last_invocation(&self) -> Option<Invocation> {
        self.invocations.lock().last().cloned()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, name: &str, invocation: &Invocation) -> Result<ProcessHandle> {
        let delay = *self.spawn_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.invocations.lock().push(invocation.clone());

        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(MiningError::StartFailed {
                name: name.to_string(),
                reason: "executable not found".to_string(),
            });
        }

        let handle = ProcessHandle::new(name, Some(4242));
        self.alive.lock().insert(handle.id, true);
        Ok(handle)
    }

    async fn terminate(&self, handle: &ProcessHandle) -> Result<()> {
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(MiningError::StopFailed {
                name: handle.name.clone(),
                reason: "process ignored SIGKILL".to_string(),
            });
        }
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.alive.lock().remove(&handle.id);
        Ok(())
    }

    fn is_alive(&self, handle: &ProcessHandle) -> bool {
        self.alive.lock().get(&handle.id).copied().unwrap_or(false)
    }

    fn recent_logs(&self, handle: &ProcessHandle) -> Vec<String> {
        vec![format!("[{}] miner ready", handle.name)]
    }
}

pub fn manager_with(launcher: Arc<FakeLauncher>) -> Arc<Manager> {
    let deps = MinerDeps::new(launcher, reqwest::Client::new());
    let history = Arc::new(InMemoryHistory::default());
    let metrics = Arc::new(ManagerMetrics::new().unwrap());
    Arc::new(Manager::new(MinerFactory::new(deps), history, metrics))
}

pub fn cpu_config(name: &str) -> MinerConfig {
    MinerConfig::new("stratum+tcp://pool.example.com:3333", "4AdUndXHHZ6cfufTMvppY6JwXNouMBzSkbLYfpAV5Usx", "rx/0")
        .with_name(name)
}

/// Fake miner telemetry API counting every request it serves
pub struct TelemetryServer {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl TelemetryServer {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub fn xmrig_summary() -> Value {
    json!({
        "id": "abc",
        "worker_id": "rig-1",
        "version": "6.21.0",
        "uptime": 120,
        "algo": "rx/0",
        "hashrate": { "total": [1234.5, 1200.0, null], "highest": 1300.0 },
        "results": {
            "diff_current": 5000,
            "shares_good": 10,
            "shares_total": 12,
            "avg_time": 30,
            "hashes_total": 50000
        },
        "connection": { "pool": "pool.example.com:3333", "ping": 20, "diff": 5000 }
    })
}

pub fn ttminer_summary() -> Value {
    json!({
        "name": "TT-Miner",
        "version": "2023.1.0",
        "uptime": 300,
        "algo": "KAWPOW",
        "gpus": [
            { "name": "RTX 3080", "id": 0, "hashrate": 40000000.0 },
            { "name": "RTX 3080", "id": 1, "hashrate": 2000000.0 }
        ],
        "results": { "shares_good": 7, "shares_total": 8, "avg_time": 40 },
        "connection": { "pool": "kawpow.example.com:4444", "ping": 30, "diff": 1200 }
    })
}

async fn xmrig_route(State(hits): State<Arc<AtomicUsize>>) -> Json<Value> {
    hits.fetch_add(1, Ordering::SeqCst);
    Json(xmrig_summary())
}

async fn ttminer_route(State(hits): State<Arc<AtomicUsize>>) -> Json<Value> {
    hits.fetch_add(1, Ordering::SeqCst);
    Json(ttminer_summary())
}

pub async fn spawn_telemetry_server() -> TelemetryServer {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/2/summary", get(xmrig_route))
        .route("/summary", get(ttminer_route))
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TelemetryServer { addr, hits }
}

/// Next event of `event_type`, skipping anything else queued before it
pub async fn recv_until(sub: &mut Subscription, event_type: EventType) -> Arc<Event> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = sub.recv().await.expect("subscription closed");
            if event.event_type == event_type {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
