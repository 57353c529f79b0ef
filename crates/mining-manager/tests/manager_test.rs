// Integration tests for miner lifecycle through the Manager

mod common;

use common::{cpu_config, manager_with, recv_until, spawn_telemetry_server, FakeLauncher};
use mining_core::{GpuBackend, MinerConfig, MiningError, RequestContext};
use mining_events::{EventHub, EventType};
use mining_manager::{Miner, MinerStatus, MinerType};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_start_list_stop_miner() {
    let launcher = FakeLauncher::new();
    let manager = manager_with(launcher.clone());

    let miner = manager.start_miner("xmrig", &cpu_config("m1")).await.unwrap();
    assert_eq!(miner.name(), "m1");
    assert_eq!(launcher.spawn_count(), 1);

    let miners = manager.list_miners();
    assert_eq!(miners.len(), 1);
    assert!(miners[0].is_running());
    assert_eq!(miners[0].info().status, MinerStatus::Running);

    manager.stop_miner("m1").await.unwrap();
    assert!(matches!(
        manager.get_miner("m1"),
        Err(MiningError::MinerNotFound(_))
    ));
    assert!(manager.list_miners().is_empty());
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_duplicate_start() {
    let launcher = FakeLauncher::new();
    launcher.set_spawn_delay(Duration::from_millis(50));
    let manager = manager_with(launcher.clone());
    let config = cpu_config("dup");

    let (first, second) = tokio::join!(
        manager.start_miner("xmrig", &config),
        manager.start_miner("xmrig", &config)
    );

    let results = [first, second];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(MiningError::MinerExists(_))))
        .count();
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 1);
    assert_eq!(launcher.spawn_count(), 1);
    assert_eq!(manager.list_miners().len(), 1);
}

#[tokio::test]
async fn test_start_failure_rolls_back() {
    let launcher = FakeLauncher::new();
    launcher.fail_spawn.store(true, Ordering::SeqCst);
    let manager = manager_with(launcher.clone());

    let hub = EventHub::new();
    let hub_task = hub.spawn();
    manager.set_event_hub(hub.clone());
    let mut sub = hub.connect().await.unwrap();

    // initial snapshot
    let sync = sub.recv().await.unwrap();
    assert_eq!(sync.event_type, EventType::StateSync);

    let result = manager.start_miner("xmrig", &cpu_config("broken")).await;
    assert!(matches!(result, Err(MiningError::StartFailed { .. })));
    assert!(matches!(
        manager.get_miner("broken"),
        Err(MiningError::MinerNotFound(_))
    ));

    let starting = sub.recv().await.unwrap();
    assert_eq!(starting.event_type, EventType::MinerStarting);
    let failed = sub.recv().await.unwrap();
    assert_eq!(failed.event_type, EventType::MinerError);
    assert_eq!(failed.miner_name(), Some("broken"));

    // the name is free again
    launcher.fail_spawn.store(false, Ordering::SeqCst);
    manager.start_miner("xmrig", &cpu_config("broken")).await.unwrap();

    hub.stop();
    hub_task.await.unwrap();
}

#[tokio::test]
async fn test_invalid_requests_spawn_nothing() {
    let launcher = FakeLauncher::new();
    let manager = manager_with(launcher.clone());

    let unsupported = manager.start_miner("cgminer", &cpu_config("x")).await;
    assert!(matches!(unsupported, Err(MiningError::UnsupportedMiner(_))));

    let mut missing_pool = cpu_config("y");
    missing_pool.pool.clear();
    let invalid = manager.start_miner("xmrig", &missing_pool).await;
    assert!(matches!(invalid, Err(MiningError::InvalidConfig(_))));

    assert_eq!(launcher.spawn_count(), 0);
    assert!(manager.list_miners().is_empty());
}

#[tokio::test]
async fn test_gpu_without_devices_registers_idle() {
    let server = spawn_telemetry_server().await;
    let launcher = FakeLauncher::new();
    let manager = manager_with(launcher.clone());

    // GPU requested without devices: TT-Miner has nothing to run on
    let mut gpu_only = cpu_config("tt");
    gpu_only.gpu_enabled = true;
    gpu_only.gpu_backend = Some(GpuBackend::Cuda);
    gpu_only.http_port = Some(server.port());
    let miner = manager.start_miner("tt-miner", &gpu_only).await.unwrap();

    assert_eq!(launcher.spawn_count(), 0);
    assert!(miner.is_running());
    assert!(miner.info().idle);
    assert_eq!(manager.list_miners().len(), 1);
    assert_eq!(manager.state_snapshot()["miners"][0]["status"], "idle");

    let metrics = manager
        .get_miner_stats("tt", &RequestContext::background())
        .await
        .unwrap();
    assert_eq!(metrics.hashrate, 0);
    assert_eq!(metrics.shares, 0);
    assert_eq!(server.hit_count(), 0);

    // XMRig with CPU off as well ends up the same way
    let mut nothing = cpu_config("x").with_gpu(GpuBackend::OpenCl, None);
    nothing.cpu_enabled = false;
    manager.start_miner("xmrig", &nothing).await.unwrap();
    assert_eq!(launcher.spawn_count(), 0);

    manager.stop_miner("tt").await.unwrap();
    manager.stop_miner("x").await.unwrap();
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 0);
    assert!(manager.list_miners().is_empty());
}

#[tokio::test]
async fn test_gpu_devices_reach_invocation() {
    let launcher = FakeLauncher::new();
    let manager = manager_with(launcher.clone());

    let config = cpu_config("tt").with_gpu(GpuBackend::Cuda, Some("0,1"));
    manager.start_miner("tt-miner", &config).await.unwrap();

    let invocation = launcher.last_invocation().unwrap();
    assert_eq!(invocation.flag_value("-d"), Some("0,1"));
    assert!(invocation.gpu.is_enabled());

    let cpu_only = cpu_config("cpu");
    manager.start_miner("xmrig", &cpu_only).await.unwrap();
    let invocation = launcher.last_invocation().unwrap();
    assert!(!invocation.has_flag("--cuda"));
    assert!(!invocation.has_flag("--opencl"));
}

#[tokio::test]
async fn test_stop_failure_keeps_miner() {
    let launcher = FakeLauncher::new();
    let manager = manager_with(launcher.clone());
    manager.start_miner("xmrig", &cpu_config("stubborn")).await.unwrap();

    launcher.fail_terminate.store(true, Ordering::SeqCst);
    let result = manager.stop_miner("stubborn").await;
    assert!(matches!(result, Err(MiningError::StopFailed { .. })));

    let miner = manager.get_miner("stubborn").unwrap();
    assert!(miner.is_running());

    launcher.fail_terminate.store(false, Ordering::SeqCst);
    manager.stop_miner("stubborn").await.unwrap();
    assert!(manager.get_miner("stubborn").is_err());
}

#[tokio::test]
async fn test_failed_stop_of_dead_process_deregisters() {
    let launcher = FakeLauncher::new();
    let manager = manager_with(launcher.clone());
    manager.start_miner("xmrig", &cpu_config("gone")).await.unwrap();

    launcher.kill_all();
    launcher.fail_terminate.store(true, Ordering::SeqCst);
    let result = manager.stop_miner("gone").await;
    assert!(matches!(result, Err(MiningError::StopFailed { .. })));
    assert!(matches!(
        manager.get_miner("gone"),
        Err(MiningError::MinerNotFound(_))
    ));
}

#[tokio::test]
async fn test_stop_unknown_miner() {
    let manager = manager_with(FakeLauncher::new());
    assert!(matches!(
        manager.stop_miner("ghost").await,
        Err(MiningError::MinerNotFound(_))
    ));
}

#[tokio::test]
async fn test_exited_process_not_running() {
    let launcher = FakeLauncher::new();
    let manager = manager_with(launcher.clone());
    let miner = manager.start_miner("xmrig", &cpu_config("m1")).await.unwrap();
    assert!(miner.is_running());

    launcher.kill_all();
    assert!(!miner.is_running());

    let snapshot = manager.state_snapshot();
    assert_eq!(snapshot["miners"][0]["status"], "exited");
}

#[tokio::test]
async fn test_stats_history_and_event() {
    let server = spawn_telemetry_server().await;
    let launcher = FakeLauncher::new();
    let manager = manager_with(launcher.clone());

    let hub = EventHub::new();
    let hub_task = hub.spawn();
    manager.set_event_hub(hub.clone());

    let mut config = cpu_config("m1");
    config.http_port = Some(server.port());
    manager.start_miner("xmrig", &config).await.unwrap();

    let mut sub = hub.connect().await.unwrap();
    let sync = sub.recv().await.unwrap();
    assert_eq!(sync.event_type, EventType::StateSync);
    assert_eq!(sync.data.as_ref().unwrap()["miners"][0]["name"], "m1");

    let ctx = RequestContext::with_timeout(Duration::from_secs(5));
    let metrics = manager.get_miner_stats("m1", &ctx).await.unwrap();
    assert_eq!(metrics.hashrate, 1234);
    assert_eq!(metrics.shares, 10);
    assert_eq!(metrics.rejected, 2);
    assert_eq!(metrics.avg_difficulty, 5000);
    assert_eq!(server.hit_count(), 1);

    let history = manager.get_miner_hashrate_history("m1").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].hashrate, 1234);

    let stats = recv_until(&mut sub, EventType::MinerStats).await;
    assert_eq!(stats.data.as_ref().unwrap()["hashrate"], 1234);

    // the periodic collector polls running miners too
    manager.collect_stats().await;
    assert_eq!(server.hit_count(), 2);
    assert_eq!(manager.get_miner_hashrate_history("m1").unwrap().len(), 2);

    let text = manager.metrics_text().unwrap();
    assert!(text.contains("m1"));

    manager.stop_miner("m1").await.unwrap();
    assert!(manager.get_miner_hashrate_history("m1").is_err());

    hub.stop();
    hub_task.await.unwrap();
}

#[tokio::test]
async fn test_ttminer_stats_from_gpus() {
    let server = spawn_telemetry_server().await;
    let manager = manager_with(FakeLauncher::new());

    let mut config = cpu_config("tt").with_gpu(GpuBackend::Cuda, Some("0"));
    config.http_port = Some(server.port());
    manager.start_miner("tt-miner", &config).await.unwrap();

    let metrics = manager
        .get_miner_stats("tt", &RequestContext::background())
        .await
        .unwrap();
    assert_eq!(metrics.hashrate, 42_000_000);
    assert_eq!(metrics.diff_current, 1200);
    assert_eq!(metrics.avg_difficulty, 1200);
    assert_eq!(metrics.rejected, 1);
}

#[tokio::test]
async fn test_stats_on_stopped_miner_makes_no_request() {
    let server = spawn_telemetry_server().await;
    let launcher = FakeLauncher::new();
    let manager = manager_with(launcher.clone());

    let mut config = cpu_config("m1");
    config.http_port = Some(server.port());
    let miner = manager.start_miner("xmrig", &config).await.unwrap();
    manager.stop_miner("m1").await.unwrap();

    let result = miner.get_stats(&RequestContext::background()).await;
    assert!(matches!(result, Err(MiningError::NotRunning(_))));
    assert_eq!(server.hit_count(), 0);
}

#[tokio::test]
async fn test_cancelled_context_skips_poll() {
    let server = spawn_telemetry_server().await;
    let manager = manager_with(FakeLauncher::new());

    let mut config = cpu_config("m1");
    config.http_port = Some(server.port());
    manager.start_miner("xmrig", &config).await.unwrap();

    let ctx = RequestContext::background();
    ctx.cancel();
    let result = manager.get_miner_stats("m1", &ctx).await;
    assert!(matches!(result, Err(MiningError::Cancelled)));
    assert_eq!(server.hit_count(), 0);
}

#[tokio::test]
async fn test_unreachable_api_is_connection_error() {
    let manager = manager_with(FakeLauncher::new());

    // bind then release a port so nothing listens on it
    let port = mining_manager::miner::free_port("127.0.0.1").unwrap();
    let mut config = cpu_config("m1");
    config.http_port = Some(port);
    manager.start_miner("xmrig", &config).await.unwrap();

    let ctx = RequestContext::with_timeout(Duration::from_secs(5));
    let result = manager.get_miner_stats("m1", &ctx).await;
    assert!(matches!(
        result,
        Err(MiningError::Connection(_)) | Err(MiningError::Timeout(_))
    ));
}

#[tokio::test]
async fn test_logs_and_available_miners() {
    let manager = manager_with(FakeLauncher::new());
    manager.start_miner("xmrig", &cpu_config("m1")).await.unwrap();

    let logs = manager.get_miner_logs("m1").unwrap();
    assert_eq!(logs, vec!["[m1] miner ready".to_string()]);

    let available = manager.list_available_miners();
    assert!(available.iter().any(|m| m.miner_type == MinerType::XMRig));
    assert!(available.iter().any(|m| m.miner_type == MinerType::TTMiner));
    assert!(available.iter().any(|m| m.miner_type == MinerType::Simulated));
}

#[tokio::test]
async fn test_default_instance_name() {
    let manager = manager_with(FakeLauncher::new());
    let config = MinerConfig::new("pool.example.com:3333", "wallet", "rx/0");
    let miner = manager.start_miner("xmrig", &config).await.unwrap();
    assert_eq!(miner.name(), "xmrig-rx/0");
}

#[tokio::test]
async fn test_manager_stop_is_idempotent() {
    let launcher = FakeLauncher::new();
    let manager = manager_with(launcher.clone());
    let hub = EventHub::new();
    let hub_task = hub.spawn();
    manager.set_event_hub(hub.clone());
    manager.start_stats_collection(Duration::from_millis(20));

    manager.start_miner("xmrig", &cpu_config("a")).await.unwrap();
    manager.start_miner("xmrig", &cpu_config("b")).await.unwrap();

    let report = manager.stop().await;
    assert!(report.is_clean());
    assert_eq!(report.stopped, vec!["a".to_string(), "b".to_string()]);
    assert!(manager.list_miners().is_empty());
    assert!(manager.is_stopped());
    assert!(hub.is_stopped());
    hub_task.await.unwrap();

    let again = manager.stop().await;
    assert!(again.stopped.is_empty());
    assert!(again.failed.is_empty());
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_start_after_stop_rejected() {
    let launcher = FakeLauncher::new();
    let manager = manager_with(launcher.clone());
    manager.stop().await;

    let result = manager.start_miner("xmrig", &cpu_config("late")).await;
    assert!(matches!(result, Err(MiningError::ShuttingDown)));
    assert_eq!(launcher.spawn_count(), 0);
    assert!(manager.list_miners().is_empty());

    let text = manager.metrics_text().unwrap();
    assert!(text.contains("outcome=\"shutdown\""));
}

#[tokio::test]
async fn test_simulated_miner_through_manager() {
    let launcher = FakeLauncher::new();
    let manager = manager_with(launcher.clone());

    let config = MinerConfig::new("sim-pool.example.com:3333", "wallet", "rx/0").with_name("sim");
    let miner = manager.start_miner("simulated", &config).await.unwrap();
    assert_eq!(miner.miner_type(), MinerType::Simulated);
    assert!(miner.is_running());
    assert_eq!(launcher.spawn_count(), 0);

    let metrics = manager
        .get_miner_stats("sim", &RequestContext::background())
        .await
        .unwrap();
    assert_eq!(metrics.algorithm, "rx/0");
    assert_eq!(manager.get_miner_hashrate_history("sim").unwrap().len(), 1);

    let logs = manager.get_miner_logs("sim").unwrap();
    assert!(logs[0].ends_with("Simulated miner starting..."));

    manager.stop_miner("sim").await.unwrap();
    assert!(manager.list_miners().is_empty());
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_manager_stop_reports_failures() {
    let launcher = FakeLauncher::new();
    let manager = manager_with(launcher.clone());
    manager.start_miner("xmrig", &cpu_config("stuck")).await.unwrap();
    launcher.fail_terminate.store(true, Ordering::SeqCst);

    let report = manager.stop().await;
    assert!(!report.is_clean());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "stuck");
}
