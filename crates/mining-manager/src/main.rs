use clap::Parser;
use mining_core::RequestContext;
use mining_events::EventHub;
use mining_manager::config::MonitoringConfig;
use mining_manager::{
    api::create_router, DaemonConfig, InMemoryHistory, Manager, ManagerMetrics, MinerDeps,
    MinerFactory, MinerType, ProcessLauncher, ReleaseChecker, SystemLauncher,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mining-daemon")]
#[command(about = "Mining worker orchestrator", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mining.yaml")]
    config: String,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,
}

fn init_tracing(monitoring: &MonitoringConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&monitoring.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if monitoring.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_found = std::path::Path::new(&args.config).exists();
    let mut config = DaemonConfig::load_or_default(&args.config)?;

    // Override with CLI args
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    init_tracing(&config.monitoring);
    if !config_found {
        tracing::warn!("Config file {} not found, using defaults", args.config);
    }
    tracing::info!("Starting mining daemon with config: {:?}", config);

    // Shared HTTP client for telemetry polls and release checks
    let http = reqwest::Client::builder()
        .user_agent(concat!("mining-daemon/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let launcher: Arc<dyn ProcessLauncher> = Arc::new(SystemLauncher::new());
    let mut deps = MinerDeps::new(launcher, http.clone());
    deps.api_host = config.manager.api_host.clone();
    deps.binaries = config.manager.binaries.clone();

    let history = Arc::new(InMemoryHistory::new(
        config.history.high_res_window(),
        config.history.retention(),
    ));
    let metrics = Arc::new(ManagerMetrics::new()?);
    let manager = Arc::new(
        Manager::new(MinerFactory::new(deps), history, metrics)
            .with_history_window(config.history.retention())
            .with_stats_timeout(config.manager.stats_timeout()),
    );

    // Event hub
    let hub = EventHub::with_config(config.hub_config());
    let hub_task = hub.spawn();
    manager.set_event_hub(hub.clone());
    manager.start_stats_collection(config.manager.stats_interval());

    for entry in &config.autostart {
        if let Err(e) = manager.start_miner(&entry.miner_type, &entry.config).await {
            tracing::error!("Autostart of {} failed: {}", entry.miner_type, e);
        }
    }

    // Release check, once at startup
    let checker = ReleaseChecker::new(
        http,
        config.release_check.api_base.clone(),
        config.release_breaker_config(),
    );
    tokio::spawn(async move {
        let ctx = RequestContext::with_timeout(Duration::from_secs(30));
        for miner_type in MinerType::ALL {
            let Some((owner, repo)) = miner_type.release_repo() else {
                continue;
            };
            match checker.latest_version(owner, repo, &ctx).await {
                Ok(tag) => tracing::info!("Latest {} release: {}", miner_type, tag),
                Err(e) => tracing::warn!("Could not check {} releases: {}", miner_type, e),
            }
        }
    });

    // HTTP server
    let app = create_router(manager.clone(), hub.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let shutdown_manager = manager.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            let report = shutdown_manager.stop().await;
            for (name, e) in &report.failed {
                tracing::error!("Miner {} did not stop cleanly: {}", name, e);
            }
        })
        .await?;

    let _ = hub_task.await;
    tracing::info!("Mining daemon stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
