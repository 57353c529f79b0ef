pub mod api;
pub mod config;
pub mod history;
pub mod manager;
pub mod metrics;
pub mod miner;
pub mod process;
pub mod release;
pub mod stats;

pub use config::DaemonConfig;
pub use history::{HistoryStore, InMemoryHistory, TimeRange};
pub use manager::{Manager, ShutdownReport};
pub use metrics::ManagerMetrics;
pub use miner::{
    available_miners, ApiDescriptor, AvailableMiner, Miner, MinerDeps, MinerFactory, MinerInfo,
    MinerStatus, MinerType, SimulatedMiner, SimulatedProfile,
};
pub use process::{Invocation, ProcessHandle, ProcessLauncher, SystemLauncher};
pub use release::ReleaseChecker;
