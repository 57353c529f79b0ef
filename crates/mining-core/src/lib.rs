mod circuit_breaker;
mod config;
mod context;
mod error;
mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{is_valid_cli_arg, sanitize_instance_name, GpuBackend, GpuSelection, MinerConfig};
pub use context::RequestContext;
pub use error::{ErrorKind, MiningError, Result};
pub use metrics::{HashratePoint, PerformanceMetrics};

/// Upper bound for a single telemetry poll when the caller sets no tighter deadline
pub const STATS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
