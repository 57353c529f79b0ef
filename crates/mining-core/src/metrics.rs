use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine-agnostic telemetry derived from one poll of a miner's API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Hashes per second
    pub hashrate: u64,
    /// Accepted shares
    pub shares: u64,
    /// Rejected shares
    pub rejected: u64,
    /// Seconds since the engine started
    pub uptime: u64,
    pub algorithm: String,
    pub diff_current: u64,
    pub avg_difficulty: u64,
}

impl PerformanceMetrics {
    /// Fraction of submitted shares that were rejected
    pub fn reject_ratio(&self) -> f64 {
        let total = self.shares + self.rejected;
        if total == 0 {
            0.0
        } else {
            self.rejected as f64 / total as f64
        }
    }
}

/// Single hashrate sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashratePoint {
    pub timestamp: DateTime<Utc>,
    pub hashrate: u64,
}

impl HashratePoint {
    pub fn new(timestamp: DateTime<Utc>, hashrate: u64) -> Self {
        HashratePoint { timestamp, hashrate }
    }

    pub fn now(hashrate: u64) -> Self {
        HashratePoint::new(Utc::now(), hashrate)
    }
}
