//! Hashrate history.
//!
//! Recent samples are kept at full resolution. Once a whole minute has aged
//! past the high-resolution window its samples collapse into one averaged
//! point, and averaged points are dropped after the retention window.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use mining_core::{HashratePoint, MiningError, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Inclusive time interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl TimeRange {
    /// The `window` leading up to now
    pub fn last(window: Duration) -> Self {
        let until = Utc::now();
        let since = TimeDelta::from_std(window)
            .ok()
            .and_then(|window| until.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        TimeRange { since, until }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.since && timestamp <= self.until
    }
}

/// Time-series store for per-miner hashrate samples
pub trait HistoryStore: Send + Sync {
    fn record(&self, name: &str, point: HashratePoint) -> Result<()>;

    /// Samples for `name` inside `range`, oldest first
    fn query(&self, name: &str, range: TimeRange) -> Result<Vec<HashratePoint>>;

    fn remove(&self, name: &str);
}

#[derive(Debug, Default)]
struct Series {
    high_res: VecDeque<HashratePoint>,
    low_res: VecDeque<HashratePoint>,
}

/// In-process [`HistoryStore`] with minute downsampling
pub struct InMemoryHistory {
    series: RwLock<HashMap<String, Series>>,
    high_res_window: TimeDelta,
    retention: TimeDelta,
}

impl InMemoryHistory {
    pub fn new(high_res_window: Duration, retention: Duration) -> Self {
        InMemoryHistory {
            series: RwLock::new(HashMap::new()),
            high_res_window: TimeDelta::from_std(high_res_window).unwrap_or(TimeDelta::MAX),
            retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
        }
    }

    fn compact(&self, series: &mut Series, now: DateTime<Utc>) {
        let cutoff = window_start(now, self.high_res_window);
        let minute = TimeDelta::minutes(1);

        while let Some(first) = series.high_res.front() {
            let bucket = match first.timestamp.duration_trunc(minute) {
                Ok(bucket) => bucket,
                Err(_) => first.timestamp,
            };
            // only whole minutes are averaged
            if bucket + minute > cutoff {
                break;
            }

            let mut sum: u128 = 0;
            let mut count: u128 = 0;
            while let Some(point) = series.high_res.front() {
                if point.timestamp >= bucket + minute {
                    break;
                }
                sum += point.hashrate as u128;
                count += 1;
                series.high_res.pop_front();
            }
            if count > 0 {
                series
                    .low_res
                    .push_back(HashratePoint::new(bucket, (sum / count) as u64));
            }
        }

        let expiry = window_start(now, self.retention);
        while series
            .low_res
            .front()
            .map(|point| point.timestamp < expiry)
            .unwrap_or(false)
        {
            series.low_res.pop_front();
        }
    }
}

/// Start of a window ending at `now`, clamped to the earliest representable time
fn window_start(now: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Default for InMemoryHistory {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60), Duration::from_secs(24 * 3600))
    }
}

impl HistoryStore for InMemoryHistory {
    fn record(&self, name: &str, point: HashratePoint) -> Result<()> {
        let mut all = self.series.write();
        let series = all.entry(name.to_string()).or_default();

        if let Some(last) = series.high_res.back() {
            if point.timestamp < last.timestamp {
                return Err(MiningError::History(format!(
                    "out-of-order sample for {}",
                    name
                )));
            }
        }

        let now = point.timestamp;
        series.high_res.push_back(point);
        self.compact(series, now);
        Ok(())
    }

    fn query(&self, name: &str, range: TimeRange) -> Result<Vec<HashratePoint>> {
        let all = self.series.read();
        let Some(series) = all.get(name) else {
            return Ok(Vec::new());
        };

        Ok(series
            .low_res
            .iter()
            .chain(series.high_res.iter())
            .filter(|point| range.contains(point.timestamp))
            .copied()
            .collect())
    }

    fn remove(&self, name: &str) {
        self.series.write().remove(name);
    }
}
