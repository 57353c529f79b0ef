//! Telemetry fetch pipeline shared by every miner variant.
//!
//! Sequencing per poll:
//! 1. read lock: check the miner is running and its API is configured,
//!    copy host and port, release. Idle instances answer here with empty
//!    metrics.
//! 2. HTTP GET outside any lock, bounded by the caller's context
//! 3. decode the engine summary
//! 4. write lock only to store the raw summary and derived metrics
//!
//! The pipeline never retries; that is the caller's policy.

use crate::miner::{MinerState, MinerStatus};
use mining_core::{MiningError, PerformanceMetrics, RequestContext, Result, STATS_TIMEOUT};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Largest telemetry body accepted from a miner API
pub const MAX_SUMMARY_BYTES: usize = 1024 * 1024;

/// Engine-native telemetry document
pub trait TelemetrySummary: DeserializeOwned + Clone + Send + Sync + 'static {
    /// Path of the summary route on the miner's API
    const ENDPOINT: &'static str;

    /// Normalize into engine-agnostic metrics. Fails rather than returning a
    /// partially populated record.
    fn to_metrics(&self) -> Result<PerformanceMetrics>;
}

/// Poll one miner's telemetry endpoint
pub async fn fetch_stats<S: TelemetrySummary>(
    http: &reqwest::Client,
    state: &RwLock<MinerState<S>>,
    name: &str,
    ctx: &RequestContext,
) -> Result<PerformanceMetrics> {
    let (host, port) = {
        let state = state.read();
        if state.status != MinerStatus::Running {
            return Err(MiningError::NotRunning(name.to_string()));
        }
        if state.idle {
            return Ok(idle_metrics(state.config.as_ref().map(|c| c.algo.as_str())));
        }
        if !state.api.is_configured() {
            return Err(MiningError::ApiNotConfigured(name.to_string()));
        }
        (state.api.host.clone(), state.api.port)
    };

    let url = format!("http://{}:{}{}", host, port, S::ENDPOINT);
    let summary: S = ctx.run(STATS_TIMEOUT, get_json(http, &url)).await?;
    let metrics = summary.to_metrics()?;

    {
        let mut state = state.write();
        state.summary = Some(summary);
        state.metrics = Some(metrics.clone());
    }

    Ok(metrics)
}

/// Empty metrics reported for an instance with nothing to mine
fn idle_metrics(algo: Option<&str>) -> PerformanceMetrics {
    PerformanceMetrics {
        algorithm: algo.unwrap_or_default().to_string(),
        ..PerformanceMetrics::default()
    }
}

/// GET `url` and decode the JSON body. Non-2xx responses are errors.
pub async fn get_json<T: DeserializeOwned>(http: &reqwest::Client, url: &str) -> Result<T> {
    let mut response = http
        .get(url)
        .send()
        .await
        .map_err(|e| map_request_error(e, STATS_TIMEOUT))?;

    let status = response.status();
    if !status.is_success() {
        return Err(MiningError::UnexpectedStatus(status.as_u16()));
    }

    if response
        .content_length()
        .is_some_and(|len| len > MAX_SUMMARY_BYTES as u64)
    {
        return Err(oversized());
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| map_request_error(e, STATS_TIMEOUT))?
    {
        if body.len() + chunk.len() > MAX_SUMMARY_BYTES {
            return Err(oversized());
        }
        body.extend_from_slice(&chunk);
    }
    serde_json::from_slice(&body).map_err(|e| MiningError::Decode(e.to_string()))
}

fn oversized() -> MiningError {
    MiningError::Decode(format!("response body exceeds {} bytes", MAX_SUMMARY_BYTES))
}

pub(crate) fn map_request_error(error: reqwest::Error, limit: Duration) -> MiningError {
    if error.is_timeout() {
        MiningError::Timeout(limit)
    } else if error.is_decode() {
        MiningError::Decode(error.to_string())
    } else if let Some(status) = error.status() {
        MiningError::UnexpectedStatus(status.as_u16())
    } else {
        MiningError::Connection(error.to_string())
    }
}
