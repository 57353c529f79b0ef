use crate::stats::map_request_error;
use mining_core::{CircuitBreaker, CircuitBreakerConfig, MiningError, RequestContext, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
}

/// Latest-release lookup against a GitHub-compatible API, behind a circuit breaker
pub struct ReleaseChecker {
    http: reqwest::Client,
    api_base: String,
    breaker: CircuitBreaker<String>,
}

impl ReleaseChecker {
    pub fn new(http: reqwest::Client, api_base: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        ReleaseChecker {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            breaker: CircuitBreaker::new("release-check", config),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker<String> {
        &self.breaker
    }

    /// Tag of the latest release of `owner/repo`. While the circuit is open
    /// the last known tag is served instead, if there is one.
    pub async fn latest_version(&self, owner: &str, repo: &str, ctx: &RequestContext) -> Result<String> {
        let url = format!("{}/repos/{}/{}/releases/latest", self.api_base, owner, repo);

        let result = self
            .breaker
            .execute(|| ctx.run(RELEASE_TIMEOUT, self.fetch_tag(&url)))
            .await;

        match result {
            Err(MiningError::CircuitOpen(name)) => match self.breaker.get_cached() {
                Some(tag) => {
                    debug!("Circuit {} open, serving cached release {}", name, tag);
                    Ok(tag)
                }
                None => Err(MiningError::CircuitOpen(name)),
            },
            Err(e) => {
                warn!("Release lookup for {}/{} failed: {}", owner, repo, e);
                Err(e)
            }
            ok => ok,
        }
    }

    async fn fetch_tag(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| map_request_error(e, RELEASE_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MiningError::UnexpectedStatus(status.as_u16()));
        }

        let release: Release = response
            .json()
            .await
            .map_err(|e| MiningError::Decode(e.to_string()))?;
        Ok(release.tag_name)
    }
}
