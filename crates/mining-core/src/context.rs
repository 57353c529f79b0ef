use crate::{MiningError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation and deadline carried by every network-facing call.
///
/// Cancelling the context (or its parent token) drops the in-flight future,
/// which closes the underlying connection instead of leaking it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Context that is never cancelled and has no deadline
    pub fn background() -> Self {
        RequestContext {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        RequestContext::background().with_deadline_in(timeout)
    }

    /// Context cancelled whenever `parent` is cancelled
    pub fn child_of(parent: &CancellationToken) -> Self {
        RequestContext {
            token: parent.child_token(),
            deadline: None,
        }
    }

    /// Tighten the deadline; an existing earlier deadline wins.
    pub fn with_deadline_in(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Drive `fut` until it completes, the context is cancelled, or
    /// `limit` (capped by the deadline) elapses.
    pub async fn run<F, T>(&self, limit: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.token.is_cancelled() {
            return Err(MiningError::Cancelled);
        }

        let bound = match self.remaining() {
            Some(remaining) => remaining.min(limit),
            None => limit,
        };
        if bound.is_zero() {
            return Err(MiningError::Timeout(limit));
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(MiningError::Cancelled),
            result = tokio::time::timeout(bound, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(MiningError::Timeout(bound)),
            },
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}
