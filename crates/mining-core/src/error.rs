use thiserror::Error;

/// Coarse classification of a [`MiningError`], used by callers that map
/// failures onto responses or retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input rejected before any side effect
    Validation,
    /// Duplicate or missing registry entry
    Conflict,
    /// Miner is stopped or its telemetry API is not configured
    NotRunning,
    /// Network, timeout, decode or circuit-open failure
    Transient,
    /// The external process could not be started or stopped
    Process,
    /// The service is shutting down and takes no new work
    Unavailable,
    /// Anything else
    Internal,
}

#[derive(Error, Debug)]
pub enum MiningError {
    #[error("Unsupported miner type: {0}")]
    UnsupportedMiner(String),

    #[error("Invalid miner configuration: {0}")]
    InvalidConfig(String),

    #[error("Miner already running: {0}")]
    MinerExists(String),

    #[error("Miner not found: {0}")]
    MinerNotFound(String),

    #[error("Miner is not running: {0}")]
    NotRunning(String),

    #[error("Miner API not configured or port is zero: {0}")]
    ApiNotConfigured(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Unexpected status code {0}")]
    UnexpectedStatus(u16),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("Failed to start miner {name}: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("Failed to stop miner {name}: {reason}")]
    StopFailed { name: String, reason: String },

    #[error("Manager is shutting down")]
    ShuttingDown,

    #[error("History store error: {0}")]
    History(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl MiningError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MiningError::UnsupportedMiner(_) | MiningError::InvalidConfig(_) => ErrorKind::Validation,
            MiningError::MinerExists(_) | MiningError::MinerNotFound(_) => ErrorKind::Conflict,
            MiningError::NotRunning(_) | MiningError::ApiNotConfigured(_) => ErrorKind::NotRunning,
            MiningError::Timeout(_)
            | MiningError::Cancelled
            | MiningError::Connection(_)
            | MiningError::UnexpectedStatus(_)
            | MiningError::Decode(_)
            | MiningError::CircuitOpen(_) => ErrorKind::Transient,
            MiningError::StartFailed { .. } | MiningError::StopFailed { .. } => ErrorKind::Process,
            MiningError::ShuttingDown => ErrorKind::Unavailable,
            MiningError::History(_) | MiningError::IoError(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may reasonably retry the same operation later.
    /// Nothing inside the core retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            MiningError::Cancelled => false,
            MiningError::UnexpectedStatus(code) => *code >= 500 || *code == 429,
            _ => self.kind() == ErrorKind::Transient,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MiningError::MinerNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, MiningError>;
