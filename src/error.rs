// Error types for the orchestrator core

use thiserror::Error;

/// Orchestrator result type
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Orchestrator error types
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("planet not found: {0}")]
    PlanetNotFound(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("duplicate planet id: {0}")]
    DuplicatePlanet(String),

    #[error("invalid planet id {0:?}: must be 1-100 chars of [A-Za-z0-9_-]")]
    InvalidPlanetId(String),

    #[error("planet {0} is processing and cannot be removed")]
    PlanetBusy(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("logic guard: {0}")]
    LogicGuard(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("outbound queue full for worker {0}")]
    OutboundQueueFull(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sled::Error> for OrchestratorError {
    fn from(err: sled::Error) -> Self {
        OrchestratorError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::StoreUnavailable(format!("serialization: {err}"))
    }
}

/// Transient errors are retried by the Health Loop; everything else propagates (see §7).
pub fn is_retryable(err: &OrchestratorError) -> bool {
    matches!(
        err,
        OrchestratorError::StoreUnavailable(_) | OrchestratorError::OutboundQueueFull(_)
    )
}

/// Logic-guard conditions are logged and dropped without side effects.
pub fn is_logic_guard(err: &OrchestratorError) -> bool {
    matches!(err, OrchestratorError::LogicGuard(_))
}
