//! Error taxonomy shared by every orchestrator component
//!
//! Each variant maps to a stable wire `kind` so clients can branch on it
//! without parsing messages.

use serde::Serialize;
use thiserror::Error;

use crate::inference::InferenceError;
use crate::sandbox::EngineError;
use crate::store::StoreError;

/// Errors surfaced by the orchestrator
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Sandbox could not be created or started (or creation timed out)
    #[error("sandbox unavailable for {user}: {reason}")]
    SandboxUnavailable { user: String, reason: String },

    /// Sandbox died while in use; the in-flight execution is abandoned
    #[error("sandbox lost for {user}: {reason}")]
    SandboxLost { user: String, reason: String },

    /// Another execution is already active for this user
    #[error("an execution is already active for {user}")]
    Busy { user: String },

    /// Input or cancel sent while nothing is running
    #[error("no active execution for {user}")]
    NoActiveExecution { user: String },

    /// Malformed structured command
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Subscriber could not keep up and was dropped
    #[error("subscriber dropped: too slow to consume events")]
    SlowConsumer,

    /// Connection failed authentication
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Connection sent frames faster than allowed
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),
}

impl OrchestratorError {
    /// Stable identifier used in `{"error": {"kind": ..}}` frames
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::SandboxUnavailable { .. } => "sandbox_unavailable",
            OrchestratorError::SandboxLost { .. } => "sandbox_lost",
            OrchestratorError::Busy { .. } => "busy",
            OrchestratorError::NoActiveExecution { .. } => "no_active_execution",
            OrchestratorError::BadRequest(_) => "bad_request",
            OrchestratorError::SlowConsumer => "slow_consumer",
            OrchestratorError::Unauthorized(_) => "unauthorized",
            OrchestratorError::RateLimited => "rate_limited",
            OrchestratorError::Engine(_) => "engine",
            OrchestratorError::Store(_) => "store",
            OrchestratorError::Inference(_) => "inference",
        }
    }

    /// Whether the error should close the connection that triggered it
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            OrchestratorError::SlowConsumer | OrchestratorError::Unauthorized(_)
        )
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Wire form of an error: `{"kind": .., "message": ..}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&OrchestratorError> for ErrorInfo {
    fn from(err: &OrchestratorError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<OrchestratorError> for ErrorInfo {
    fn from(err: OrchestratorError) -> Self {
        Self::from(&err)
    }
}
