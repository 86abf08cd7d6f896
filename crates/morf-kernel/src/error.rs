//! Error taxonomy for the orchestration core.
//!
//! Each sub-module owns its construction-time error type
//! ([`DefinitionError`](crate::workflow::DefinitionError),
//! [`SessionError`](crate::session::SessionError),
//! [`StorageError`](crate::storage::StorageError)); this module owns the
//! cross-cutting invocation and resource errors plus the crate-level
//! [`OrchestratorError`] umbrella that composes all of them via `#[from]`
//! so the `?` operator converts automatically.

use thiserror::Error;

use crate::session::SessionError;
use crate::storage::StorageError;
use crate::workflow::DefinitionError;

/// Result alias for agent invocation paths.
pub type AgentResult<T> = Result<T, InvocationError>;

/// Result alias for the crate-level umbrella error.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// User-visible classification attached to a finalized failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient errors persisted through every permitted attempt.
    TransientExhausted,
    /// The failure is not retryable at all.
    Permanent,
    /// The final attempt ran out of time.
    Timeout,
    /// The work was cancelled before a result was produced.
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::TransientExhausted => "transient_exhausted",
            FailureKind::Permanent => "permanent",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Errors produced while invoking a single agent.
///
/// Transient variants are retried per policy; permanent variants fail the
/// invocation immediately without consuming retry budget. Use
/// [`InvocationError::is_transient`] to discriminate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InvocationError {
    /// The attempt exceeded the step's configured timeout.
    #[error("Invocation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The agent could not be reached or declined the request transiently.
    #[error("Agent unavailable: {message}")]
    Unavailable { message: String },

    /// The request payload was rejected as malformed.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// The agent reported an unrecoverable failure.
    #[error("Agent failed: {message}")]
    AgentFailed { message: String },

    /// No agent is registered for the requested kind.
    #[error("No agent registered for kind '{agent}'")]
    NotRegistered { agent: String },

    /// The circuit breaker for this agent kind is open.
    #[error("Circuit open for agent '{agent}', retry after {retry_after_ms}ms")]
    CircuitOpen { agent: String, retry_after_ms: u64 },

    /// Capacity could not be reserved within the caller's admission policy.
    #[error("Resource exhausted: {message}")]
    ResourceExhausted { message: String },

    /// The invocation was cancelled cooperatively.
    #[error("Invocation cancelled")]
    Cancelled,
}

impl InvocationError {
    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a transient unavailability error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a permanent malformed-request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a permanent agent-side failure.
    pub fn agent_failed(message: impl Into<String>) -> Self {
        Self::AgentFailed {
            message: message.into(),
        }
    }

    /// Whether the retry loop may attempt again after backoff.
    ///
    /// An open circuit is deliberately not transient here: the invocation
    /// fails fast instead of burning its backoff budget against a breaker
    /// that will not close within a single invocation's lifetime.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InvocationError::Timeout { .. }
                | InvocationError::Unavailable { .. }
                | InvocationError::ResourceExhausted { .. }
        )
    }

    /// Classification for a failure that finalized with this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            InvocationError::Timeout { .. } => FailureKind::Timeout,
            InvocationError::Cancelled => FailureKind::Cancelled,
            InvocationError::Unavailable { .. }
            | InvocationError::ResourceExhausted { .. }
            | InvocationError::CircuitOpen { .. } => FailureKind::TransientExhausted,
            _ => FailureKind::Permanent,
        }
    }
}

/// Errors raised by the resource manager's reserve path.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ResourceError {
    /// The request exceeds what is currently available and the caller asked
    /// for an immediate answer.
    #[error("Capacity exhausted: requested {requested_mb}MB, available {available_mb}MB")]
    Exhausted { requested_mb: u64, available_mb: u64 },

    /// Every concurrency slot is busy and the caller asked for an
    /// immediate answer.
    #[error("All {max_concurrent} concurrency slots are busy")]
    SlotsBusy { max_concurrent: u32 },

    /// The bounded wait elapsed before capacity freed.
    #[error("Capacity wait timed out after {waited_ms}ms")]
    WaitTimeout { waited_ms: u64 },

    /// The request can never be satisfied by the configured ceiling.
    #[error("Request exceeds configured capacity: requested {requested_mb}MB, ceiling {capacity_mb}MB")]
    ExceedsCapacity { requested_mb: u64, capacity_mb: u64 },
}

/// Crate-level error composing every sub-system's typed error.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// A malformed or cyclic workflow definition.
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    /// A session state-machine or lookup error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// An agent invocation error that escaped the retry layer.
    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),

    /// A resource reservation error.
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// A checkpoint persistence error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// No workflow definition is registered under the given id.
    #[error("Unknown workflow: {workflow_id}")]
    UnknownWorkflow { workflow_id: String },

    /// A JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal / untyped error described by a message string.
    #[error("{0}")]
    Internal(String),
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}
