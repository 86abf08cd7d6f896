//! Agent boundary for the conversion pipeline.
//!
//! The orchestrator never talks to collaborators through free-form strings:
//! every pluggable executor implements [`ConversionAgent`] and declares one
//! of the four [`AgentKind`] variants. Format detectors, validators, and
//! quality tools all plug in through the same shape.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::AgentResult;

// ============================================================================
// Agent kinds
// ============================================================================

/// Typed selector for the pipeline's collaborator roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Dialogue and format analysis (detection, triage).
    Conversation,
    /// Interactive metadata collection; may request user input.
    MetadataQuestioner,
    /// The conversion execution itself.
    Conversion,
    /// Validation and quality evaluation of produced artifacts.
    Evaluation,
}

impl AgentKind {
    /// Stable lowercase identifier, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Conversation => "conversation",
            AgentKind::MetadataQuestioner => "metadata_questioner",
            AgentKind::Conversion => "conversion",
            AgentKind::Evaluation => "evaluation",
        }
    }

    /// All kinds in pipeline order.
    pub fn all() -> [AgentKind; 4] {
        [
            AgentKind::Conversation,
            AgentKind::MetadataQuestioner,
            AgentKind::Conversion,
            AgentKind::Evaluation,
        ]
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Request / response envelopes
// ============================================================================

/// One request handed to an agent for one workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Owning session.
    pub session_id: String,
    /// Step being executed.
    pub step_id: String,
    /// Step input, assembled from session input and prior step outputs.
    pub payload: serde_json::Value,
    /// User-supplied data, present when re-invoking after a suspension.
    pub user_input: Option<serde_json::Value>,
    /// Correlation id carried through logs, invocations, and provenance.
    pub trace_id: String,
}

impl AgentRequest {
    pub fn new(
        session_id: impl Into<String>,
        step_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            step_id: step_id.into(),
            payload,
            user_input: None,
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_user_input(mut self, input: serde_json::Value) -> Self {
        self.user_input = Some(input);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }
}

/// An agent's answer for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Step output, folded into the session's accumulated results.
    pub payload: serde_json::Value,
    /// Set when the agent cannot proceed without user input.
    pub needs_input: bool,
    /// Question to surface to the user when `needs_input` is set.
    pub prompt: Option<String>,
}

impl AgentResponse {
    /// A completed step with the given output.
    pub fn completed(payload: serde_json::Value) -> Self {
        Self {
            payload,
            needs_input: false,
            prompt: None,
        }
    }

    /// A request to suspend the session until the user answers.
    pub fn request_input(prompt: impl Into<String>) -> Self {
        Self {
            payload: serde_json::Value::Null,
            needs_input: true,
            prompt: Some(prompt.into()),
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// Health reported by an agent's probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

// ============================================================================
// The agent trait
// ============================================================================

/// Capability surface the orchestration core requires from a collaborator.
///
/// Implementations must be cheap to clone behind [`DynAgent`] and safe to
/// invoke concurrently; the invoker enforces timeouts and retries outside
/// this trait, so `invoke` should simply do the work or fail.
#[async_trait]
pub trait ConversionAgent: Send + Sync {
    /// The pipeline role this agent fills.
    fn kind(&self) -> AgentKind;

    /// Human-readable name for logs and provenance.
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Execute one step. Errors are classified transient or permanent by
    /// [`InvocationError::is_transient`](crate::error::InvocationError::is_transient).
    async fn invoke(&self, request: AgentRequest) -> AgentResult<AgentResponse>;

    /// Liveness/readiness probe; defaults to healthy.
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

/// Shared handle to a registered agent.
pub type DynAgent = Arc<dyn ConversionAgent>;
