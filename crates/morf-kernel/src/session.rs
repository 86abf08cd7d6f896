//! Conversion sessions: the guarded state machine, step results, and
//! checkpoint snapshots.
//!
//! A session is owned by the session manager and mutated only through
//! [`ConversionSession::apply_transition`], which enforces the transition
//! table and the optimistic version check. Every accepted transition bumps
//! `version` by exactly one; the runtime writes one checkpoint per version.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::agent::AgentKind;
use crate::error::FailureKind;

// ============================================================================
// States
// ============================================================================

/// Lifecycle phases of a conversion session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Format detection and triage.
    Analyzing,
    /// Interactive metadata collection.
    CollectingMetadata,
    /// Conversion execution.
    Converting,
    /// Validation and quality evaluation.
    Validating,
    /// Terminal: all required steps succeeded.
    Completed,
    /// Terminal: a required step or the session itself failed.
    Failed,
    /// Terminal: cancelled by request.
    Cancelled,
    /// Waiting for user input; resumes into metadata collection.
    Suspended,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Analyzing
                | SessionState::CollectingMetadata
                | SessionState::Converting
                | SessionState::Validating
        )
    }

    /// The transition table. Terminal states allow nothing.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match self {
            Analyzing => matches!(next, CollectingMetadata | Failed | Cancelled),
            CollectingMetadata => matches!(next, Converting | Suspended | Failed | Cancelled),
            Converting => matches!(next, Validating | Failed | Cancelled),
            Validating => matches!(next, Completed | Failed | Cancelled),
            Suspended => matches!(next, CollectingMetadata | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Analyzing => "analyzing",
            SessionState::CollectingMetadata => "collecting_metadata",
            SessionState::Converting => "converting",
            SessionState::Validating => "validating",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
            SessionState::Suspended => "suspended",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// State-machine and lookup failures.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum SessionError {
    #[error("Session not found: {session_id}")]
    NotFound { session_id: String },

    /// The session is terminal; the requested transition was a no-op.
    #[error("Session {session_id} already finalized in state '{state}'")]
    AlreadyFinalized {
        session_id: String,
        state: SessionState,
    },

    #[error("Invalid state transition from '{from}' to '{to}'")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// Optimistic-lock mismatch. Never auto-retried: reload the latest
    /// snapshot and resubmit.
    #[error("Version conflict on session {session_id}: expected {expected}, actual {actual}")]
    VersionConflict {
        session_id: String,
        expected: u64,
        actual: u64,
    },
}

// ============================================================================
// Step results
// ============================================================================

/// Terminal outcome of one step within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Skipped)
    }
}

/// Accumulated per-step result folded into the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub agent: AgentKind,
    pub status: StepStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Attempts actually made; `retry_count` is attempts minus one.
    pub attempts: u32,
    pub retry_count: u32,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn succeeded(
        step_id: impl Into<String>,
        agent: AgentKind,
        output: serde_json::Value,
        attempts: u32,
        duration_ms: u64,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            agent,
            status: StepStatus::Succeeded,
            output: Some(output),
            error: None,
            attempts,
            retry_count: attempts.saturating_sub(1),
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        step_id: impl Into<String>,
        agent: AgentKind,
        error: impl Into<String>,
        attempts: u32,
        duration_ms: u64,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            agent,
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
            attempts,
            retry_count: attempts.saturating_sub(1),
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn skipped(step_id: impl Into<String>, agent: AgentKind) -> Self {
        Self {
            step_id: step_id.into(),
            agent,
            status: StepStatus::Skipped,
            output: None,
            error: None,
            attempts: 0,
            retry_count: 0,
            duration_ms: 0,
            completed_at: Utc::now(),
        }
    }
}

/// Structured, user-visible description of why a session failed. Callers
/// querying a failed session always get this, never a raw internal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub kind: FailureKind,
    /// The step at which the failure occurred, when step-bound.
    pub step_id: Option<String>,
    pub agent: Option<AgentKind>,
    pub attempts: u32,
    pub message: String,
    pub trace_id: Option<String>,
}

impl SessionFailure {
    pub fn for_step(
        kind: FailureKind,
        step_id: impl Into<String>,
        agent: AgentKind,
        attempts: u32,
        message: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            step_id: Some(step_id.into()),
            agent: Some(agent),
            attempts,
            message: message.into(),
            trace_id: Some(trace_id.into()),
        }
    }

    /// Session-level expiry, not bound to any one step.
    pub fn expired(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            step_id: None,
            agent: None,
            attempts: 0,
            message: message.into(),
            trace_id: None,
        }
    }

    /// Runtime fault inside the orchestrator itself, not bound to any
    /// one step.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            step_id: None,
            agent: None,
            attempts: 0,
            message: message.into(),
            trace_id: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            step_id: None,
            agent: None,
            attempts: 0,
            message: "session cancelled by request".into(),
            trace_id: None,
        }
    }
}

// ============================================================================
// The session
// ============================================================================

/// One execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionSession {
    pub id: String,
    pub workflow_id: String,
    pub state: SessionState,
    /// Bumped by exactly one on every accepted transition.
    pub version: u64,
    pub current_step: Option<String>,
    pub total_steps: usize,
    /// Original caller-supplied input.
    pub input: serde_json::Value,
    pub step_results: HashMap<String, StepResult>,
    /// User answers supplied while suspended, oldest first.
    pub user_inputs: Vec<serde_json::Value>,
    /// Question pending while suspended.
    pub pending_prompt: Option<String>,
    pub failure: Option<SessionFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConversionSession {
    pub fn new(
        workflow_id: impl Into<String>,
        input: serde_json::Value,
        total_steps: usize,
        ttl_ms: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            state: SessionState::Analyzing,
            version: 0,
            current_step: None,
            total_steps,
            input,
            step_results: HashMap::new(),
            user_inputs: Vec::new(),
            pending_prompt: None,
            failure: None,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::milliseconds(ttl_ms as i64),
        }
    }

    /// Fraction of steps with a terminal result, in `[0.0, 1.0]`.
    pub fn progress(&self) -> f32 {
        if self.total_steps == 0 {
            return 0.0;
        }
        (self.step_results.len() as f32 / self.total_steps as f32).min(1.0)
    }

    pub fn completed_steps(&self) -> usize {
        self.step_results.len()
    }

    /// Whether the expiry deadline has passed for a still-running session.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && now > self.expires_at
    }

    /// The single mutation gate: terminal check, optimistic version check,
    /// then the transition table. Accepted transitions bump `version`.
    pub fn apply_transition(
        &mut self,
        expected_version: u64,
        next: SessionState,
    ) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::AlreadyFinalized {
                session_id: self.id.clone(),
                state: self.state,
            });
        }
        if expected_version != self.version {
            return Err(SessionError::VersionConflict {
                session_id: self.id.clone(),
                expected: expected_version,
                actual: self.version,
            });
        }
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.version += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_step_result(&mut self, result: StepResult) {
        self.current_step = Some(result.step_id.clone());
        self.step_results.insert(result.step_id.clone(), result);
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

/// Immutable point-in-time snapshot of a session. Recovery needs only the
/// latest one; older versions serve audit and inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub version: u64,
    pub state: SessionState,
    pub taken_at: DateTime<Utc>,
    /// Full session snapshot at `version`.
    pub session: ConversionSession,
}

impl Checkpoint {
    pub fn of(session: &ConversionSession) -> Self {
        Self {
            session_id: session.id.clone(),
            version: session.version,
            state: session.state,
            taken_at: Utc::now(),
            session: session.clone(),
        }
    }

    /// Rebuild the session exactly as it was when the snapshot was taken.
    pub fn restore(&self) -> ConversionSession {
        self.session.clone()
    }
}
