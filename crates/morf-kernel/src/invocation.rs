//! Invocation records: one attempt-series of calling an agent for a step.
//!
//! The invoker creates one [`AgentInvocation`] per dispatched step, calls
//! [`begin_attempt`](AgentInvocation::begin_attempt) before each try, and
//! finalizes with exactly one of the terminal markers. Finalized records
//! feed the session's provenance trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{AgentKind, AgentRequest, AgentResponse};

/// Lifecycle of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Timeout,
    Cancelled,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationStatus::Succeeded
                | InvocationStatus::Failed
                | InvocationStatus::Timeout
                | InvocationStatus::Cancelled
        )
    }
}

/// Audit record of one step dispatch, across all of its attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub id: String,
    pub session_id: String,
    pub step_id: String,
    pub agent: AgentKind,
    pub request: AgentRequest,
    pub response: Option<AgentResponse>,
    pub status: InvocationStatus,
    /// 1-based attempt currently running, or the final attempt once
    /// terminal. Zero until the first attempt starts.
    pub attempt_number: u32,
    /// Attempts beyond the first; kept in sync with `attempt_number`.
    pub retry_count: u32,
    pub max_attempts: u32,
    pub error: Option<String>,
    pub trace_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentInvocation {
    pub fn new(agent: AgentKind, request: AgentRequest, max_attempts: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: request.session_id.clone(),
            step_id: request.step_id.clone(),
            agent,
            trace_id: request.trace_id.clone(),
            request,
            response: None,
            status: InvocationStatus::Pending,
            attempt_number: 0,
            retry_count: 0,
            max_attempts,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Mark the next attempt started.
    pub fn begin_attempt(&mut self) {
        self.attempt_number += 1;
        self.retry_count = self.attempt_number.saturating_sub(1);
        self.status = InvocationStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn succeed(&mut self, response: AgentResponse) {
        self.response = Some(response);
        self.finalize(InvocationStatus::Succeeded, None);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.finalize(InvocationStatus::Failed, Some(error.into()));
    }

    pub fn time_out(&mut self, duration_ms: u64) {
        self.finalize(
            InvocationStatus::Timeout,
            Some(format!("attempt timed out after {duration_ms}ms")),
        );
    }

    pub fn cancel(&mut self) {
        self.finalize(InvocationStatus::Cancelled, Some("cancelled".into()));
    }

    fn finalize(&mut self, status: InvocationStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }

    /// Wall-clock duration from first attempt to finalization.
    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}
