//! Agent invoker: one dispatched step, driven to a terminal status.
//!
//! The invoker owns the full per-invocation lifecycle: resolve the agent,
//! pass the circuit-breaker gate, reserve capacity, then run the attempt
//! loop with per-attempt timeouts and jittered backoff. Transient errors
//! retry until the budget is spent; permanent errors fail immediately
//! without consuming it. The breaker records one outcome per finished
//! invocation, never per attempt.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use morf_kernel::agent::{AgentKind, AgentRequest, AgentResponse, DynAgent, HealthStatus};
use morf_kernel::error::{FailureKind, InvocationError};
use morf_kernel::invocation::AgentInvocation;
use morf_kernel::policy::{PolicySet, RetryConfig};
use morf_kernel::workflow::WorkflowStep;

use crate::breaker::BreakerRegistry;
use crate::resource::{AdmissionPolicy, ResourceAllocation, ResourceManager, ResourceRequest};
use crate::retry::delay_for;
use crate::scheduler::ExecutionEvent;

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Registered collaborators, one per agent kind.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<DashMap<AgentKind, DynAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its declared kind, replacing any previous
    /// registration for that kind.
    pub fn register(&self, agent: DynAgent) {
        self.agents.insert(agent.kind(), agent);
    }

    pub fn get(&self, kind: AgentKind) -> Option<DynAgent> {
        self.agents.get(&kind).map(|a| Arc::clone(a.value()))
    }

    /// Probe every registered agent.
    pub async fn health_report(&self) -> HashMap<AgentKind, HealthStatus> {
        let agents: Vec<(AgentKind, DynAgent)> = self
            .agents
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        let mut report = HashMap::new();
        for (kind, agent) in agents {
            report.insert(kind, agent.health_check().await);
        }
        report
    }
}

// ----------------------------------------------------------------------------
// Invoker
// ----------------------------------------------------------------------------

/// Per-invocation resource sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokerConfig {
    /// Memory reserved for every invocation.
    pub memory_mb: u64,
    /// What to do when the pool is exhausted.
    pub admission: AdmissionPolicy,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            admission: AdmissionPolicy::default(),
        }
    }
}

/// A finalized invocation plus the error that finalized it, when any.
/// The record alone cannot distinguish transient-exhausted from permanent;
/// the error carries that classification.
pub struct InvocationOutcome {
    pub invocation: AgentInvocation,
    pub error: Option<InvocationError>,
}

impl InvocationOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn response(&self) -> Option<&AgentResponse> {
        self.invocation.response.as_ref()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.failure_kind())
    }
}

/// Executes workflow steps against registered agents under policy.
pub struct AgentInvoker {
    registry: AgentRegistry,
    resources: ResourceManager,
    breakers: BreakerRegistry,
    policies: Arc<PolicySet>,
    config: InvokerConfig,
}

impl AgentInvoker {
    pub fn new(
        registry: AgentRegistry,
        resources: ResourceManager,
        breakers: BreakerRegistry,
        policies: Arc<PolicySet>,
        config: InvokerConfig,
    ) -> Self {
        Self {
            registry,
            resources,
            breakers,
            policies,
            config,
        }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub async fn health_report(&self) -> HashMap<AgentKind, HealthStatus> {
        self.registry.health_report().await
    }

    /// Drive one step to a terminal invocation status.
    ///
    /// Capacity reservation happens inside the attempt loop: an exhausted
    /// pool counts as a transient attempt failure, so the invocation backs
    /// off and tries again instead of failing the session outright.
    pub async fn invoke_step(
        &self,
        step: &WorkflowStep,
        retry: &RetryConfig,
        request: AgentRequest,
        cancel: &CancellationToken,
        events: Option<&mpsc::UnboundedSender<ExecutionEvent>>,
    ) -> InvocationOutcome {
        let policy = self.policies.policy_for(step.agent);
        let timeout_ms = step.timeout_ms.unwrap_or(policy.timeout_ms);
        let max_attempts = retry.max_attempts.max(1);
        let mut invocation = AgentInvocation::new(step.agent, request.clone(), max_attempts);

        let Some(agent) = self.registry.get(step.agent) else {
            let err = InvocationError::NotRegistered {
                agent: step.agent.as_str().to_string(),
            };
            invocation.fail(err.to_string());
            return InvocationOutcome {
                invocation,
                error: Some(err),
            };
        };

        // Per-invocation gate: an open circuit rejects before any agent
        // contact and records nothing on the breaker. The permit pins any
        // half-open trial slot until this invocation resolves; dropping it
        // early (cancellation, task abort) hands the slot back.
        let breaker = self.breakers.breaker_for(step.agent, &policy.breaker);
        let _breaker_permit = match breaker.check().await {
            Ok(permit) => permit,
            Err(err) => {
                debug!(
                    session_id = %invocation.session_id,
                    step_id = %step.id,
                    agent = %step.agent,
                    "invocation rejected by open circuit"
                );
                invocation.fail(err.to_string());
                return InvocationOutcome {
                    invocation,
                    error: Some(err),
                };
            }
        };

        let mut allocation: Option<ResourceAllocation> = None;
        loop {
            if cancel.is_cancelled() {
                invocation.cancel();
                return InvocationOutcome {
                    invocation,
                    error: Some(InvocationError::Cancelled),
                };
            }
            invocation.begin_attempt();
            let attempt = invocation.attempt_number;
            debug!(
                session_id = %invocation.session_id,
                step_id = %step.id,
                agent = %step.agent,
                attempt,
                max_attempts,
                "invoking agent"
            );

            let result: Result<AgentResponse, InvocationError> = 'attempt: {
                if allocation.is_none() {
                    let req = ResourceRequest::new(self.config.memory_mb)
                        .with_policy(self.config.admission);
                    match self.resources.reserve(req).await {
                        Ok(a) => allocation = Some(a),
                        Err(err) => {
                            break 'attempt Err(InvocationError::ResourceExhausted {
                                message: err.to_string(),
                            });
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => Err(InvocationError::Cancelled),
                    attempt_result = tokio::time::timeout(
                        Duration::from_millis(timeout_ms),
                        agent.invoke(request.clone()),
                    ) => match attempt_result {
                        Ok(inner) => inner,
                        Err(_) => Err(InvocationError::timeout(timeout_ms)),
                    },
                }
            };

            match result {
                Ok(response) => {
                    breaker.record_success().await;
                    invocation.succeed(response);
                    return InvocationOutcome {
                        invocation,
                        error: None,
                    };
                }
                Err(InvocationError::Cancelled) => {
                    invocation.cancel();
                    return InvocationOutcome {
                        invocation,
                        error: Some(InvocationError::Cancelled),
                    };
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = delay_for(retry, attempt);
                    debug!(
                        session_id = %invocation.session_id,
                        step_id = %step.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    if let Some(tx) = events {
                        let _ = tx.send(ExecutionEvent::StepRetrying {
                            step_id: step.id.clone(),
                            attempt: attempt + 1,
                        });
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            invocation.cancel();
                            return InvocationOutcome {
                                invocation,
                                error: Some(InvocationError::Cancelled),
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    // Permanent, or transient with the budget spent. Pool
                    // saturation is local backpressure and never counts
                    // against the agent's health.
                    let pool_backpressure =
                        matches!(err, InvocationError::ResourceExhausted { .. });
                    if !pool_backpressure && breaker.record_failure().await {
                        if let Some(tx) = events {
                            let _ = tx.send(ExecutionEvent::BreakerOpened { agent: step.agent });
                        }
                    }
                    warn!(
                        session_id = %invocation.session_id,
                        step_id = %step.id,
                        agent = %step.agent,
                        attempts = attempt,
                        error = %err,
                        "invocation failed"
                    );
                    match &err {
                        InvocationError::Timeout { duration_ms } => {
                            invocation.time_out(*duration_ms)
                        }
                        _ => invocation.fail(err.to_string()),
                    }
                    return InvocationOutcome {
                        invocation,
                        error: Some(err),
                    };
                }
            }
        }
    }
}
