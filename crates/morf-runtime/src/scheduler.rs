//! Level-parallel scheduler driving one session through its workflow.
//!
//! Levels run strictly in order; steps inside a level run concurrently in a
//! `JoinSet`. The scheduler maps each level's agent kinds onto the session
//! phase chain (analyzing, collecting metadata, converting, validating) and
//! walks intermediate phases one transition at a time, so the state-machine
//! table is never bypassed even when a workflow has no step for some phase.
//! A required-step failure aborts the rest of the run; optional failures
//! and false guards are recorded and tolerated.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use morf_kernel::agent::{AgentKind, AgentRequest};
use morf_kernel::error::{FailureKind, OrchestratorError, OrchestratorResult};
use morf_kernel::session::{
    ConversionSession, SessionError, SessionFailure, SessionState, StepResult,
};
use morf_kernel::workflow::{WorkflowDefinition, WorkflowStep};

use crate::invoker::{AgentInvoker, InvocationOutcome};
use crate::provenance::ProvenanceTracker;
use crate::store::SessionStore;

/// Progress notifications, emitted per session over an unbounded channel so
/// adapters and tests can observe a run without polling.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    LevelStarted { index: usize, steps: Vec<String> },
    StepStarted { step_id: String, agent: AgentKind },
    StepRetrying { step_id: String, attempt: u32 },
    StepCompleted { step_id: String },
    StepSkipped { step_id: String },
    StepFailed { step_id: String, error: String },
    BreakerOpened { agent: AgentKind },
    SessionSuspended { prompt: String },
    SessionResumed,
    SessionCompleted,
    SessionFailed { message: String },
    SessionCancelled,
}

/// The session phase a step's agent kind executes in.
fn phase_for(kind: AgentKind) -> SessionState {
    match kind {
        AgentKind::Conversation => SessionState::Analyzing,
        AgentKind::MetadataQuestioner => SessionState::CollectingMetadata,
        AgentKind::Conversion => SessionState::Converting,
        AgentKind::Evaluation => SessionState::Validating,
    }
}

/// Position in the forward phase chain. `Suspended` sits at the metadata
/// phase it resumes into.
fn phase_index(state: SessionState) -> usize {
    match state {
        SessionState::Analyzing => 0,
        SessionState::CollectingMetadata => 1,
        SessionState::Suspended => 1,
        SessionState::Converting => 2,
        SessionState::Validating => 3,
        SessionState::Completed | SessionState::Failed | SessionState::Cancelled => usize::MAX,
    }
}

/// Drives workflow definitions against sessions in the arena.
#[derive(Clone)]
pub struct Scheduler {
    invoker: Arc<AgentInvoker>,
    store: SessionStore,
    provenance: ProvenanceTracker,
    events: Option<mpsc::UnboundedSender<ExecutionEvent>>,
}

impl Scheduler {
    pub fn new(
        invoker: Arc<AgentInvoker>,
        store: SessionStore,
        provenance: ProvenanceTracker,
    ) -> Self {
        Self {
            invoker,
            store,
            provenance,
            events: None,
        }
    }

    /// Attach a per-session event stream.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Run the session to a terminal state. External finalization (cancel,
    /// expiry) surfaces as the terminal-state no-op and ends the run
    /// quietly; a resumed session skips steps whose results the checkpoint
    /// already carries.
    pub async fn run(
        &self,
        definition: Arc<WorkflowDefinition>,
        session_id: &str,
        cancel: CancellationToken,
    ) -> OrchestratorResult<()> {
        match self.drive(&definition, session_id, &cancel).await {
            Ok(()) => Ok(()),
            Err(err) if SessionStore::is_finalized_error(&err) => {
                if let Some(snap) = self.store.snapshot(session_id).await {
                    match snap.state {
                        SessionState::Cancelled => self.emit(ExecutionEvent::SessionCancelled),
                        SessionState::Failed => self.emit(ExecutionEvent::SessionFailed {
                            message: snap
                                .failure
                                .map(|f| f.message)
                                .unwrap_or_else(|| "session failed".into()),
                        }),
                        _ => {}
                    }
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn drive(
        &self,
        definition: &Arc<WorkflowDefinition>,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<()> {
        for (index, level) in definition.execution_order().iter().enumerate() {
            if cancel.is_cancelled() {
                self.emit(ExecutionEvent::SessionCancelled);
                return Ok(());
            }
            let snap = self.snapshot(session_id).await?;
            if snap.state.is_terminal() {
                return Ok(());
            }

            // Steps with a recorded terminal result are already resolved;
            // a resumed session re-runs only what the checkpoint lacks.
            let pending: Vec<WorkflowStep> = level
                .iter()
                .filter(|id| !snap.step_results.contains_key(*id))
                .filter_map(|id| definition.step(id).cloned())
                .collect();
            if pending.is_empty() {
                continue;
            }

            let target = pending
                .iter()
                .map(|s| phase_for(s.agent))
                .max_by_key(|s| phase_index(*s))
                .unwrap_or(SessionState::Analyzing);
            self.walk_to(session_id, target).await?;

            self.emit(ExecutionEvent::LevelStarted {
                index,
                steps: pending.iter().map(|s| s.id.clone()).collect(),
            });
            debug!(session_id, level = index, steps = pending.len(), "level started");

            let snap = self.snapshot(session_id).await?;
            let mut join_set: JoinSet<(WorkflowStep, InvocationOutcome)> = JoinSet::new();
            for step in pending {
                if self.guard_blocks(definition, &step, &snap) {
                    self.store
                        .record_step_result(session_id, StepResult::skipped(&step.id, step.agent))
                        .await;
                    self.emit(ExecutionEvent::StepSkipped {
                        step_id: step.id.clone(),
                    });
                    debug!(session_id, step_id = %step.id, "step skipped by guard");
                    continue;
                }

                let request = build_request(&snap, &step);
                let retry = definition.effective_retry(&step.id);
                self.emit(ExecutionEvent::StepStarted {
                    step_id: step.id.clone(),
                    agent: step.agent,
                });

                let invoker = Arc::clone(&self.invoker);
                let step_cancel = cancel.clone();
                let events = self.events.clone();
                join_set.spawn(async move {
                    let outcome = invoker
                        .invoke_step(&step, &retry, request, &step_cancel, events.as_ref())
                        .await;
                    (step, outcome)
                });
            }

            let mut suspensions: Vec<(WorkflowStep, String)> = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                let Ok((step, outcome)) = joined else {
                    // Aborted sibling after a required failure.
                    continue;
                };
                match self
                    .fold_outcome(definition, session_id, &step, outcome, &mut suspensions)
                    .await?
                {
                    LevelVerdict::Continue => {}
                    LevelVerdict::Abort => {
                        join_set.abort_all();
                        return Ok(());
                    }
                }
            }

            for (step, prompt) in suspensions {
                match self
                    .collect_through_suspension(definition, session_id, &step, prompt, cancel)
                    .await?
                {
                    LevelVerdict::Continue => {}
                    LevelVerdict::Abort => return Ok(()),
                }
            }
        }

        self.walk_to(session_id, SessionState::Validating).await?;
        let snap = self.snapshot(session_id).await?;
        self.store
            .transition(session_id, snap.version, SessionState::Completed)
            .await?;
        self.emit(ExecutionEvent::SessionCompleted);
        info!(session_id, "session completed");
        Ok(())
    }

    async fn snapshot(&self, session_id: &str) -> OrchestratorResult<ConversionSession> {
        self.store
            .snapshot(session_id)
            .await
            .ok_or_else(|| {
                SessionError::NotFound {
                    session_id: session_id.to_string(),
                }
                .into()
            })
    }

    /// Advance the session phase-by-phase until it reaches `target`. Never
    /// walks backward; races with concurrent writers reload and retry.
    async fn walk_to(&self, session_id: &str, target: SessionState) -> OrchestratorResult<()> {
        loop {
            let snap = self.snapshot(session_id).await?;
            if snap.state.is_terminal() {
                return Err(SessionError::AlreadyFinalized {
                    session_id: snap.id,
                    state: snap.state,
                }
                .into());
            }
            if snap.state != SessionState::Suspended
                && phase_index(snap.state) >= phase_index(target)
            {
                return Ok(());
            }
            let next = match snap.state {
                SessionState::Analyzing => SessionState::CollectingMetadata,
                SessionState::Suspended => SessionState::CollectingMetadata,
                SessionState::CollectingMetadata => SessionState::Converting,
                SessionState::Converting => SessionState::Validating,
                _ => return Ok(()),
            };
            match self.store.transition(session_id, snap.version, next).await {
                Ok(_) => {}
                Err(OrchestratorError::Session(SessionError::VersionConflict { .. })) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Whether any guarded incoming edge evaluates false against its
    /// from-step's recorded output.
    fn guard_blocks(
        &self,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        snap: &ConversionSession,
    ) -> bool {
        definition.dependencies_of(&step.id).any(|dep| {
            dep.guard.as_ref().is_some_and(|guard| {
                let output = snap
                    .step_results
                    .get(&dep.from)
                    .and_then(|r| r.output.as_ref());
                !guard.evaluate(output)
            })
        })
    }

    /// Fold one finished invocation into the session. Suspension requests
    /// are deferred to the caller; a required failure finalizes the session
    /// and asks the caller to abort.
    async fn fold_outcome(
        &self,
        definition: &WorkflowDefinition,
        session_id: &str,
        step: &WorkflowStep,
        outcome: InvocationOutcome,
        suspensions: &mut Vec<(WorkflowStep, String)>,
    ) -> OrchestratorResult<LevelVerdict> {
        let invocation = &outcome.invocation;
        self.provenance.record_invocation(
            invocation,
            input_entity(definition, step),
            format!("artifact:{}", step.id),
        );

        // Only metadata steps may ask for input; anything else asking is a
        // misbehaving agent and falls through to the failure path below.
        let asked_out_of_turn = outcome
            .response()
            .is_some_and(|r| r.needs_input && step.agent != AgentKind::MetadataQuestioner);
        if let Some(response) = outcome.response() {
            if response.needs_input && step.agent == AgentKind::MetadataQuestioner {
                let prompt = response
                    .prompt
                    .clone()
                    .unwrap_or_else(|| "additional input required".to_string());
                suspensions.push((step.clone(), prompt));
                return Ok(LevelVerdict::Continue);
            }
            if !asked_out_of_turn {
                self.store
                    .record_step_result(
                        session_id,
                        StepResult::succeeded(
                            &step.id,
                            step.agent,
                            response.payload.clone(),
                            invocation.attempt_number,
                            invocation.duration_ms(),
                        ),
                    )
                    .await;
                self.emit(ExecutionEvent::StepCompleted {
                    step_id: step.id.clone(),
                });
                return Ok(LevelVerdict::Continue);
            }
        }

        let kind = outcome.failure_kind().unwrap_or(FailureKind::Permanent);
        if kind == FailureKind::Cancelled {
            // Finalized externally; the store already holds the terminal
            // state and this result is discarded.
            self.emit(ExecutionEvent::SessionCancelled);
            return Ok(LevelVerdict::Abort);
        }

        let message = if asked_out_of_turn {
            warn!(
                session_id,
                step_id = %step.id,
                agent = %step.agent,
                "agent requested user input outside the metadata phase"
            );
            format!(
                "agent '{}' requested user input outside the metadata phase",
                step.agent
            )
        } else {
            invocation
                .error
                .clone()
                .unwrap_or_else(|| "invocation failed".to_string())
        };
        self.store
            .record_step_result(
                session_id,
                StepResult::failed(
                    &step.id,
                    step.agent,
                    &message,
                    invocation.attempt_number,
                    invocation.duration_ms(),
                ),
            )
            .await;
        self.emit(ExecutionEvent::StepFailed {
            step_id: step.id.clone(),
            error: message.clone(),
        });

        if !step.required {
            warn!(session_id, step_id = %step.id, "optional step failed, continuing");
            return Ok(LevelVerdict::Continue);
        }

        let failure = SessionFailure::for_step(
            kind,
            &step.id,
            step.agent,
            invocation.attempt_number,
            &message,
            &invocation.trace_id,
        );
        match self.store.fail(session_id, failure).await {
            Ok(_) => {}
            Err(err) if SessionStore::is_finalized_error(&err) => {}
            Err(err) => return Err(err),
        }
        self.emit(ExecutionEvent::SessionFailed { message });
        Ok(LevelVerdict::Abort)
    }

    /// Suspend for user input and re-invoke the metadata step until it
    /// stops asking, the session finalizes, or the run is cancelled.
    async fn collect_through_suspension(
        &self,
        definition: &Arc<WorkflowDefinition>,
        session_id: &str,
        step: &WorkflowStep,
        mut prompt: String,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<LevelVerdict> {
        loop {
            self.store.suspend(session_id, &prompt).await?;
            self.emit(ExecutionEvent::SessionSuspended {
                prompt: prompt.clone(),
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.emit(ExecutionEvent::SessionCancelled);
                    return Ok(LevelVerdict::Abort);
                }
                _ = self.store.wait_for_input(session_id) => {}
            }

            let snap = self.snapshot(session_id).await?;
            if snap.state.is_terminal() {
                return Ok(LevelVerdict::Abort);
            }
            if snap.state == SessionState::Suspended {
                // Spurious wakeup; keep waiting on the same prompt.
                continue;
            }
            self.emit(ExecutionEvent::SessionResumed);

            let request = build_request(&snap, step);
            let retry = definition.effective_retry(&step.id);
            let outcome = self
                .invoker
                .invoke_step(step, &retry, request, cancel, self.events.as_ref())
                .await;

            if let Some(response) = outcome.response() {
                if response.needs_input {
                    prompt = response
                        .prompt
                        .clone()
                        .unwrap_or_else(|| "additional input required".to_string());
                    continue;
                }
            }
            let mut ignored = Vec::new();
            return self
                .fold_outcome(definition, session_id, step, outcome, &mut ignored)
                .await;
        }
    }
}

enum LevelVerdict {
    Continue,
    Abort,
}

/// Assemble a step's request from the session input, every prior output,
/// and (for metadata steps) the newest user answer.
fn build_request(session: &ConversionSession, step: &WorkflowStep) -> AgentRequest {
    let results: serde_json::Map<String, serde_json::Value> = session
        .step_results
        .iter()
        .filter_map(|(id, r)| r.output.clone().map(|o| (id.clone(), o)))
        .collect();
    let payload = serde_json::json!({
        "input": session.input,
        "results": results,
    });
    let mut request = AgentRequest::new(&session.id, &step.id, payload);
    if step.agent == AgentKind::MetadataQuestioner {
        if let Some(last) = session.user_inputs.last() {
            request = request.with_user_input(last.clone());
        }
    }
    request
}

/// The provenance input artifact for a step: its first dependency's output,
/// or the session input for root steps. This chains each step's artifact to
/// its upstream producer.
fn input_entity(definition: &WorkflowDefinition, step: &WorkflowStep) -> String {
    definition
        .dependencies_of(&step.id)
        .next()
        .map(|dep| format!("artifact:{}", dep.from))
        .unwrap_or_else(|| "artifact:input".to_string())
}
