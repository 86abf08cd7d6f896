//! Session manager: the runtime facade.
//!
//! Wires the registry, resource pool, breakers, invoker, checkpoint store
//! and provenance tracker together, owns the workflow catalog, and exposes
//! the operations callers actually use: start, observe, answer, cancel,
//! resume, inspect. Session runs execute on spawned tasks; a cancellable
//! maintenance task sweeps expired and stale-terminal sessions.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use morf_kernel::agent::{AgentKind, DynAgent, HealthStatus};
use morf_kernel::error::{OrchestratorError, OrchestratorResult};
use morf_kernel::policy::PolicySet;
use morf_kernel::session::{ConversionSession, SessionError, SessionFailure};
use morf_kernel::storage::DynBlobStore;
use morf_kernel::workflow::WorkflowDefinition;

use crate::breaker::{BreakerRegistry, BreakerState};
use crate::checkpoint::CheckpointStore;
use crate::invoker::{AgentInvoker, AgentRegistry, InvokerConfig};
use crate::memory::MemoryBlobStore;
use crate::provenance::ProvenanceTracker;
use crate::resource::{ResourceLimits, ResourceManager, UtilizationSnapshot};
use crate::scheduler::{ExecutionEvent, Scheduler};
use crate::store::SessionStore;

/// Tunables for one manager instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub resource_limits: ResourceLimits,
    pub invoker: InvokerConfig,
    pub policies: PolicySet,
    /// Session lifetime when the workflow declares no global timeout.
    pub session_ttl_ms: u64,
    /// How long finished sessions stay queryable before the sweep drops
    /// them from the arena.
    pub archive_after_ms: u64,
    /// Checkpoints retained per archived session; `None` keeps everything.
    pub checkpoint_keep_last: Option<usize>,
    pub maintenance_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            resource_limits: ResourceLimits::default(),
            invoker: InvokerConfig::default(),
            policies: PolicySet::default(),
            session_ttl_ms: 1_800_000,
            archive_after_ms: 3_600_000,
            checkpoint_keep_last: None,
            maintenance_interval_ms: 5_000,
        }
    }
}

/// Handle to the background sweep; dropping it leaves the task running
/// until manager shutdown.
pub struct MaintenanceHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Stop the sweep and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// The orchestration entry point. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SessionManager {
    config: Arc<RuntimeConfig>,
    registry: AgentRegistry,
    workflows: Arc<DashMap<String, Arc<WorkflowDefinition>>>,
    invoker: Arc<AgentInvoker>,
    resources: ResourceManager,
    store: SessionStore,
    provenance: ProvenanceTracker,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Manager backed by an in-process blob store.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_blob_store(config, MemoryBlobStore::shared())
    }

    /// Manager backed by a caller-supplied blob store. Sharing one store
    /// across manager instances lets a new instance resume sessions the
    /// old one checkpointed.
    pub fn with_blob_store(config: RuntimeConfig, blobs: DynBlobStore) -> Self {
        let registry = AgentRegistry::new();
        let resources = ResourceManager::new(config.resource_limits.clone());
        let breakers = BreakerRegistry::new();
        let provenance = ProvenanceTracker::new();
        let store = SessionStore::new(CheckpointStore::new(blobs), provenance.clone());
        let invoker = Arc::new(AgentInvoker::new(
            registry.clone(),
            resources.clone(),
            breakers,
            Arc::new(config.policies.clone()),
            config.invoker.clone(),
        ));
        Self {
            config: Arc::new(config),
            registry,
            workflows: Arc::new(DashMap::new()),
            invoker,
            resources,
            store,
            provenance,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a collaborator, replacing any previous agent of its kind.
    pub fn register_agent(&self, agent: DynAgent) {
        debug!(agent = %agent.kind(), name = agent.name(), "agent registered");
        self.registry.register(agent);
    }

    /// Register a validated workflow definition under its id.
    pub fn register_workflow(&self, definition: WorkflowDefinition) {
        info!(
            workflow_id = definition.id(),
            steps = definition.total_steps(),
            "workflow registered"
        );
        self.workflows
            .insert(definition.id().to_string(), Arc::new(definition));
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows
            .get(workflow_id)
            .map(|e| Arc::clone(e.value()))
    }

    /// Start a session for `workflow_id` and return its id. The run
    /// proceeds on a background task.
    pub async fn start(
        &self,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> OrchestratorResult<String> {
        self.start_inner(workflow_id, input, None).await
    }

    /// Like [`start`](Self::start), additionally returning the session's
    /// execution event stream.
    pub async fn start_observed(
        &self,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> OrchestratorResult<(String, mpsc::UnboundedReceiver<ExecutionEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = self.start_inner(workflow_id, input, Some(tx)).await?;
        Ok((session_id, rx))
    }

    async fn start_inner(
        &self,
        workflow_id: &str,
        input: serde_json::Value,
        events: Option<mpsc::UnboundedSender<ExecutionEvent>>,
    ) -> OrchestratorResult<String> {
        let definition =
            self.workflow(workflow_id)
                .ok_or_else(|| OrchestratorError::UnknownWorkflow {
                    workflow_id: workflow_id.to_string(),
                })?;
        let ttl_ms = definition
            .global_timeout_ms()
            .unwrap_or(self.config.session_ttl_ms);
        let session =
            ConversionSession::new(definition.id(), input, definition.total_steps(), ttl_ms);
        let session_id = session.id.clone();

        let cancel = self.shutdown.child_token();
        self.provenance.ensure_session(&session_id);
        self.store.insert(session, cancel.clone()).await?;
        info!(session_id = %session_id, workflow_id, "session started");

        self.spawn_run(definition, session_id.clone(), cancel, events);
        Ok(session_id)
    }

    /// Re-admit a session from its latest checkpoint and continue the run.
    /// Steps whose results the checkpoint carries are not re-executed.
    pub async fn resume(&self, session_id: &str) -> OrchestratorResult<ConversionSession> {
        if self.store.contains(session_id) {
            return Err(OrchestratorError::Internal(format!(
                "session '{session_id}' is already live"
            )));
        }
        let checkpoint = self
            .store
            .checkpoints()
            .get_latest(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;
        let session = checkpoint.restore();
        if session.state.is_terminal() {
            return Err(SessionError::AlreadyFinalized {
                session_id: session.id,
                state: session.state,
            }
            .into());
        }
        let definition =
            self.workflow(&session.workflow_id)
                .ok_or_else(|| OrchestratorError::UnknownWorkflow {
                    workflow_id: session.workflow_id.clone(),
                })?;

        let snapshot = session.clone();
        let cancel = self.shutdown.child_token();
        self.provenance.ensure_session(session_id);
        self.store.insert_restored(session, cancel.clone());
        info!(
            session_id,
            version = snapshot.version,
            state = %snapshot.state,
            "session resumed from checkpoint"
        );

        self.spawn_run(definition, session_id.to_string(), cancel, None);
        Ok(snapshot)
    }

    fn spawn_run(
        &self,
        definition: Arc<WorkflowDefinition>,
        session_id: String,
        cancel: CancellationToken,
        events: Option<mpsc::UnboundedSender<ExecutionEvent>>,
    ) -> JoinHandle<()> {
        let mut scheduler = Scheduler::new(
            Arc::clone(&self.invoker),
            self.store.clone(),
            self.provenance.clone(),
        );
        if let Some(tx) = events {
            scheduler = scheduler.with_events(tx);
        }
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = scheduler.run(definition, &session_id, cancel).await {
                error!(session_id = %session_id, %err, "session run aborted");
                // Surface the fault on the session rather than leaving it
                // active until the expiry sweep catches it.
                let failure = SessionFailure::internal(err.to_string());
                match store.fail(&session_id, failure).await {
                    Ok(_) => {}
                    Err(fail_err) if SessionStore::is_finalized_error(&fail_err) => {}
                    Err(fail_err) => {
                        warn!(session_id = %session_id, %fail_err, "could not record run failure");
                    }
                }
            }
        })
    }

    /// Point-in-time view of a session, terminal ones included until the
    /// sweep archives them.
    pub async fn get_status(&self, session_id: &str) -> Option<ConversionSession> {
        self.store.snapshot(session_id).await
    }

    /// Cancel a session. Returns false for unknown or already-terminal
    /// sessions.
    pub async fn cancel(&self, session_id: &str) -> bool {
        self.store.cancel(session_id).await
    }

    /// Answer a suspended session's pending question. Returns false unless
    /// the session is currently suspended.
    pub async fn supply_user_input(&self, session_id: &str, input: serde_json::Value) -> bool {
        self.store.supply_user_input(session_id, input).await
    }

    /// Serialized provenance graph for a session.
    pub fn export_provenance(&self, session_id: &str) -> Option<serde_json::Value> {
        self.provenance.export(session_id)
    }

    pub async fn agent_health(&self) -> HashMap<AgentKind, HealthStatus> {
        self.invoker.health_report().await
    }

    pub async fn breaker_states(&self) -> HashMap<AgentKind, BreakerState> {
        self.invoker.breakers().states().await
    }

    /// Operator override for a tripped breaker.
    pub async fn force_close_breaker(&self, kind: AgentKind) {
        self.invoker.breakers().force_close(kind).await;
    }

    pub fn utilization(&self) -> UtilizationSnapshot {
        self.resources.utilization()
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        self.store.checkpoints()
    }

    pub fn live_sessions(&self) -> usize {
        self.store.len()
    }

    /// Start the periodic sweep: force-fail expired sessions, archive
    /// stale terminal ones, and prune archived sessions' checkpoint
    /// history when retention is configured.
    pub fn spawn_maintenance(&self) -> MaintenanceHandle {
        let cancel = self.shutdown.child_token();
        let loop_cancel = cancel.clone();
        let store = self.store.clone();
        let interval_ms = self.config.maintenance_interval_ms.max(1);
        let retention = ChronoDuration::milliseconds(self.config.archive_after_ms as i64);
        let keep_last = self.config.checkpoint_keep_last;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let now = Utc::now();
                let expired = store.force_fail_expired(now).await;
                if !expired.is_empty() {
                    warn!(count = expired.len(), "force-failed expired sessions");
                }
                let archived = store.archive_terminal(retention, now).await;
                if let Some(keep) = keep_last {
                    for session_id in &archived {
                        match store.checkpoints().prune(session_id, keep).await {
                            Ok(removed) if removed > 0 => {
                                debug!(session_id = %session_id, removed, "pruned checkpoints");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                warn!(session_id = %session_id, %err, "checkpoint prune failed");
                            }
                        }
                    }
                }
            }
        });
        MaintenanceHandle { cancel, handle }
    }

    /// Signal every session run and background task to stop. In-flight
    /// invocations observe their cancellation tokens and unwind.
    pub fn shutdown(&self) {
        info!(live_sessions = self.store.len(), "manager shutting down");
        self.shutdown.cancel();
    }
}
