//! Session arena: the single home of live session state.
//!
//! Each session lives in its own slot behind an async lock, alongside its
//! cancellation token and a wakeup for supplied user input. Nothing outside
//! this module ever holds a mutable session reference; every mutation goes
//! through a slot's write lock, and every version bump writes its checkpoint
//! before the lock is released, so checkpoint versions can never interleave.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use morf_kernel::error::{OrchestratorError, OrchestratorResult};
use morf_kernel::session::{
    Checkpoint, ConversionSession, SessionError, SessionFailure, SessionState, StepResult,
};

use crate::checkpoint::CheckpointStore;
use crate::provenance::ProvenanceTracker;

struct SessionSlot {
    session: RwLock<ConversionSession>,
    cancel: CancellationToken,
    input_ready: Notify,
}

/// Arena of live sessions keyed by id. Cheap to clone; clones share slots.
#[derive(Clone)]
pub struct SessionStore {
    slots: Arc<DashMap<String, Arc<SessionSlot>>>,
    checkpoints: CheckpointStore,
    provenance: ProvenanceTracker,
}

impl SessionStore {
    pub fn new(checkpoints: CheckpointStore, provenance: ProvenanceTracker) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            checkpoints,
            provenance,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.slots.contains_key(session_id)
    }

    fn slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.slots.get(session_id).map(|e| Arc::clone(e.value()))
    }

    fn slot_or_err(&self, session_id: &str) -> Result<Arc<SessionSlot>, SessionError> {
        self.slot(session_id).ok_or_else(|| SessionError::NotFound {
            session_id: session_id.to_string(),
        })
    }

    /// Admit a brand-new session and commit its version-0 checkpoint.
    pub async fn insert(
        &self,
        session: ConversionSession,
        cancel: CancellationToken,
    ) -> OrchestratorResult<()> {
        let checkpoint = Checkpoint::of(&session);
        self.slots.insert(
            session.id.clone(),
            Arc::new(SessionSlot {
                session: RwLock::new(session),
                cancel,
                input_ready: Notify::new(),
            }),
        );
        self.checkpoints.put(&checkpoint).await?;
        self.provenance
            .record_checkpoint(&checkpoint.session_id, checkpoint.version, checkpoint.state);
        Ok(())
    }

    /// Re-admit a session restored from its latest checkpoint. No new
    /// checkpoint is written; the restored version is already committed.
    pub fn insert_restored(&self, session: ConversionSession, cancel: CancellationToken) {
        self.slots.insert(
            session.id.clone(),
            Arc::new(SessionSlot {
                session: RwLock::new(session),
                cancel,
                input_ready: Notify::new(),
            }),
        );
    }

    /// Point-in-time copy of a session.
    pub async fn snapshot(&self, session_id: &str) -> Option<ConversionSession> {
        let slot = self.slot(session_id)?;
        let session = slot.session.read().await;
        Some(session.clone())
    }

    pub fn cancel_token(&self, session_id: &str) -> Option<CancellationToken> {
        self.slot(session_id).map(|s| s.cancel.clone())
    }

    /// The optimistic-locked transition entry point. On acceptance the new
    /// checkpoint is committed before the slot lock is released.
    pub async fn transition(
        &self,
        session_id: &str,
        expected_version: u64,
        next: SessionState,
    ) -> OrchestratorResult<ConversionSession> {
        let slot = self.slot_or_err(session_id)?;
        let mut session = slot.session.write().await;
        session.apply_transition(expected_version, next)?;
        let checkpoint = Checkpoint::of(&session);
        self.checkpoints.put(&checkpoint).await?;
        self.provenance
            .record_checkpoint(session_id, checkpoint.version, checkpoint.state);
        debug!(
            session_id,
            version = session.version,
            state = %session.state,
            "session transitioned"
        );
        Ok(session.clone())
    }

    /// Fold a terminal step result into the session. Returns false when the
    /// session has already finalized; a late result is discarded, not
    /// recorded.
    pub async fn record_step_result(&self, session_id: &str, result: StepResult) -> bool {
        let Some(slot) = self.slot(session_id) else {
            return false;
        };
        let mut session = slot.session.write().await;
        if session.state.is_terminal() {
            debug!(
                session_id,
                step_id = %result.step_id,
                "discarding step result for finalized session"
            );
            return false;
        }
        session.record_step_result(result);
        true
    }

    /// Suspend a session awaiting user input, storing the question.
    pub async fn suspend(&self, session_id: &str, prompt: &str) -> OrchestratorResult<()> {
        let slot = self.slot_or_err(session_id)?;
        let mut session = slot.session.write().await;
        let version = session.version;
        session.apply_transition(version, SessionState::Suspended)?;
        session.pending_prompt = Some(prompt.to_string());
        let checkpoint = Checkpoint::of(&session);
        self.checkpoints.put(&checkpoint).await?;
        self.provenance
            .record_checkpoint(session_id, checkpoint.version, checkpoint.state);
        info!(session_id, prompt, "session suspended awaiting user input");
        Ok(())
    }

    /// Store a user answer and wake the scheduler. Returns false unless the
    /// session is currently suspended.
    pub async fn supply_user_input(&self, session_id: &str, input: serde_json::Value) -> bool {
        let Some(slot) = self.slot(session_id) else {
            return false;
        };
        {
            let mut session = slot.session.write().await;
            if session.state != SessionState::Suspended {
                return false;
            }
            let version = session.version;
            if session
                .apply_transition(version, SessionState::CollectingMetadata)
                .is_err()
            {
                return false;
            }
            session.user_inputs.push(input);
            session.pending_prompt = None;
            let checkpoint = Checkpoint::of(&session);
            if let Err(err) = self.checkpoints.put(&checkpoint).await {
                error!(session_id, %err, "failed to checkpoint user input");
            } else {
                self.provenance
                    .record_checkpoint(session_id, checkpoint.version, checkpoint.state);
            }
        }
        slot.input_ready.notify_one();
        true
    }

    /// Park until user input arrives for this session.
    pub async fn wait_for_input(&self, session_id: &str) {
        if let Some(slot) = self.slot(session_id) {
            slot.input_ready.notified().await;
        }
    }

    /// Finalize a session as failed, attaching the structured failure.
    /// A session that is already terminal is left untouched.
    pub async fn fail(
        &self,
        session_id: &str,
        failure: SessionFailure,
    ) -> OrchestratorResult<ConversionSession> {
        let slot = self.slot_or_err(session_id)?;
        let mut session = slot.session.write().await;
        let version = session.version;
        session.apply_transition(version, SessionState::Failed)?;
        session.failure = Some(failure);
        let checkpoint = Checkpoint::of(&session);
        self.checkpoints.put(&checkpoint).await?;
        self.provenance
            .record_checkpoint(session_id, checkpoint.version, checkpoint.state);
        warn!(
            session_id,
            message = session.failure.as_ref().map(|f| f.message.as_str()).unwrap_or(""),
            "session failed"
        );
        Ok(session.clone())
    }

    /// Cancel a session: signal its in-flight work, then finalize. Returns
    /// false for unknown or already-terminal sessions, leaving them
    /// unchanged. A suspended session has nothing in flight, so this is
    /// immediate.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let Some(slot) = self.slot(session_id) else {
            return false;
        };
        let mut session = slot.session.write().await;
        if session.state.is_terminal() {
            return false;
        }
        // Signal first: invocations release their reservations before the
        // scheduler observes the terminal state.
        slot.cancel.cancel();
        let version = session.version;
        if session
            .apply_transition(version, SessionState::Cancelled)
            .is_err()
        {
            return false;
        }
        session.failure = Some(SessionFailure::cancelled());
        let checkpoint = Checkpoint::of(&session);
        if let Err(err) = self.checkpoints.put(&checkpoint).await {
            error!(session_id, %err, "failed to checkpoint cancellation");
        } else {
            self.provenance
                .record_checkpoint(session_id, checkpoint.version, checkpoint.state);
        }
        info!(session_id, "session cancelled");
        true
    }

    /// Force-fail every active session past its expiry. Returns the ids
    /// that were failed.
    pub async fn force_fail_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let slots: Vec<(String, Arc<SessionSlot>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut expired = Vec::new();
        for (session_id, slot) in slots {
            let mut session = slot.session.write().await;
            if !session.is_expired(now) || !session.state.is_active() {
                continue;
            }
            slot.cancel.cancel();
            let version = session.version;
            if session
                .apply_transition(version, SessionState::Failed)
                .is_err()
            {
                continue;
            }
            session.failure = Some(SessionFailure::expired(format!(
                "session exceeded its deadline of {}",
                session.expires_at
            )));
            let checkpoint = Checkpoint::of(&session);
            if let Err(err) = self.checkpoints.put(&checkpoint).await {
                error!(session_id = %session_id, %err, "failed to checkpoint expiry");
            } else {
                self.provenance
                    .record_checkpoint(&session_id, checkpoint.version, checkpoint.state);
            }
            warn!(session_id = %session_id, "session force-failed on expiry");
            expired.push(session_id);
        }
        expired
    }

    /// Drop terminal sessions idle past the retention window from the
    /// arena. Their checkpoints remain in the blob store. Returns the
    /// archived ids.
    pub async fn archive_terminal(&self, retention: Duration, now: DateTime<Utc>) -> Vec<String> {
        let slots: Vec<(String, Arc<SessionSlot>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut archived = Vec::new();
        for (session_id, slot) in slots {
            let expired = {
                let session = slot.session.read().await;
                session.state.is_terminal() && session.updated_at + retention < now
            };
            if expired {
                self.slots.remove(&session_id);
                debug!(session_id = %session_id, "session archived");
                archived.push(session_id);
            }
        }
        archived
    }
}

// keep the umbrella's From<SessionError> path visible to callers matching on it
impl SessionStore {
    /// Whether an error is the terminal-state no-op ("already finalized").
    pub fn is_finalized_error(err: &OrchestratorError) -> bool {
        matches!(
            err,
            OrchestratorError::Session(SessionError::AlreadyFinalized { .. })
        )
    }
}
