//! Per-agent-kind circuit breakers.
//!
//! One breaker guards each agent kind. It counts consecutive *invocation*
//! failures, recorded after local retries are exhausted, so backoff-internal
//! attempts never trip the circuit. While open, calls fail fast without
//! contacting the agent; once the cooldown elapses exactly one half-open
//! trial is admitted. The trial's success closes the circuit, its failure
//! reopens it and restarts the cooldown.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use morf_kernel::agent::AgentKind;
use morf_kernel::error::InvocationError;
use morf_kernel::policy::BreakerConfig;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Healthy; calls pass through.
    #[default]
    Closed,
    /// Failing; calls are rejected until the cooldown elapses.
    Open,
    /// One trial call is in flight; its outcome decides the next state.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Live while the single half-open trial is outstanding. A `Weak` so
    /// the slot frees itself when the trial's permit is dropped, recorded
    /// outcome or not.
    probe: Weak<()>,
}

/// Admission token returned by [`CircuitBreaker::check`]. For a half-open
/// trial it holds the trial slot; dropping it without recording an outcome
/// releases the slot so a later call can run the trial instead. Closed-state
/// admissions carry no slot.
#[derive(Debug)]
pub struct BreakerPermit {
    _probe: Option<Arc<()>>,
}

/// Breaker for one agent kind.
pub struct CircuitBreaker {
    kind: AgentKind,
    config: BreakerConfig,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(kind: AgentKind, config: BreakerConfig) -> Self {
        Self {
            kind,
            config,
            inner: RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe: Weak::new(),
            }),
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_ms)
    }

    /// Admission gate, called once per invocation before any agent contact.
    ///
    /// Closed passes. Open passes only when the cooldown has elapsed, which
    /// moves the breaker to half-open and claims the single trial slot;
    /// otherwise the call is rejected with the remaining cooldown. The
    /// caller holds the returned permit for the invocation's lifetime.
    pub async fn check(&self) -> Result<BreakerPermit, InvocationError> {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => Ok(BreakerPermit { _probe: None }),
            BreakerState::HalfOpen => {
                if inner.probe.strong_count() > 0 {
                    Err(self.rejection(&inner))
                } else {
                    Ok(Self::claim_probe(&mut inner))
                }
            }
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown() {
                    inner.state = BreakerState::HalfOpen;
                    debug!(agent = %self.kind, "circuit half-open, admitting trial call");
                    Ok(Self::claim_probe(&mut inner))
                } else {
                    Err(self.rejection(&inner))
                }
            }
        }
    }

    fn claim_probe(inner: &mut BreakerInner) -> BreakerPermit {
        let token = Arc::new(());
        inner.probe = Arc::downgrade(&token);
        BreakerPermit {
            _probe: Some(token),
        }
    }

    fn rejection(&self, inner: &BreakerInner) -> InvocationError {
        let remaining = inner
            .opened_at
            .map(|t| self.cooldown().saturating_sub(t.elapsed()))
            .unwrap_or_else(|| self.cooldown());
        InvocationError::CircuitOpen {
            agent: self.kind.as_str().to_string(),
            retry_after_ms: remaining.as_millis() as u64,
        }
    }

    /// Record a finished invocation that succeeded. Closes a half-open
    /// breaker and clears the failure run.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        if inner.state == BreakerState::HalfOpen {
            debug!(agent = %self.kind, "trial call succeeded, circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe = Weak::new();
    }

    /// Record a finished invocation that failed (retries exhausted, permanent
    /// error, or final timeout). Returns true when this failure opened the
    /// circuit.
    pub async fn record_failure(&self) -> bool {
        let mut inner = self.inner.write().await;
        inner.consecutive_failures += 1;

        let opens = match inner.state {
            // A failed trial reopens immediately.
            BreakerState::HalfOpen => true,
            BreakerState::Closed => {
                inner.consecutive_failures >= self.config.failure_threshold
            }
            BreakerState::Open => false,
        };
        if opens {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe = Weak::new();
            warn!(
                agent = %self.kind,
                consecutive_failures = inner.consecutive_failures,
                cooldown_ms = self.config.cooldown_ms,
                "circuit opened"
            );
        }
        opens
    }

    /// Current state without side effects.
    pub async fn state(&self) -> BreakerState {
        self.inner.read().await.state
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.read().await.consecutive_failures
    }

    /// Operator override: reset to closed regardless of history.
    pub async fn force_close(&self) {
        let mut inner = self.inner.write().await;
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe = Weak::new();
    }
}

/// Lazily-populated breaker per agent kind. Cheap to clone; clones share
/// the same breakers.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    breakers: Arc<DashMap<AgentKind, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The breaker for `kind`, created from `config` on first use. The
    /// config is fixed at creation; later calls with a different config do
    /// not re-tune a live breaker.
    pub fn breaker_for(&self, kind: AgentKind, config: &BreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(kind)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(kind, config.clone())))
            .clone()
    }

    /// Snapshot of every instantiated breaker's state.
    pub async fn states(&self) -> HashMap<AgentKind, BreakerState> {
        let mut states = HashMap::new();
        let breakers: Vec<(AgentKind, Arc<CircuitBreaker>)> = self
            .breakers
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        for (kind, breaker) in breakers {
            states.insert(kind, breaker.state().await);
        }
        states
    }

    pub async fn force_close(&self, kind: AgentKind) {
        if let Some(breaker) = self.breakers.get(&kind).map(|e| Arc::clone(e.value())) {
            breaker.force_close().await;
        }
    }
}
