//! Retry, timeout, and circuit-breaker policy types.
//!
//! These are plain serde-deserializable values: the configuration loader at
//! the process boundary (out of scope here) parses whatever format it likes
//! and hands the core a [`PolicySet`]. All durations are millisecond
//! integers on the wire.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::agent::AgentKind;

// ----------------------------------------------------------------------------
// Retry
// ----------------------------------------------------------------------------

/// Backoff shape applied between attempts of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Constant delay between attempts.
    Fixed { delay_ms: u64 },
    /// Exponential backoff: `base_ms * 2^(attempt-1)`, capped at `max_ms`.
    /// With `jitter`, the runtime samples uniformly from a band below the
    /// computed delay so concurrent retries spread out.
    ExponentialBackoff {
        base_ms: u64,
        max_ms: u64,
        #[serde(default = "default_jitter")]
        jitter: bool,
    },
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::ExponentialBackoff {
            base_ms: 500,
            max_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Deterministic delay after the given 1-based attempt fails, before
    /// any jitter. The shift is clamped so large attempt numbers cannot
    /// overflow the multiplication.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        match self {
            RetryPolicy::Fixed { delay_ms } => *delay_ms,
            RetryPolicy::ExponentialBackoff {
                base_ms, max_ms, ..
            } => {
                let shift = attempt.saturating_sub(1).min(14);
                base_ms.saturating_mul(1u64 << shift).min(*max_ms)
            }
        }
    }

    /// Whether the runtime should jitter the computed delay.
    pub fn jitter(&self) -> bool {
        match self {
            RetryPolicy::Fixed { .. } => false,
            RetryPolicy::ExponentialBackoff { jitter, .. } => *jitter,
        }
    }
}

/// How many attempts one invocation gets, and how long to wait between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first; 1 disables retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub policy: RetryPolicy,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            policy: RetryPolicy::default(),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with the given attempt budget.
    pub fn exponential(max_attempts: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            policy: RetryPolicy::ExponentialBackoff {
                base_ms,
                max_ms,
                jitter: true,
            },
        }
    }

    /// Fixed delay with the given attempt budget.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            policy: RetryPolicy::Fixed { delay_ms },
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            policy: RetryPolicy::Fixed { delay_ms: 0 },
        }
    }
}

// ----------------------------------------------------------------------------
// Circuit breaker
// ----------------------------------------------------------------------------

/// Per-agent-kind breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive invocation failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before one half-open trial.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

// ----------------------------------------------------------------------------
// Per-agent policy and the registry-loader boundary
// ----------------------------------------------------------------------------

/// Everything the invoker needs to call one agent kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPolicy {
    /// Per-attempt timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Startup policy table: one default plus per-kind overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub default: AgentPolicy,
    #[serde(default)]
    pub overrides: HashMap<AgentKind, AgentPolicy>,
}

impl PolicySet {
    /// Policy in effect for the given kind.
    pub fn policy_for(&self, kind: AgentKind) -> &AgentPolicy {
        self.overrides.get(&kind).unwrap_or(&self.default)
    }

    pub fn with_override(mut self, kind: AgentKind, policy: AgentPolicy) -> Self {
        self.overrides.insert(kind, policy);
        self
    }
}
