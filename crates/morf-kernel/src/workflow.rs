//! Workflow definitions: steps, dependencies, and DAG validation.
//!
//! A [`WorkflowDefinition`] is assembled once through
//! [`WorkflowDefinitionBuilder`], validated at `build()`, and immutable
//! afterwards. Validation rejects unknown step references and cycles
//! (naming the offending cycle), and precomputes the topological levels
//! used for level-parallel dispatch. One definition may back any number of
//! concurrent sessions.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

use crate::agent::AgentKind;
use crate::policy::RetryConfig;

// ============================================================================
// Errors
// ============================================================================

/// Rejections produced while building a definition. Fatal: a definition
/// that fails to build never exists, partially or otherwise.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum DefinitionError {
    #[error("Workflow definition has no steps")]
    Empty,

    #[error("Duplicate step id '{step_id}'")]
    DuplicateStep { step_id: String },

    #[error("Dependency references unknown step '{step_id}'")]
    UnknownStep { step_id: String },

    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },
}

// ============================================================================
// Steps and dependencies
// ============================================================================

/// One unit of work, executed by an agent of the declared kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the owning definition.
    pub id: String,
    /// Which collaborator runs this step.
    pub agent: AgentKind,
    /// Per-attempt timeout override; falls back to the agent policy.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Retry override; falls back to the definition's default.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// When false, failure is tolerated: the step is recorded as failed
    /// and the session continues.
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, agent: AgentKind) -> Self {
        Self {
            id: id.into(),
            agent,
            timeout_ms: None,
            retry: None,
            required: true,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Mark the step tolerable: its failure never fails the session.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Condition gating a dependency edge, checked against the from-step's
/// recorded output when the dependent step becomes ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardCondition {
    /// Passes when the output object contains `key`.
    OutputKeyExists { key: String },
    /// Passes when the output object's `key` equals `value`.
    OutputKeyEquals {
        key: String,
        value: serde_json::Value,
    },
}

impl GuardCondition {
    /// Evaluate against the from-step's output; a missing output never
    /// passes.
    pub fn evaluate(&self, output: Option<&serde_json::Value>) -> bool {
        let Some(output) = output else {
            return false;
        };
        match self {
            GuardCondition::OutputKeyExists { key } => output.get(key).is_some(),
            GuardCondition::OutputKeyEquals { key, value } => {
                output.get(key).is_some_and(|v| v == value)
            }
        }
    }
}

/// Directed edge: `to` runs only after `from` resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDependency {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub guard: Option<GuardCondition>,
}

impl WorkflowDependency {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: None,
        }
    }

    pub fn with_guard(mut self, guard: GuardCondition) -> Self {
        self.guard = Some(guard);
        self
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Accumulates steps and edges, then validates everything in `build()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefinitionBuilder {
    id: String,
    steps: Vec<WorkflowStep>,
    #[serde(default)]
    dependencies: Vec<WorkflowDependency>,
    #[serde(default)]
    global_timeout_ms: Option<u64>,
    #[serde(default)]
    default_retry: Option<RetryConfig>,
}

impl WorkflowDefinitionBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn dependency(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.dependencies.push(WorkflowDependency::new(from, to));
        self
    }

    pub fn guarded_dependency(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        guard: GuardCondition,
    ) -> Self {
        self.dependencies
            .push(WorkflowDependency::new(from, to).with_guard(guard));
        self
    }

    /// Overall session budget; sessions bound to this definition expire
    /// after this much wall-clock time.
    pub fn global_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.global_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn default_retry(mut self, retry: RetryConfig) -> Self {
        self.default_retry = Some(retry);
        self
    }

    /// Validate and freeze. Checks, in order: non-empty, unique step ids,
    /// known dependency endpoints, acyclicity. Also computes the
    /// topological levels so `execution_order()` is a plain lookup.
    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::Empty);
        }

        let mut ids = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(DefinitionError::DuplicateStep {
                    step_id: step.id.clone(),
                });
            }
        }
        for dep in &self.dependencies {
            for endpoint in [&dep.from, &dep.to] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(DefinitionError::UnknownStep {
                        step_id: endpoint.clone(),
                    });
                }
            }
        }

        let levels = compute_levels(&self.steps, &self.dependencies)?;
        debug!(
            workflow_id = %self.id,
            steps = self.steps.len(),
            levels = levels.len(),
            "workflow definition validated"
        );

        Ok(WorkflowDefinition {
            id: self.id,
            steps: self.steps,
            dependencies: self.dependencies,
            global_timeout_ms: self.global_timeout_ms,
            default_retry: self.default_retry.unwrap_or_default(),
            levels,
        })
    }
}

// ============================================================================
// Definition
// ============================================================================

/// Validated, immutable DAG of steps. Construct via
/// [`WorkflowDefinition::builder`]; deserialization routes through the same
/// validation, so no unvalidated definition can exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "WorkflowDefinitionBuilder")]
pub struct WorkflowDefinition {
    id: String,
    steps: Vec<WorkflowStep>,
    dependencies: Vec<WorkflowDependency>,
    global_timeout_ms: Option<u64>,
    default_retry: RetryConfig,
    levels: Vec<Vec<String>>,
}

impl TryFrom<WorkflowDefinitionBuilder> for WorkflowDefinition {
    type Error = DefinitionError;

    fn try_from(builder: WorkflowDefinitionBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}

impl WorkflowDefinition {
    pub fn builder(id: impl Into<String>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn dependencies(&self) -> &[WorkflowDependency] {
        &self.dependencies
    }

    /// Incoming edges of a step.
    pub fn dependencies_of<'a>(
        &'a self,
        step_id: &'a str,
    ) -> impl Iterator<Item = &'a WorkflowDependency> {
        self.dependencies.iter().filter(move |d| d.to == step_id)
    }

    /// Topological levels: each level's dependencies are all satisfied by
    /// strictly earlier levels, so steps within one level may run
    /// concurrently.
    pub fn execution_order(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn global_timeout_ms(&self) -> Option<u64> {
        self.global_timeout_ms
    }

    pub fn default_retry(&self) -> &RetryConfig {
        &self.default_retry
    }

    /// Retry config in effect for a step (override or definition default).
    pub fn effective_retry(&self, step_id: &str) -> RetryConfig {
        self.step(step_id)
            .and_then(|s| s.retry.clone())
            .unwrap_or_else(|| self.default_retry.clone())
    }
}

/// Kahn layering over the dependency edges. Leftover nodes mean a cycle,
/// which is then enumerated with a DFS for the error message.
fn compute_levels(
    steps: &[WorkflowStep],
    dependencies: &[WorkflowDependency],
) -> Result<Vec<Vec<String>>, DefinitionError> {
    let mut incoming: HashMap<&str, HashSet<&str>> = HashMap::new();
    for step in steps {
        incoming.entry(step.id.as_str()).or_default();
    }
    for dep in dependencies {
        if let Some(set) = incoming.get_mut(dep.to.as_str()) {
            set.insert(dep.from.as_str());
        }
    }

    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut placed: HashSet<&str> = HashSet::new();
    while placed.len() < steps.len() {
        // Declared step order keeps level contents deterministic.
        let ready: Vec<&str> = steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| !placed.contains(id))
            .filter(|id| incoming[id].iter().all(|dep| placed.contains(dep)))
            .collect();

        if ready.is_empty() {
            let remaining: Vec<&str> = steps
                .iter()
                .map(|s| s.id.as_str())
                .filter(|id| !placed.contains(id))
                .collect();
            return Err(DefinitionError::CycleDetected {
                cycle: find_cycle(&remaining, &incoming),
            });
        }

        placed.extend(ready.iter().copied());
        levels.push(ready.into_iter().map(String::from).collect());
    }

    Ok(levels)
}

/// Walk backward over incoming edges until a node repeats, then slice out
/// the loop. Every un-layerable node has an unplaced predecessor, so the
/// walk never dead-ends and must revisit a node within `remaining.len()`
/// hops.
fn find_cycle(remaining: &[&str], incoming: &HashMap<&str, HashSet<&str>>) -> Vec<String> {
    let in_remaining: HashSet<&str> = remaining.iter().copied().collect();
    let mut current = remaining[0];
    let mut path: Vec<&str> = vec![current];

    loop {
        let prev = incoming[current]
            .iter()
            .copied()
            .find(|n| in_remaining.contains(n))
            .unwrap_or(current);
        if let Some(pos) = path.iter().position(|n| *n == prev) {
            // The backward path lists the cycle in reverse edge order.
            let mut cycle: Vec<String> =
                path[pos..].iter().rev().map(|s| s.to_string()).collect();
            let first = cycle[0].clone();
            cycle.push(first);
            return cycle;
        }
        path.push(prev);
        current = prev;
    }
}
