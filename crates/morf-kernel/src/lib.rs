//! Morf Kernel — domain types, policies, and boundary traits for the
//! conversion orchestration core.
//!
//! The kernel is deliberately machinery-free: it defines what workflows,
//! sessions, invocations, and provenance records *are*, plus the agent and
//! storage traits the runtime drives. Everything here is plain data or a
//! trait; the live scheduler, invoker, and stores live in `morf-runtime`.

// agent boundary
pub mod agent;

// error taxonomy
pub mod error;

// invocation records
pub mod invocation;

// retry / breaker / per-kind policies
pub mod policy;

// provenance graph
pub mod provenance;

// session state machine and checkpoints
pub mod session;

// versioned blob persistence boundary
pub mod storage;

// workflow definitions and DAG validation
pub mod workflow;

pub use agent::{AgentKind, AgentRequest, AgentResponse, ConversionAgent, DynAgent, HealthStatus};
pub use error::{
    AgentResult, FailureKind, InvocationError, OrchestratorError, OrchestratorResult,
    ResourceError,
};
pub use invocation::{AgentInvocation, InvocationStatus};
pub use policy::{AgentPolicy, BreakerConfig, PolicySet, RetryConfig, RetryPolicy};
pub use provenance::{
    ProvActivity, ProvAgentRef, ProvEntity, ProvRelation, ProvenanceGraph, RelationKind,
};
pub use session::{
    Checkpoint, ConversionSession, SessionError, SessionFailure, SessionState, StepResult,
    StepStatus,
};
pub use storage::{DynBlobStore, StorageError, StorageResult, VersionedBlobStore};
pub use workflow::{
    DefinitionError, GuardCondition, WorkflowDefinition, WorkflowDefinitionBuilder,
    WorkflowDependency, WorkflowStep,
};
