//! Morf Runtime — the live orchestration machinery.
//!
//! Everything the kernel only declares happens here: the session manager
//! facade, the level-parallel scheduler, the policy-driven agent invoker
//! with per-kind circuit breakers, the resource pool, the checkpointing
//! session arena, and the per-session provenance tracker.
//!
//! The usual entry point is [`SessionManager`]: register agents and
//! workflow definitions, then `start` sessions and observe them through
//! status snapshots or the [`ExecutionEvent`] stream.

// per-agent-kind circuit breakers
pub mod breaker;

// typed checkpoint layer over the blob store
pub mod checkpoint;

// policy-driven step invocation
pub mod invoker;

// the facade: catalog, lifecycle, maintenance
pub mod manager;

// in-process blob store
pub mod memory;

// per-session provenance graphs
pub mod provenance;

// concurrency slots and memory budget
pub mod resource;

// backoff schedule
pub mod retry;

// level-parallel workflow execution
pub mod scheduler;

// session arena and checkpoint-on-transition
pub mod store;

pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use checkpoint::CheckpointStore;
pub use invoker::{AgentInvoker, AgentRegistry, InvocationOutcome, InvokerConfig};
pub use manager::{MaintenanceHandle, RuntimeConfig, SessionManager};
pub use memory::MemoryBlobStore;
pub use provenance::ProvenanceTracker;
pub use resource::{
    AdmissionPolicy, ResourceAllocation, ResourceLimits, ResourceManager, ResourceRequest,
    UtilizationSnapshot,
};
pub use scheduler::{ExecutionEvent, Scheduler};
pub use store::SessionStore;
