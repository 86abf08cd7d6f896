//! Provenance tracker: one append-only graph per session.
//!
//! The graph structure lives in the kernel; this tracker owns the live
//! per-session instances and stamps invocation records with their attempt
//! accounting so the trail answers "what ran, how often, and why" without
//! consulting logs.

use dashmap::DashMap;
use std::sync::Arc;

use morf_kernel::invocation::AgentInvocation;
use morf_kernel::provenance::{
    ProvActivity, ProvEntity, ProvenanceGraph, RelationKind,
};
use morf_kernel::session::SessionState;

/// Owns every session's provenance graph. Cheap to clone; clones share the
/// same graphs.
#[derive(Clone, Default)]
pub struct ProvenanceTracker {
    graphs: Arc<DashMap<String, ProvenanceGraph>>,
}

impl ProvenanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session's graph if absent.
    pub fn ensure_session(&self, session_id: &str) {
        self.graphs
            .entry(session_id.to_string())
            .or_insert_with(|| ProvenanceGraph::new(session_id));
    }

    pub fn add_entity(&self, session_id: &str, entity: ProvEntity) -> bool {
        self.ensure_session(session_id);
        self.graphs
            .get_mut(session_id)
            .map(|mut g| g.add_entity(entity))
            .unwrap_or(false)
    }

    pub fn add_activity(&self, session_id: &str, activity: ProvActivity) -> bool {
        self.ensure_session(session_id);
        self.graphs
            .get_mut(session_id)
            .map(|mut g| g.add_activity(activity))
            .unwrap_or(false)
    }

    pub fn add_relationship(
        &self,
        session_id: &str,
        kind: RelationKind,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> bool {
        self.ensure_session(session_id);
        self.graphs
            .get_mut(session_id)
            .map(|mut g| g.add_relationship(kind, from, to))
            .unwrap_or(false)
    }

    /// Record one finished invocation: one activity per step (idempotent
    /// across re-invocations), wired to its input and output entities, with
    /// the attempt accounting attached. The output is additionally marked
    /// derived from the input.
    pub fn record_invocation(
        &self,
        invocation: &AgentInvocation,
        input_entity: impl Into<String>,
        output_entity: impl Into<String>,
    ) {
        let input = input_entity.into();
        let output = output_entity.into();
        let activity = ProvActivity::new(
            format!("activity:{}", invocation.step_id),
            invocation.agent,
        )
        .with_attribute("attempt_number", serde_json::json!(invocation.attempt_number))
        .with_attribute("retry_count", serde_json::json!(invocation.retry_count))
        .with_attribute("status", serde_json::json!(invocation.status))
        .with_attribute("trace_id", serde_json::json!(invocation.trace_id))
        .with_attribute("duration_ms", serde_json::json!(invocation.duration_ms()));

        self.ensure_session(&invocation.session_id);
        if let Some(mut graph) = self.graphs.get_mut(&invocation.session_id) {
            graph.record_invocation(activity, input.clone(), output.clone());
            graph.add_relationship(RelationKind::WasDerivedFrom, output, input);
        }
    }

    /// Record one checkpoint as an entity derived from its predecessor, so
    /// the trail carries the full version chain.
    pub fn record_checkpoint(&self, session_id: &str, version: u64, state: SessionState) {
        self.ensure_session(session_id);
        let Some(mut graph) = self.graphs.get_mut(session_id) else {
            return;
        };
        let entity_id = format!("checkpoint:{session_id}:{version}");
        graph.add_entity(
            ProvEntity::new(entity_id.clone())
                .with_attribute("state", serde_json::json!(state))
                .with_attribute("version", serde_json::json!(version)),
        );
        if version > 0 {
            graph.add_relationship(
                RelationKind::WasDerivedFrom,
                entity_id,
                format!("checkpoint:{session_id}:{}", version - 1),
            );
        }
    }

    /// Read access under a closure; the graph never leaves the tracker.
    pub fn with_graph<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&ProvenanceGraph) -> T,
    ) -> Option<T> {
        self.graphs.get(session_id).map(|g| f(&g))
    }

    /// Serialized graph for external consumers.
    pub fn export(&self, session_id: &str) -> Option<serde_json::Value> {
        self.graphs.get(session_id).map(|g| g.export())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morf_kernel::agent::{AgentKind, AgentRequest, AgentResponse};

    fn finished_invocation(attempts: u32) -> AgentInvocation {
        let request = AgentRequest::new("s-1", "convert", serde_json::json!({"src": "in.csv"}));
        let mut inv = AgentInvocation::new(AgentKind::Conversion, request, 3);
        for _ in 0..attempts {
            inv.begin_attempt();
        }
        inv.succeed(AgentResponse::completed(serde_json::json!({"out": "out.nwb"})));
        inv
    }

    #[test]
    fn invocation_activity_carries_attempt_accounting() {
        let tracker = ProvenanceTracker::new();
        tracker.record_invocation(&finished_invocation(3), "file:in.csv", "file:out.nwb");

        tracker
            .with_graph("s-1", |g| {
                assert_eq!(g.activity_count(), 1);
                let activity = g.activity("activity:convert").unwrap();
                assert_eq!(activity.attributes["attempt_number"], serde_json::json!(3));
                assert_eq!(activity.attributes["retry_count"], serde_json::json!(2));
                // used + wasGeneratedBy + wasAssociatedWith + wasDerivedFrom
                assert_eq!(g.relation_count(), 4);
            })
            .unwrap();
    }

    #[test]
    fn re_recording_a_step_is_idempotent() {
        let tracker = ProvenanceTracker::new();
        tracker.record_invocation(&finished_invocation(1), "file:a", "file:b");
        tracker.record_invocation(&finished_invocation(2), "file:a", "file:b");

        tracker
            .with_graph("s-1", |g| {
                assert_eq!(g.activity_count(), 1);
                // First record wins, matching the graph's append-only rule.
                let activity = g.activity("activity:convert").unwrap();
                assert_eq!(activity.attributes["attempt_number"], serde_json::json!(1));
            })
            .unwrap();
    }

    #[test]
    fn checkpoint_chain_links_versions() {
        let tracker = ProvenanceTracker::new();
        tracker.record_checkpoint("s-1", 0, SessionState::Analyzing);
        tracker.record_checkpoint("s-1", 1, SessionState::CollectingMetadata);
        tracker.record_checkpoint("s-1", 2, SessionState::Converting);

        tracker
            .with_graph("s-1", |g| {
                assert_eq!(g.entity_count(), 3);
                let derived: Vec<_> = g
                    .relations()
                    .iter()
                    .filter(|r| r.kind == RelationKind::WasDerivedFrom)
                    .collect();
                assert_eq!(derived.len(), 2);
                assert_eq!(derived[0].from, "checkpoint:s-1:1");
                assert_eq!(derived[0].to, "checkpoint:s-1:0");
            })
            .unwrap();
    }

    #[test]
    fn export_is_json() {
        let tracker = ProvenanceTracker::new();
        assert!(tracker.export("missing").is_none());

        tracker.record_invocation(&finished_invocation(1), "file:a", "file:b");
        let json = tracker.export("s-1").unwrap();
        assert!(json["activities"].is_object() || json["activities"].is_array());
    }
}
