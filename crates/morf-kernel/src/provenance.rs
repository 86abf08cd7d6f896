//! Append-only provenance graph for one session.
//!
//! Entities are data artifacts, activities are step executions, agents are
//! the executors. Relationships follow the PROV vocabulary the rest of the
//! pipeline emits (`used`, `wasGeneratedBy`, `wasAssociatedWith`,
//! `wasDerivedFrom`). The graph only grows: adds are idempotent under
//! duplicate identifiers and nothing is ever edited in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::agent::AgentKind;

/// Typed relationship between two graph nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    #[serde(rename = "used")]
    Used,
    #[serde(rename = "wasGeneratedBy")]
    WasGeneratedBy,
    #[serde(rename = "wasAssociatedWith")]
    WasAssociatedWith,
    #[serde(rename = "wasDerivedFrom")]
    WasDerivedFrom,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Used => "used",
            RelationKind::WasGeneratedBy => "wasGeneratedBy",
            RelationKind::WasAssociatedWith => "wasAssociatedWith",
            RelationKind::WasDerivedFrom => "wasDerivedFrom",
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A data artifact (input file, produced file, metadata document).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvEntity {
    pub id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl ProvEntity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// One step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvActivity {
    pub id: String,
    pub agent: AgentKind,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl ProvActivity {
    pub fn new(id: impl Into<String>, agent: AgentKind) -> Self {
        Self {
            id: id.into(),
            agent,
            recorded_at: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// An executor referenced by activities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvAgentRef {
    pub id: String,
    pub kind: AgentKind,
}

impl ProvAgentRef {
    /// Canonical id for an agent kind, shared by every activity it ran.
    pub fn for_kind(kind: AgentKind) -> Self {
        Self {
            id: format!("agent:{kind}"),
            kind,
        }
    }
}

/// Directed, typed edge. Direction follows PROV: `used` points
/// activity→entity, `wasGeneratedBy` entity→activity, `wasAssociatedWith`
/// activity→agent, `wasDerivedFrom` derived→source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvRelation {
    pub kind: RelationKind,
    pub from: String,
    pub to: String,
}

/// The per-session graph. Construct once, then only append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceGraph {
    session_id: String,
    entities: BTreeMap<String, ProvEntity>,
    activities: BTreeMap<String, ProvActivity>,
    agents: BTreeMap<String, ProvAgentRef>,
    relations: Vec<ProvRelation>,
    created_at: DateTime<Utc>,
}

impl ProvenanceGraph {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            entities: BTreeMap::new(),
            activities: BTreeMap::new(),
            agents: BTreeMap::new(),
            relations: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append an entity; a duplicate id leaves the first record untouched.
    /// Returns whether the entity was newly added.
    pub fn add_entity(&mut self, entity: ProvEntity) -> bool {
        if self.entities.contains_key(&entity.id) {
            return false;
        }
        self.entities.insert(entity.id.clone(), entity);
        true
    }

    pub fn add_activity(&mut self, activity: ProvActivity) -> bool {
        if self.activities.contains_key(&activity.id) {
            return false;
        }
        self.activities.insert(activity.id.clone(), activity);
        true
    }

    pub fn add_agent(&mut self, agent: ProvAgentRef) -> bool {
        if self.agents.contains_key(&agent.id) {
            return false;
        }
        self.agents.insert(agent.id.clone(), agent);
        true
    }

    /// Append a relationship; exact duplicates are ignored.
    pub fn add_relationship(
        &mut self,
        kind: RelationKind,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> bool {
        let relation = ProvRelation {
            kind,
            from: from.into(),
            to: to.into(),
        };
        if self.relations.contains(&relation) {
            return false;
        }
        self.relations.push(relation);
        true
    }

    /// Convenience for one finished invocation: appends the activity,
    /// ensures both entities and the agent exist, and wires
    /// `used` / `wasGeneratedBy` / `wasAssociatedWith`.
    pub fn record_invocation(
        &mut self,
        activity: ProvActivity,
        input_entity: impl Into<String>,
        output_entity: impl Into<String>,
    ) {
        let input = input_entity.into();
        let output = output_entity.into();
        let activity_id = activity.id.clone();
        let agent = ProvAgentRef::for_kind(activity.agent);
        let agent_id = agent.id.clone();

        self.add_entity(ProvEntity::new(input.clone()));
        self.add_entity(ProvEntity::new(output.clone()));
        self.add_agent(agent);
        self.add_activity(activity);
        self.add_relationship(RelationKind::Used, activity_id.clone(), input);
        self.add_relationship(RelationKind::WasGeneratedBy, output, activity_id.clone());
        self.add_relationship(RelationKind::WasAssociatedWith, activity_id, agent_id);
    }

    pub fn entity(&self, id: &str) -> Option<&ProvEntity> {
        self.entities.get(id)
    }

    pub fn activity(&self, id: &str) -> Option<&ProvActivity> {
        self.activities.get(id)
    }

    pub fn activities(&self) -> impl Iterator<Item = &ProvActivity> {
        self.activities.values()
    }

    pub fn relations(&self) -> &[ProvRelation] {
        &self.relations
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn activity_count(&self) -> usize {
        self.activities.len()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    /// Serialized form for external consumers; the live graph stays owned
    /// by the tracker.
    pub fn export(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
