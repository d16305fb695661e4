//! Relationship store: typed, directed, de-duplicated edges.
//!
//! Predicates are folded onto a small canonical vocabulary so that "loved"
//! and "enjoyed" reinforce the same `liked` edge instead of creating two.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::RelationshipConfig;
use crate::error::{MglError, Result};
use crate::persistence::MemoryStore;
use crate::types::{now, Direction, EntityId, EntityType, Relationship, RelationshipId};

/// Relationships returned by [`RelationshipStore::relationships_for_entity`].
const ENTITY_RELATIONSHIP_LIMIT: usize = 200;
/// Relationships returned by [`RelationshipStore::query_relationships`].
const QUERY_LIMIT: usize = 100;
/// Graph view bounds.
const GRAPH_NODE_LIMIT: usize = 200;
const GRAPH_EDGE_LIMIT: usize = 500;

/// Predicate used when none is given.
pub const DEFAULT_PREDICATE: &str = "related_to";

const PREDICATE_SYNONYMS: &[(&str, &[&str])] = &[
    ("met", &["encountered", "saw", "visited", "ran into"]),
    ("liked", &["loved", "enjoyed", "appreciated", "fond of", "cared about"]),
    ("disliked", &["hated", "despised", "annoyed by", "bothered by"]),
    (
        "worked_with",
        &["collaborated with", "partnered with", "teamed with", "works with", "working with"],
    ),
    ("talked_about", &["mentioned", "discussed", "referenced", "spoke about"]),
    ("knows", &["familiar with", "acquainted with"]),
    ("related_to", &["connected to", "associated with", "linked to"]),
];

/// Fold a free-form predicate onto its canonical form.
///
/// Known synonyms map to their canonical verb; anything else is lowercased,
/// trimmed and has inner whitespace runs replaced by `_`. Blank input maps
/// to [`DEFAULT_PREDICATE`]. Applying it twice changes nothing.
#[must_use]
pub fn canonical_predicate(predicate: &str) -> String {
    let lowered = predicate.trim().to_lowercase();
    let words: Vec<&str> = lowered.split(|c: char| c.is_whitespace() || c == '_').filter(|w| !w.is_empty()).collect();
    if words.is_empty() {
        return DEFAULT_PREDICATE.to_string();
    }

    let spaced = words.join(" ");
    let underscored = words.join("_");
    for (canonical, synonyms) in PREDICATE_SYNONYMS {
        if underscored == *canonical || synonyms.contains(&spaced.as_str()) {
            return (*canonical).to_string();
        }
    }
    lowered.split_whitespace().collect::<Vec<_>>().join("_")
}

/// A node in the graph view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    /// Entity id.
    pub id: EntityId,
    /// Entity name.
    pub label: String,
    /// Entity type.
    pub kind: EntityType,
    /// Current confidence.
    pub confidence: f64,
    /// Mention count.
    pub mention_count: u32,
}

/// An edge in the graph view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    /// Relationship id.
    pub id: RelationshipId,
    /// Subject entity.
    pub source: EntityId,
    /// Object entity.
    pub target: EntityId,
    /// Canonical predicate.
    pub label: String,
    /// Accumulated strength.
    pub strength: f64,
}

/// Active entities and relationships of one owner, for visualisation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryGraph {
    /// Up to 200 most recently seen entities.
    pub nodes: Vec<GraphNode>,
    /// Up to 500 strongest relationships.
    pub edges: Vec<GraphEdge>,
}

/// Create, reinforce, query and forget relationships.
pub struct RelationshipStore {
    store: Arc<dyn MemoryStore>,
    config: RelationshipConfig,
}

impl RelationshipStore {
    /// Build the store over a persistence engine.
    #[must_use]
    pub fn new(store: Arc<dyn MemoryStore>, config: RelationshipConfig) -> Self {
        Self { store, config }
    }

    /// Confidence used when the caller has none.
    #[must_use]
    pub fn default_confidence(&self) -> f64 {
        self.config.default_confidence
    }

    /// Record `subject -predicate-> object`.
    ///
    /// An existing active relationship with the same canonical triple is
    /// reinforced (confidence and strength raised, evidence extended);
    /// otherwise a new one is created with `strength = confidence`.
    ///
    /// # Errors
    ///
    /// [`MglError::Contention`] when concurrent writers keep replacing the
    /// triple; persistence failures.
    pub fn create_relationship(
        &self,
        owner: &str,
        subject: EntityId,
        predicate: &str,
        object: EntityId,
        confidence: f64,
        evidence_session: Option<&str>,
    ) -> Result<Relationship> {
        let predicate = canonical_predicate(predicate);
        let confidence = confidence.clamp(0.0, 1.0);
        let t = now();
        let fresh = Relationship {
            id: RelationshipId::new(),
            owner: owner.to_string(),
            subject_id: subject,
            predicate: predicate.clone(),
            object_id: object,
            strength: confidence,
            confidence,
            evidence: evidence_session.map(str::to_string).into_iter().collect::<BTreeSet<_>>(),
            created_at: t,
            updated_at: t,
            is_forgotten: false,
        };

        // Two rounds cover losing an insert race to a concurrent writer.
        for _ in 0..2 {
            if let Some(existing) = self.store.find_active_relationship(owner, subject, &predicate, object)? {
                if let Some(reinforced) = self.store.reinforce_relationship(
                    existing.id,
                    self.config.confidence_boost,
                    self.config.strength_boost,
                    evidence_session,
                    now(),
                )? {
                    debug!(
                        relationship_id = %reinforced.id,
                        predicate = %reinforced.predicate,
                        strength = reinforced.strength,
                        "Relationship reinforced"
                    );
                    return Ok(reinforced);
                }
                continue;
            }
            if self.store.insert_relationship(&fresh)? {
                info!(
                    relationship_id = %fresh.id,
                    owner,
                    subject = %subject,
                    predicate = %predicate,
                    object = %object,
                    "Relationship created"
                );
                return Ok(fresh);
            }
        }
        Err(MglError::Contention(format!(
            "relationship {subject} {predicate} {object} changed concurrently while being written"
        )))
    }

    /// An active relationship owned by `owner`.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn get_relationship(&self, owner: &str, id: RelationshipId) -> Result<Option<Relationship>> {
        Ok(self
            .store
            .get_relationship(id)?
            .filter(|r| r.owner == owner && !r.is_forgotten))
    }

    /// Active relationships touching `entity`, strongest first.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn relationships_for_entity(
        &self,
        owner: &str,
        entity: EntityId,
        direction: Direction,
    ) -> Result<Vec<Relationship>> {
        self.store
            .relationships_for_entity(owner, entity, direction, ENTITY_RELATIONSHIP_LIMIT)
    }

    /// Active relationships matching the given filters, strongest first.
    /// The predicate filter is canonicalized first.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn query_relationships(
        &self,
        owner: &str,
        subject: Option<EntityId>,
        predicate: Option<&str>,
        object: Option<EntityId>,
    ) -> Result<Vec<Relationship>> {
        let predicate = predicate.map(canonical_predicate);
        self.store
            .query_relationships(owner, subject, predicate.as_deref(), object, QUERY_LIMIT)
    }

    /// Tombstone a relationship. Idempotent; returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn forget_relationship(&self, owner: &str, id: RelationshipId) -> Result<bool> {
        let changed = self.store.forget_relationship(owner, id)?;
        if changed {
            info!(relationship_id = %id, owner, "Relationship forgotten");
        }
        Ok(changed)
    }

    /// Nodes and edges for visualisation.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn graph(&self, owner: &str) -> Result<MemoryGraph> {
        let nodes = self
            .store
            .list_active_entities(owner, None, 0, GRAPH_NODE_LIMIT)?
            .into_iter()
            .map(|e| GraphNode {
                id: e.id,
                label: e.name,
                kind: e.kind,
                confidence: e.confidence,
                mention_count: e.mention_count,
            })
            .collect();
        let edges = self
            .store
            .query_relationships(owner, None, None, None, GRAPH_EDGE_LIMIT)?
            .into_iter()
            .map(|r| GraphEdge {
                id: r.id,
                source: r.subject_id,
                target: r.object_id,
                label: r.predicate,
                strength: r.strength,
            })
            .collect();
        Ok(MemoryGraph { nodes, edges })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::persistence::{DecayWrite, EntityCounts, ResetSummary, SqliteStore};
    use crate::types::{Entity, Event, MemorySnapshot};

    fn store() -> RelationshipStore {
        RelationshipStore::new(
            Arc::new(SqliteStore::open_in_memory().expect("open")),
            RelationshipConfig::default(),
        )
    }

    #[test]
    fn synonyms_fold_to_canonical() {
        assert_eq!(canonical_predicate("loved"), "liked");
        assert_eq!(canonical_predicate("  Fond   Of "), "liked");
        assert_eq!(canonical_predicate("ran into"), "met");
        assert_eq!(canonical_predicate("worked with"), "worked_with");
        assert_eq!(canonical_predicate("Works With"), "worked_with");
        assert_eq!(canonical_predicate("mentioned"), "talked_about");
    }

    #[test]
    fn unmapped_predicates_are_snake_cased() {
        assert_eq!(canonical_predicate("Works For"), "works_for");
        assert_eq!(canonical_predicate("is   sister of"), "is_sister_of");
        assert_eq!(canonical_predicate("   "), DEFAULT_PREDICATE);
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for p in ["loved", "fond of", "Works For", "related_to", "talked about", "x"] {
            let once = canonical_predicate(p);
            assert_eq!(canonical_predicate(&once), once, "predicate {p:?}");
        }
    }

    #[test]
    fn synonyms_reinforce_one_relationship() {
        let store = store();
        let (me, pizza) = (EntityId::new(), EntityId::new());
        let first = store
            .create_relationship("u1", me, "loved", pizza, 0.8, Some("s1"))
            .expect("create");
        let mut last = first.clone();
        for session in ["s2", "s3", "s4", "s5"] {
            last = store
                .create_relationship("u1", me, "enjoyed", pizza, 0.8, Some(session))
                .expect("reinforce");
        }

        assert_eq!(last.id, first.id);
        assert_eq!(last.predicate, "liked");
        assert!((last.strength - 1.0).abs() < f64::EPSILON);
        assert!((last.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(last.evidence.len(), 5);
        assert_eq!(store.query_relationships("u1", None, None, None).expect("q").len(), 1);
    }

    #[test]
    fn reinforcement_adds_fixed_boosts() {
        let store = store();
        let (a, b) = (EntityId::new(), EntityId::new());
        let created = store.create_relationship("u1", a, "knows", b, 0.5, None).expect("create");
        assert!((created.strength - 0.5).abs() < 1e-9);
        assert!(created.evidence.is_empty());

        let again = store.create_relationship("u1", a, "knows", b, 0.5, None).expect("again");
        assert!((again.confidence - 0.6).abs() < 1e-9);
        assert!((again.strength - 0.65).abs() < 1e-9);
    }

    #[test]
    fn forgotten_triple_can_be_relearned() {
        let store = store();
        let (a, b) = (EntityId::new(), EntityId::new());
        let old = store.create_relationship("u1", a, "met", b, 0.9, None).expect("create");
        assert!(store.forget_relationship("u1", old.id).expect("forget"));
        assert!(!store.forget_relationship("u1", old.id).expect("forget"));
        assert!(store.get_relationship("u1", old.id).expect("get").is_none());

        let new = store.create_relationship("u1", a, "saw", b, 0.9, None).expect("create");
        assert_ne!(new.id, old.id);
    }

    #[test]
    fn query_canonicalizes_predicate_filter() {
        let store = store();
        let (a, b, c) = (EntityId::new(), EntityId::new(), EntityId::new());
        store.create_relationship("u1", a, "loved", b, 0.9, None).expect("create");
        store.create_relationship("u1", a, "knows", c, 0.4, None).expect("create");

        let liked = store.query_relationships("u1", Some(a), Some("enjoyed"), None).expect("q");
        assert_eq!(liked.len(), 1);
        assert_eq!(liked[0].object_id, b);

        let all = store.relationships_for_entity("u1", a, Direction::Subject).expect("q");
        assert_eq!(all.len(), 2);
        assert!(all[0].strength >= all[1].strength);
    }

    /// Store whose relationship inserts always lose to an invisible writer.
    struct LosingInserts(SqliteStore);

    impl MemoryStore for LosingInserts {
        fn insert_entity(&self, entity: &Entity) -> Result<()> {
            self.0.insert_entity(entity)
        }
        fn get_entity(&self, id: EntityId) -> Result<Option<Entity>> {
            self.0.get_entity(id)
        }
        fn list_active_entities(
            &self,
            owner: &str,
            kind: Option<EntityType>,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<Entity>> {
            self.0.list_active_entities(owner, kind, offset, limit)
        }
        fn record_mention(&self, id: EntityId, alias: &str, seen_at: DateTime<Utc>) -> Result<Option<Entity>> {
            self.0.record_mention(id, alias, seen_at)
        }
        fn reinforce_entity(&self, id: EntityId, boost: f64, seen_at: DateTime<Utc>) -> Result<Option<Entity>> {
            self.0.reinforce_entity(id, boost, seen_at)
        }
        fn set_entity_confidence(&self, id: EntityId, confidence: f64) -> Result<bool> {
            self.0.set_entity_confidence(id, confidence)
        }
        fn forget_entity(&self, owner: &str, id: EntityId) -> Result<bool> {
            self.0.forget_entity(owner, id)
        }
        fn decay_entity(&self, id: EntityId, expected_last_seen: DateTime<Utc>, write: DecayWrite) -> Result<bool> {
            self.0.decay_entity(id, expected_last_seen, write)
        }
        fn decay_entity_candidates(&self, limit: usize) -> Result<Vec<Entity>> {
            self.0.decay_entity_candidates(limit)
        }
        fn entity_counts(&self, owner: &str) -> Result<EntityCounts> {
            self.0.entity_counts(owner)
        }
        fn insert_relationship(&self, _relationship: &Relationship) -> Result<bool> {
            Ok(false)
        }
        fn get_relationship(&self, id: RelationshipId) -> Result<Option<Relationship>> {
            self.0.get_relationship(id)
        }
        fn find_active_relationship(
            &self,
            _owner: &str,
            _subject: EntityId,
            _predicate: &str,
            _object: EntityId,
        ) -> Result<Option<Relationship>> {
            Ok(None)
        }
        fn reinforce_relationship(
            &self,
            id: RelationshipId,
            confidence_boost: f64,
            strength_boost: f64,
            evidence: Option<&str>,
            at: DateTime<Utc>,
        ) -> Result<Option<Relationship>> {
            self.0.reinforce_relationship(id, confidence_boost, strength_boost, evidence, at)
        }
        fn query_relationships(
            &self,
            owner: &str,
            subject: Option<EntityId>,
            predicate: Option<&str>,
            object: Option<EntityId>,
            limit: usize,
        ) -> Result<Vec<Relationship>> {
            self.0.query_relationships(owner, subject, predicate, object, limit)
        }
        fn relationships_for_entity(
            &self,
            owner: &str,
            entity: EntityId,
            direction: Direction,
            limit: usize,
        ) -> Result<Vec<Relationship>> {
            self.0.relationships_for_entity(owner, entity, direction, limit)
        }
        fn forget_relationship(&self, owner: &str, id: RelationshipId) -> Result<bool> {
            self.0.forget_relationship(owner, id)
        }
        fn decay_relationship(
            &self,
            id: RelationshipId,
            expected_updated_at: DateTime<Utc>,
            write: DecayWrite,
        ) -> Result<bool> {
            self.0.decay_relationship(id, expected_updated_at, write)
        }
        fn decay_relationship_candidates(&self, limit: usize) -> Result<Vec<Relationship>> {
            self.0.decay_relationship_candidates(limit)
        }
        fn relationship_count(&self, owner: &str) -> Result<u64> {
            self.0.relationship_count(owner)
        }
        fn insert_event(&self, event: &Event) -> Result<()> {
            self.0.insert_event(event)
        }
        fn recent_events(&self, owner: &str, since: Option<DateTime<Utc>>, limit: usize) -> Result<Vec<Event>> {
            self.0.recent_events(owner, since, limit)
        }
        fn events_since(&self, owner: &str, since: Option<DateTime<Utc>>, limit: usize) -> Result<Vec<Event>> {
            self.0.events_since(owner, since, limit)
        }
        fn events_for_session(&self, session_id: &str, limit: usize) -> Result<Vec<Event>> {
            self.0.events_for_session(session_id, limit)
        }
        fn events_for_entity(&self, owner: &str, entity: EntityId, limit: usize) -> Result<Vec<Event>> {
            self.0.events_for_entity(owner, entity, limit)
        }
        fn event_count(&self, owner: &str) -> Result<u64> {
            self.0.event_count(owner)
        }
        fn insert_snapshot(&self, snapshot: &MemorySnapshot) -> Result<()> {
            self.0.insert_snapshot(snapshot)
        }
        fn snapshots(&self, owner: &str, limit: usize) -> Result<Vec<MemorySnapshot>> {
            self.0.snapshots(owner, limit)
        }
        fn owners(&self) -> Result<Vec<String>> {
            self.0.owners()
        }
        fn reset_owner(&self, owner: &str) -> Result<ResetSummary> {
            self.0.reset_owner(owner)
        }
    }

    #[test]
    fn endless_insert_races_surface_as_contention() {
        let store = RelationshipStore::new(
            Arc::new(LosingInserts(SqliteStore::open_in_memory().expect("open"))),
            RelationshipConfig::default(),
        );
        let err = store
            .create_relationship("u1", EntityId::new(), "met", EntityId::new(), 0.9, None)
            .expect_err("must fail");
        assert!(matches!(err, MglError::Contention(ref msg) if msg.contains("met")), "{err}");
    }

    #[test]
    fn graph_lists_edges() {
        let store = store();
        let (a, b) = (EntityId::new(), EntityId::new());
        store.create_relationship("u1", a, "met", b, 0.9, None).expect("create");
        let graph = store.graph("u1").expect("graph");
        assert!(graph.nodes.is_empty());
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].label, "met");
    }
}
