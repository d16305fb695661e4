//! The memory engine: one handle over every store and service.
//!
//! # Architecture
//!
//! ```text
//!  transcript ──► MemorySummarizer ──► EntityStore / RelationshipStore / EventStore
//!                                                   │
//!  query ──► MemoryEngine::recall ◄─────────────────┘──► memory context text
//!                                                          │
//!  question ──► MemoryEngine::answer_query ──► TextGenerator ◄┘
//!
//!  DecayScheduler ──► DecayService ──► MemoryStore (independent of requests)
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use mgl_llm::generator::TextGenerator;
use mgl_llm::prompt::{render_template, ANSWER_SYSTEM, ANSWER_USER};

use crate::config::MglConfig;
use crate::decay::{DecayService, DecayStats};
use crate::embedding::{Embedder, Scored};
use crate::entity::{infer_entity_type, EntityStore};
use crate::error::{MglError, Result};
use crate::event::EventStore;
use crate::extractor::{Extractor, IngestResult, LlmExtractor, MemorySummarizer};
use crate::persistence::{MemoryStore, ResetSummary};
use crate::relationship::{MemoryGraph, RelationshipStore};
use crate::types::{now, Direction, Entity, EntityId, EntityType, Event, MemorySnapshot, Relationship, RelationshipId};

/// Answer given when recall finds nothing.
pub const NO_MEMORIES_ANSWER: &str = "I don't have any memories related to that yet.";

/// Answer given when memories exist but the generator could not be reached.
pub const FALLBACK_ANSWER: &str =
    "I remember a few related things, but I can't put them into words right now. The supporting memories are listed below.";

const CONTEXT_HEADER: &str = "[MEMORY CONTEXT - what I remember about this user:]";
const CONTEXT_FOOTER: &str = "[END MEMORY CONTEXT]";

const CONTEXT_ENTITIES: usize = 5;
const CONTEXT_ATTRIBUTES: usize = 3;
const CONTEXT_RELATIONSHIPS: usize = 5;
const CONTEXT_EVENTS: usize = 3;
/// Entities whose relationships are pulled into a recall.
const RELATIONSHIP_SOURCES: usize = 3;
const SUPPORTING_ITEMS: usize = 3;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What [`MemoryEngine::recall`] found.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecallResult {
    /// Matching entities, most similar first.
    pub entities: Vec<Scored<Entity>>,
    /// Matching events, most similar first.
    pub events: Vec<Scored<Event>>,
    /// Relationships touching the best entities, de-duplicated.
    pub relationships: Vec<Relationship>,
    /// Text block for a chat model's context, empty when nothing matched.
    pub memory_context: String,
    /// `entities.len() + events.len()`.
    pub total_matches: usize,
}

/// Entity cited in a [`QueryAnswer`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupportingEntity {
    /// Entity name.
    pub name: String,
    /// Entity type.
    pub kind: EntityType,
}

/// Relationship cited in a [`QueryAnswer`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupportingRelationship {
    /// Canonical predicate.
    pub predicate: String,
    /// Current strength.
    pub strength: f64,
}

/// Memories an answer was based on.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupportingMemories {
    /// Up to three entities.
    pub entities: Vec<SupportingEntity>,
    /// Up to three event descriptions.
    pub events: Vec<String>,
    /// Up to three relationships.
    pub relationships: Vec<SupportingRelationship>,
}

/// A memory-grounded answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryAnswer {
    /// Answer text.
    pub answer: String,
    /// `min(1, matches × 0.2)`; 0 when nothing matched.
    pub confidence: f64,
    /// What the answer drew on.
    pub supporting: SupportingMemories,
}

/// Per-owner counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    /// Entities not forgotten.
    pub active_entities: u64,
    /// Tombstoned entities.
    pub forgotten_entities: u64,
    /// Relationships not forgotten.
    pub active_relationships: u64,
    /// All events.
    pub total_events: u64,
    /// Active entities per type.
    pub entity_types: BTreeMap<EntityType, u64>,
    /// Embedding model in use.
    pub embedding_model: String,
    /// Embedding dimension.
    pub embedding_dimensions: usize,
}

/// An entity with everything attached to it.
#[derive(Debug, Clone, Serialize)]
pub struct EntityDetail {
    /// The entity itself.
    pub entity: Entity,
    /// Active relationships in either direction.
    pub relationships: Vec<Relationship>,
    /// Events it took part in or was mentioned by, newest first.
    pub events: Vec<Event>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Facade over the memory graph for one deployment.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct MemoryEngine {
    store: Arc<dyn MemoryStore>,
    embedder: Arc<Embedder>,
    generator: Arc<dyn TextGenerator>,
    entities: Arc<EntityStore>,
    relationships: Arc<RelationshipStore>,
    events: Arc<EventStore>,
    summarizer: MemorySummarizer,
    decay: Arc<DecayService>,
    config: MglConfig,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("embedder", &self.embedder)
            .field("generator", &self.generator.model_name())
            .finish_non_exhaustive()
    }
}

impl MemoryEngine {
    /// Wire an engine with the LLM-backed extractor.
    #[must_use]
    pub fn new(
        store: Arc<dyn MemoryStore>,
        embedder: Arc<Embedder>,
        generator: Arc<dyn TextGenerator>,
        config: MglConfig,
    ) -> Self {
        let extractor = Arc::new(LlmExtractor::new(Arc::clone(&generator), config.extraction.clone()));
        Self::with_extractor(store, embedder, generator, extractor, config)
    }

    /// Wire an engine with a custom extractor.
    #[must_use]
    pub fn with_extractor(
        store: Arc<dyn MemoryStore>,
        embedder: Arc<Embedder>,
        generator: Arc<dyn TextGenerator>,
        extractor: Arc<dyn Extractor>,
        config: MglConfig,
    ) -> Self {
        let entities = Arc::new(EntityStore::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            config.entities.clone(),
        ));
        let relationships = Arc::new(RelationshipStore::new(Arc::clone(&store), config.relationships.clone()));
        let events = Arc::new(EventStore::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            config.events.clone(),
        ));
        let summarizer = MemorySummarizer::new(
            extractor,
            Arc::clone(&generator),
            Arc::clone(&store),
            Arc::clone(&entities),
            Arc::clone(&relationships),
            Arc::clone(&events),
            config.extraction.clone(),
            config.snapshot.clone(),
        );
        let decay = Arc::new(DecayService::new(
            Arc::clone(&store),
            config.decay.clone(),
            config.entities.default_decay_rate,
        ));
        info!(
            embedding_model = embedder.model_name(),
            embedding_available = embedder.is_available(),
            generator = generator.model_name(),
            "Memory engine initialized"
        );
        Self {
            store,
            embedder,
            generator,
            entities,
            relationships,
            events,
            summarizer,
            decay,
            config,
        }
    }

    /// Entity store.
    #[must_use]
    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    /// Relationship store.
    #[must_use]
    pub fn relationships(&self) -> &RelationshipStore {
        &self.relationships
    }

    /// Event store.
    #[must_use]
    pub fn events(&self) -> &EventStore {
        &self.events
    }

    /// Decay service, shareable with a [`crate::decay::DecayScheduler`].
    #[must_use]
    pub fn decay_service(&self) -> Arc<DecayService> {
        Arc::clone(&self.decay)
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &MglConfig {
        &self.config
    }

    // -- write path --------------------------------------------------------

    /// Extract and store knowledge from a session transcript.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn ingest(&self, owner: &str, session_id: &str, transcript: &str) -> Result<IngestResult> {
        self.summarizer.ingest(owner, session_id, transcript).await
    }

    /// Get-or-create an entity by name. Returns `(entity, created)`; an
    /// existing match is returned as-is, `attributes` only apply to a new
    /// entity. Without `kind` the type is inferred from the name.
    ///
    /// # Errors
    ///
    /// [`MglError::InvalidInput`] for a blank name; persistence failures.
    pub async fn create_entity(
        &self,
        owner: &str,
        name: &str,
        kind: Option<EntityType>,
        attributes: BTreeMap<String, String>,
    ) -> Result<(Entity, bool)> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MglError::InvalidInput("entity name must not be blank".into()));
        }
        if let Some(existing) = self.entities.resolve_entity(owner, name, "").await? {
            return Ok((existing, false));
        }
        let kind = kind.unwrap_or_else(|| infer_entity_type(name));
        let created = self.entities.create_entity(owner, name, kind, attributes, "").await?;
        Ok((created, true))
    }

    /// Relate two of the owner's active entities.
    ///
    /// # Errors
    ///
    /// [`MglError::EntityNotFound`] when either endpoint is unknown or
    /// forgotten; persistence failures.
    pub fn create_relationship(
        &self,
        owner: &str,
        subject: EntityId,
        predicate: &str,
        object: EntityId,
        confidence: Option<f64>,
    ) -> Result<Relationship> {
        for id in [subject, object] {
            if self.entities.get_entity(owner, id)?.is_none() {
                return Err(MglError::EntityNotFound(id));
            }
        }
        let confidence = confidence.unwrap_or_else(|| self.relationships.default_confidence());
        self.relationships
            .create_relationship(owner, subject, predicate, object, confidence, None)
    }

    // -- read path ---------------------------------------------------------

    /// Semantic recall of entities, events and connected relationships,
    /// rendered into a memory context block.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn recall(&self, owner: &str, query: &str, top_k: usize) -> Result<RecallResult> {
        let entities = self.entities.search_entities(owner, query, top_k).await?;
        let events = self.events.search_events(owner, query, top_k, None).await?;

        let mut seen = HashSet::new();
        let mut relationships = Vec::new();
        for scored in entities.iter().take(RELATIONSHIP_SOURCES) {
            for rel in self
                .relationships
                .relationships_for_entity(owner, scored.item.id, Direction::Both)?
            {
                if seen.insert(rel.id) {
                    relationships.push(rel);
                }
            }
        }

        let names = self.endpoint_names(owner, &entities, &relationships)?;
        let memory_context = render_memory_context(&entities, &relationships, &events, &names, now());
        let total_matches = entities.len() + events.len();

        if self.config.recall.reinforce_on_recall {
            for scored in &entities {
                self.decay.reinforce_entity(scored.item.id, None)?;
            }
        }

        debug!(
            owner,
            entities = entities.len(),
            events = events.len(),
            relationships = relationships.len(),
            "Recall complete"
        );
        Ok(RecallResult {
            entities,
            events,
            relationships,
            memory_context,
            total_matches,
        })
    }

    /// Recall with the configured default `top_k`.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn recall_default(&self, owner: &str, query: &str) -> Result<RecallResult> {
        self.recall(owner, query, self.config.recall.top_k).await
    }

    fn endpoint_names(
        &self,
        owner: &str,
        entities: &[Scored<Entity>],
        relationships: &[Relationship],
    ) -> Result<HashMap<EntityId, String>> {
        let mut names: HashMap<EntityId, String> =
            entities.iter().map(|s| (s.item.id, s.item.name.clone())).collect();
        for rel in relationships.iter().take(CONTEXT_RELATIONSHIPS) {
            for id in [rel.subject_id, rel.object_id] {
                if names.contains_key(&id) {
                    continue;
                }
                if let Some(entity) = self.entities.get_entity(owner, id)? {
                    names.insert(id, entity.name);
                }
            }
        }
        Ok(names)
    }

    /// Answer a question from memory through the text generator.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures. Generator failures produce
    /// [`FALLBACK_ANSWER`].
    pub async fn answer_query(&self, owner: &str, question: &str) -> Result<QueryAnswer> {
        let recall = self.recall(owner, question, self.config.recall.query_top_k).await?;
        if recall.total_matches == 0 {
            return Ok(QueryAnswer {
                answer: NO_MEMORIES_ANSWER.to_string(),
                confidence: 0.0,
                supporting: SupportingMemories::default(),
            });
        }

        let prompt = render_template(
            ANSWER_USER,
            &[("memory_context", &recall.memory_context), ("question", question)],
        );
        let answer = match self.generator.generate(&prompt, &[], ANSWER_SYSTEM).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => FALLBACK_ANSWER.to_string(),
            Err(e) => {
                warn!(owner, error = %e, "Answer generation failed, using fallback");
                FALLBACK_ANSWER.to_string()
            }
        };

        #[allow(clippy::cast_precision_loss)]
        let confidence = (recall.total_matches as f64 * 0.2).min(1.0);
        let supporting = SupportingMemories {
            entities: recall
                .entities
                .iter()
                .take(SUPPORTING_ITEMS)
                .map(|s| SupportingEntity {
                    name: s.item.name.clone(),
                    kind: s.item.kind,
                })
                .collect(),
            events: recall
                .events
                .iter()
                .take(SUPPORTING_ITEMS)
                .map(|s| s.item.description.clone())
                .collect(),
            relationships: recall
                .relationships
                .iter()
                .take(SUPPORTING_ITEMS)
                .map(|r| SupportingRelationship {
                    predicate: r.predicate.clone(),
                    strength: r.strength,
                })
                .collect(),
        };
        Ok(QueryAnswer {
            answer,
            confidence,
            supporting,
        })
    }

    /// Counters for one owner.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn stats(&self, owner: &str) -> Result<MemoryStats> {
        let counts = self.store.entity_counts(owner)?;
        Ok(MemoryStats {
            active_entities: counts.active,
            forgotten_entities: counts.forgotten,
            active_relationships: self.store.relationship_count(owner)?,
            total_events: self.store.event_count(owner)?,
            entity_types: counts.by_type,
            embedding_model: self.embedder.model_name().to_string(),
            embedding_dimensions: self.embedder.dimensions(),
        })
    }

    /// An active entity with its relationships and events.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn entity_detail(&self, owner: &str, id: EntityId) -> Result<Option<EntityDetail>> {
        let Some(entity) = self.entities.get_entity(owner, id)? else {
            return Ok(None);
        };
        let relationships = self.relationships.relationships_for_entity(owner, id, Direction::Both)?;
        let events = self.events.events_for_entity(owner, id)?;
        Ok(Some(EntityDetail {
            entity,
            relationships,
            events,
        }))
    }

    /// Active entities, most recently seen first.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn list_entities(
        &self,
        owner: &str,
        kind: Option<EntityType>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        self.entities.list_entities(owner, kind, offset, limit)
    }

    /// Semantic entity search.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn search_entities(&self, owner: &str, query: &str, top_k: usize) -> Result<Vec<Scored<Entity>>> {
        self.entities.search_entities(owner, query, top_k).await
    }

    /// Relationships of one entity (both directions), or all matching
    /// `predicate` when no entity is given.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn relationships_of(
        &self,
        owner: &str,
        entity: Option<EntityId>,
        predicate: Option<&str>,
    ) -> Result<Vec<Relationship>> {
        match entity {
            Some(id) => self.relationships.relationships_for_entity(owner, id, Direction::Both),
            None => self.relationships.query_relationships(owner, None, predicate, None),
        }
    }

    /// Nodes and edges for visualisation.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn graph(&self, owner: &str) -> Result<MemoryGraph> {
        self.relationships.graph(owner)
    }

    /// Most recent events first.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn timeline(&self, owner: &str, limit: usize) -> Result<Vec<Event>> {
        self.events.timeline(owner, limit)
    }

    /// Semantic event search, optionally within the last `since_days`.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn search_events(
        &self,
        owner: &str,
        query: &str,
        top_k: usize,
        since_days: Option<i64>,
    ) -> Result<Vec<Scored<Event>>> {
        self.events.search_events(owner, query, top_k, since_days).await
    }

    /// Stored snapshots, newest first.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn snapshots(&self, owner: &str, limit: usize) -> Result<Vec<MemorySnapshot>> {
        self.store.snapshots(owner, limit)
    }

    /// Summarize the last week of events into a snapshot.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn create_weekly_snapshot(&self, owner: &str) -> Result<Option<MemorySnapshot>> {
        self.summarizer.create_weekly_snapshot(owner).await
    }

    /// Every owner with stored memories.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn owners(&self) -> Result<Vec<String>> {
        self.store.owners()
    }

    // -- maintenance -------------------------------------------------------

    /// Tombstone one of the owner's entities.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn forget_entity(&self, owner: &str, id: EntityId) -> Result<bool> {
        self.entities.forget_entity(owner, id)
    }

    /// Tombstone one of the owner's relationships.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn forget_relationship(&self, owner: &str, id: RelationshipId) -> Result<bool> {
        self.relationships.forget_relationship(owner, id)
    }

    /// Boost an active entity of `owner`.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn reinforce_entity(&self, owner: &str, id: EntityId, boost: Option<f64>) -> Result<Option<Entity>> {
        if self.entities.get_entity(owner, id)?.is_none() {
            return Ok(None);
        }
        self.decay.reinforce_entity(id, boost)
    }

    /// Run one decay cycle over all owners now.
    ///
    /// # Errors
    ///
    /// Only if candidates cannot be read.
    pub fn run_decay_cycle(&self) -> Result<DecayStats> {
        self.decay.run_cycle()
    }

    /// Physically delete everything stored for `owner`.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn reset(&self, owner: &str) -> Result<ResetSummary> {
        let summary = self.store.reset_owner(owner)?;
        info!(
            owner,
            entities = summary.entities,
            relationships = summary.relationships,
            events = summary.events,
            snapshots = summary.snapshots,
            "Memory reset"
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Context rendering
// ---------------------------------------------------------------------------

fn days_ago_label(timestamp: DateTime<Utc>, at: DateTime<Utc>) -> String {
    match (at - timestamp).num_days() {
        d if d <= 0 => "today".to_string(),
        d => format!("{d} day(s) ago"),
    }
}

/// Render recall results as the memory context block.
///
/// Empty when there are neither entities nor events. Relationship
/// endpoints missing from `names` are shown by id.
#[must_use]
pub fn render_memory_context(
    entities: &[Scored<Entity>],
    relationships: &[Relationship],
    events: &[Scored<Event>],
    names: &HashMap<EntityId, String>,
    at: DateTime<Utc>,
) -> String {
    if entities.is_empty() && events.is_empty() {
        return String::new();
    }

    let mut out = String::from(CONTEXT_HEADER);
    if !entities.is_empty() {
        out.push_str("\nKnown entities:");
        for entity in entities.iter().take(CONTEXT_ENTITIES).map(|s| &s.item) {
            let _ = write!(out, "\n  - {} ({})", entity.name, entity.kind);
            if !entity.attributes.is_empty() {
                let attrs = entity
                    .attributes
                    .iter()
                    .take(CONTEXT_ATTRIBUTES)
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = write!(out, ": {attrs}");
            }
        }
    }
    if !relationships.is_empty() {
        out.push_str("\nKnown relationships:");
        let name = |id: &EntityId| names.get(id).cloned().unwrap_or_else(|| id.to_string());
        for rel in relationships.iter().take(CONTEXT_RELATIONSHIPS) {
            let _ = write!(
                out,
                "\n  - {} {} {} (confidence: {:.1})",
                name(&rel.subject_id),
                rel.predicate,
                name(&rel.object_id),
                rel.confidence
            );
        }
    }
    if !events.is_empty() {
        out.push_str("\nRelevant past events:");
        for event in events.iter().take(CONTEXT_EVENTS).map(|s| &s.item) {
            let _ = write!(out, "\n  - {} ({})", event.description, days_ago_label(event.timestamp, at));
        }
    }
    out.push('\n');
    out.push_str(CONTEXT_FOOTER);
    out
}
