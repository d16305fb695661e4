//! Entity store: create, resolve and forget named entities.
//!
//! Resolution first tries semantic similarity against the owner's active
//! entities; if nothing clears the threshold it falls back to
//! case-insensitive substring containment against names and aliases. Only
//! the semantic path records a mention.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use tracing::{debug, info};

use crate::config::EntityConfig;
use crate::embedding::{find_most_similar, Embedder, Scored};
use crate::error::Result;
use crate::persistence::MemoryStore;
use crate::types::{now, Entity, EntityId, EntityType};

/// Candidates compared during semantic resolution.
const RESOLVE_TOP_K: usize = 3;

const PERSON_KEYWORDS: &[&str] = &[
    "girl", "guy", "man", "woman", "person", "he", "she", "him", "her", "friend", "colleague",
    "boss", "doctor", "teacher", "someone",
];
const PLACE_KEYWORDS: &[&str] = &[
    "place", "city", "country", "restaurant", "office", "school", "hospital", "park", "street",
    "building", "location",
];
const ORGANIZATION_KEYWORDS: &[&str] = &[
    "company", "organization", "team", "department", "firm", "startup", "agency", "university",
    "institute",
];

/// Guess an entity type from the words of a reference.
///
/// Whole-word match, checked person → place → organization; anything else
/// is a concept.
#[must_use]
pub fn infer_entity_type(text: &str) -> EntityType {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let hits = |keywords: &[&str]| words.iter().any(|w| keywords.contains(w));

    if hits(PERSON_KEYWORDS) {
        EntityType::Person
    } else if hits(PLACE_KEYWORDS) {
        EntityType::Place
    } else if hits(ORGANIZATION_KEYWORDS) {
        EntityType::Organization
    } else {
        EntityType::Concept
    }
}

/// Pick the best substring match among `candidates`.
///
/// A candidate matches when the lowercased reference contains one of its
/// names/aliases or vice versa. Ties are broken by: exact equality, then
/// the longest matching name, then higher confidence, then most recent
/// `last_seen`, then the smallest id.
fn substring_match<'a>(reference: &str, candidates: &'a [Entity]) -> Option<&'a Entity> {
    let reference = reference.to_lowercase();
    candidates
        .iter()
        .filter_map(|candidate| {
            let best = candidate
                .names()
                .map(str::to_lowercase)
                .filter(|name| !name.is_empty())
                .filter(|name| reference.contains(name.as_str()) || name.contains(reference.as_str()))
                .map(|name| (name == reference, name.chars().count()))
                .max()?;
            Some((candidate, best))
        })
        .max_by_key(|(candidate, (exact, len))| {
            (
                *exact,
                *len,
                OrderedFloat(candidate.confidence),
                candidate.last_seen,
                Reverse(candidate.id),
            )
        })
        .map(|(candidate, _)| candidate)
}

fn join_text(head: &str, tail: &str) -> String {
    format!("{head} {tail}").trim().to_string()
}

/// Create / resolve / forget entities for an owner.
pub struct EntityStore {
    store: Arc<dyn MemoryStore>,
    embedder: Arc<Embedder>,
    config: EntityConfig,
}

impl EntityStore {
    /// Build the store over a persistence engine and embedder.
    #[must_use]
    pub fn new(store: Arc<dyn MemoryStore>, embedder: Arc<Embedder>, config: EntityConfig) -> Self {
        Self { store, embedder, config }
    }

    /// Create and persist a new entity with full confidence.
    ///
    /// The embedding covers the name plus `source_text`.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn create_entity(
        &self,
        owner: &str,
        name: &str,
        kind: EntityType,
        attributes: BTreeMap<String, String>,
        source_text: &str,
    ) -> Result<Entity> {
        let name = name.trim();
        let embedding = self.embedder.embed(&join_text(name, source_text)).await;
        let t = now();
        let entity = Entity {
            id: EntityId::new(),
            owner: owner.to_string(),
            name: name.to_string(),
            kind,
            aliases: Default::default(),
            embedding,
            attributes,
            confidence: 1.0,
            mention_count: 1,
            first_seen: t,
            last_seen: t,
            decay_rate: self.config.default_decay_rate,
            is_forgotten: false,
        };
        self.store.insert_entity(&entity)?;
        info!(entity_id = %entity.id, owner, name, kind = %kind, "Entity created");
        Ok(entity)
    }

    /// Resolve a reference with the configured similarity threshold.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn resolve_entity(&self, owner: &str, reference: &str, context: &str) -> Result<Option<Entity>> {
        self.resolve_entity_with_threshold(owner, reference, context, self.config.similarity_threshold)
            .await
    }

    /// Resolve `reference` (with surrounding `context`) to a known entity.
    ///
    /// A semantic match at or above `threshold` records a mention (count,
    /// `last_seen`, alias) and returns the refreshed record. Otherwise the
    /// substring fallback runs without touching the store. A blank
    /// reference never matches.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn resolve_entity_with_threshold(
        &self,
        owner: &str,
        reference: &str,
        context: &str,
        threshold: f64,
    ) -> Result<Option<Entity>> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Ok(None);
        }

        let query = self.embedder.embed(&join_text(reference, context)).await;
        let candidates = self
            .store
            .list_active_entities(owner, None, 0, self.config.candidate_limit)?;
        if candidates.is_empty() {
            return Ok(None);
        }

        if let Some(best) = find_most_similar(&query, &candidates, RESOLVE_TOP_K, threshold).first() {
            let alias = reference.to_lowercase();
            if let Some(refreshed) = self.store.record_mention(best.item.id, &alias, now())? {
                debug!(
                    entity_id = %refreshed.id,
                    similarity = best.similarity,
                    mentions = refreshed.mention_count,
                    "Resolved by similarity"
                );
                return Ok(Some(refreshed));
            }
        }

        let fallback = substring_match(reference, &candidates).cloned();
        if let Some(entity) = &fallback {
            debug!(entity_id = %entity.id, reference, "Resolved by substring");
        }
        Ok(fallback)
    }

    /// Resolve, or create when nothing matches. Returns `(entity, created)`.
    ///
    /// Without an explicit `kind`, the type is inferred from the reference.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn get_or_create_entity(
        &self,
        owner: &str,
        reference: &str,
        context: &str,
        kind: Option<EntityType>,
    ) -> Result<(Entity, bool)> {
        if let Some(existing) = self.resolve_entity(owner, reference, context).await? {
            return Ok((existing, false));
        }
        let kind = kind.unwrap_or_else(|| infer_entity_type(reference));
        let created = self
            .create_entity(owner, reference, kind, BTreeMap::new(), context)
            .await?;
        Ok((created, true))
    }

    /// Tombstone an entity. Idempotent; returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn forget_entity(&self, owner: &str, id: EntityId) -> Result<bool> {
        let changed = self.store.forget_entity(owner, id)?;
        if changed {
            info!(entity_id = %id, owner, "Entity forgotten");
        }
        Ok(changed)
    }

    /// Set confidence, clamped to \[0, 1\].
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn update_confidence(&self, id: EntityId, value: f64) -> Result<bool> {
        self.store.set_entity_confidence(id, value.clamp(0.0, 1.0))
    }

    /// An active entity owned by `owner`.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn get_entity(&self, owner: &str, id: EntityId) -> Result<Option<Entity>> {
        Ok(self
            .store
            .get_entity(id)?
            .filter(|e| e.owner == owner && !e.is_forgotten))
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
        self.store.list_active_entities(owner, kind, offset, limit)
    }

    /// Semantic search over active entities.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn search_entities(&self, owner: &str, query: &str, top_k: usize) -> Result<Vec<Scored<Entity>>> {
        let query = self.embedder.embed(query).await;
        let candidates = self
            .store
            .list_active_entities(owner, None, 0, self.config.search_limit)?;
        Ok(find_most_similar(&query, candidates, top_k, self.config.search_threshold))
    }
}
