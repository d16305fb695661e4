//! Transcript → memory: extraction through the text generator, then writes
//! through the entity, relationship and event stores.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use mgl_llm::generator::TextGenerator;
use mgl_llm::prompt::{
    extract_json_block, render_template, truncate_chars, EXTRACTION_SYSTEM, EXTRACTION_USER, SUMMARY_SYSTEM,
    SUMMARY_USER,
};

use crate::config::{ExtractionConfig, SnapshotConfig};
use crate::entity::{infer_entity_type, EntityStore};
use crate::error::Result;
use crate::event::EventStore;
use crate::persistence::MemoryStore;
use crate::relationship::{RelationshipStore, DEFAULT_PREDICATE};
use crate::types::{days_before, now, Entity, EntityId, EntityType, Event, MemorySnapshot, Relationship, SnapshotId};

// ---------------------------------------------------------------------------
// Extraction types
// ---------------------------------------------------------------------------

/// An entity candidate named in a transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedEntity {
    /// Surface name.
    pub name: String,
    /// Declared type, or the keyword guess when the model gave none we know.
    pub kind: EntityType,
    /// Short free-text context.
    pub context: String,
}

/// A relationship candidate between two named entities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedRelationship {
    /// Subject name.
    pub subject: String,
    /// Raw predicate, canonicalized on write.
    pub predicate: String,
    /// Object name.
    pub object: String,
    /// Model confidence in \[0, 1\].
    pub confidence: f64,
}

/// An event candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedEvent {
    /// What happened.
    pub description: String,
    /// Names of the entities involved.
    pub participants: Vec<String>,
}

/// Everything pulled out of one transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Extraction {
    /// Entity candidates.
    pub entities: Vec<ExtractedEntity>,
    /// Relationship candidates.
    pub relationships: Vec<ExtractedRelationship>,
    /// Event candidates.
    pub events: Vec<ExtractedEvent>,
}

impl Extraction {
    /// No candidates of any kind.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty() && self.events.is_empty()
    }
}

// Wire shapes. Items are decoded one by one so a single malformed entry
// does not discard the rest.

#[derive(Deserialize)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<Value>,
    #[serde(default)]
    relationships: Vec<Value>,
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Deserialize)]
struct RawEntity {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Deserialize)]
struct RawRelationship {
    #[serde(default)]
    subject: String,
    #[serde(default)]
    predicate: Option<String>,
    #[serde(default)]
    object: String,
    #[serde(default)]
    confidence: Option<Value>,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(default)]
    description: String,
    #[serde(default)]
    participants: Vec<Value>,
}

fn decode_items<T: for<'de> Deserialize<'de>>(items: Vec<Value>) -> impl Iterator<Item = T> {
    items.into_iter().filter_map(|v| serde_json::from_value(v).ok())
}

fn confidence_value(raw: Option<&Value>, default: f64) -> f64 {
    raw.and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .filter(|c: &f64| c.is_finite())
        .unwrap_or(default)
        .clamp(0.0, 1.0)
}

/// Parse model output into an [`Extraction`].
///
/// Only the outermost `{…}` block is considered. Output without such a
/// block, or that is not valid JSON, yields an empty extraction. Entries
/// with a blank name, endpoint or description are dropped; unknown entity
/// types fall back to [`infer_entity_type`]; relationship confidence
/// defaults to `default_confidence` and is clamped to \[0, 1\].
#[must_use]
pub fn parse_extraction(raw: &str, default_confidence: f64) -> Extraction {
    let Some(block) = extract_json_block(raw) else {
        warn!(len = raw.len(), "Extraction output has no JSON object");
        return Extraction::default();
    };
    let parsed: RawExtraction = match serde_json::from_str(block) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Extraction output is not valid JSON");
            return Extraction::default();
        }
    };

    let entities = decode_items::<RawEntity>(parsed.entities)
        .filter_map(|e| {
            let name = e.name.trim();
            if name.is_empty() {
                return None;
            }
            let kind = e
                .kind
                .as_deref()
                .and_then(EntityType::from_label)
                .unwrap_or_else(|| infer_entity_type(name));
            Some(ExtractedEntity {
                name: name.to_string(),
                kind,
                context: e.context.unwrap_or_default().trim().to_string(),
            })
        })
        .collect();

    let relationships = decode_items::<RawRelationship>(parsed.relationships)
        .filter_map(|r| {
            let (subject, object) = (r.subject.trim(), r.object.trim());
            if subject.is_empty() || object.is_empty() {
                return None;
            }
            let predicate = r
                .predicate
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .unwrap_or(DEFAULT_PREDICATE);
            Some(ExtractedRelationship {
                subject: subject.to_string(),
                predicate: predicate.to_string(),
                object: object.to_string(),
                confidence: confidence_value(r.confidence.as_ref(), default_confidence),
            })
        })
        .collect();

    let events = decode_items::<RawEvent>(parsed.events)
        .filter_map(|e| {
            let description = e.description.trim();
            if description.is_empty() {
                return None;
            }
            let participants = e
                .participants
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            Some(ExtractedEvent {
                description: description.to_string(),
                participants,
            })
        })
        .collect();

    Extraction {
        entities,
        relationships,
        events,
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Turns a transcript into memory candidates. Never fails: anything that
/// goes wrong is logged and produces an empty extraction.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract candidates from `transcript`.
    async fn extract(&self, transcript: &str) -> Extraction;
}

/// [`Extractor`] that asks a [`TextGenerator`] for structured JSON.
pub struct LlmExtractor {
    generator: Arc<dyn TextGenerator>,
    config: ExtractionConfig,
}

impl LlmExtractor {
    /// Extractor over `generator`.
    #[must_use]
    pub fn new(generator: Arc<dyn TextGenerator>, config: ExtractionConfig) -> Self {
        Self { generator, config }
    }
}

impl fmt::Debug for LlmExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmExtractor")
            .field("model", &self.generator.model_name())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(&self, transcript: &str) -> Extraction {
        let transcript = truncate_chars(transcript, self.config.max_prompt_chars);
        let prompt = render_template(EXTRACTION_USER, &[("transcript", transcript)]);
        match self.generator.generate(&prompt, &[], EXTRACTION_SYSTEM).await {
            Ok(raw) => parse_extraction(&raw, self.config.default_relationship_confidence),
            Err(e) => {
                warn!(error = %e, model = self.generator.model_name(), "Extraction generation failed");
                Extraction::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Summarizer
// ---------------------------------------------------------------------------

/// Records written by one [`MemorySummarizer::ingest`] call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestResult {
    /// Entities created or resolved, in extraction order.
    pub entities: Vec<Entity>,
    /// Relationships created or reinforced.
    pub relationships: Vec<Relationship>,
    /// Events recorded.
    pub events: Vec<Event>,
}

impl IngestResult {
    /// Nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty() && self.events.is_empty()
    }
}

/// Writes extracted knowledge through the stores and rolls events up into
/// periodic snapshots.
pub struct MemorySummarizer {
    extractor: Arc<dyn Extractor>,
    generator: Arc<dyn TextGenerator>,
    store: Arc<dyn MemoryStore>,
    entities: Arc<EntityStore>,
    relationships: Arc<RelationshipStore>,
    events: Arc<EventStore>,
    extraction: ExtractionConfig,
    snapshot: SnapshotConfig,
}

impl MemorySummarizer {
    /// Wire the summarizer to its collaborators.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        extractor: Arc<dyn Extractor>,
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn MemoryStore>,
        entities: Arc<EntityStore>,
        relationships: Arc<RelationshipStore>,
        events: Arc<EventStore>,
        extraction: ExtractionConfig,
        snapshot: SnapshotConfig,
    ) -> Self {
        Self {
            extractor,
            generator,
            store,
            entities,
            relationships,
            events,
            extraction,
            snapshot,
        }
    }

    /// Extract knowledge from one session transcript and persist it.
    ///
    /// Transcripts shorter than the configured minimum (after trimming)
    /// are ignored without calling the extractor. Entities are written
    /// first; relationships and events then refer to them by name,
    /// case-insensitively. A relationship whose endpoints cannot be found
    /// is skipped.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures. Records written before the failure
    /// stay written.
    pub async fn ingest(&self, owner: &str, session_id: &str, transcript: &str) -> Result<IngestResult> {
        if transcript.trim().chars().count() < self.extraction.min_transcript_chars {
            debug!(owner, session = session_id, "Transcript too short, nothing to extract");
            return Ok(IngestResult::default());
        }

        let extraction = self.extractor.extract(transcript).await;
        let mut result = IngestResult::default();
        let mut by_name: HashMap<String, Entity> = HashMap::new();

        for candidate in &extraction.entities {
            let key = candidate.name.to_lowercase();
            if by_name.contains_key(&key) {
                continue;
            }
            let (entity, created) = self
                .entities
                .get_or_create_entity(owner, &candidate.name, &candidate.context, Some(candidate.kind))
                .await?;
            debug!(entity_id = %entity.id, name = %candidate.name, created, "Extracted entity stored");
            by_name.insert(key, entity.clone());
            result.entities.push(entity);
        }

        for candidate in &extraction.relationships {
            let Some(subject) = self.endpoint(owner, &by_name, &candidate.subject).await? else {
                debug!(name = %candidate.subject, "Relationship subject unknown, skipping");
                continue;
            };
            let Some(object) = self.endpoint(owner, &by_name, &candidate.object).await? else {
                debug!(name = %candidate.object, "Relationship object unknown, skipping");
                continue;
            };
            let relationship = self.relationships.create_relationship(
                owner,
                subject,
                &candidate.predicate,
                object,
                candidate.confidence,
                Some(session_id),
            )?;
            result.relationships.push(relationship);
        }

        let mut mentioned: Vec<EntityId> = Vec::with_capacity(result.entities.len());
        for entity in &result.entities {
            if !mentioned.contains(&entity.id) {
                mentioned.push(entity.id);
            }
        }
        for candidate in &extraction.events {
            let participants = candidate
                .participants
                .iter()
                .filter_map(|name| by_name.get(&name.to_lowercase()).map(|e| e.id))
                .collect();
            let event = self
                .events
                .record_event(owner, session_id, &candidate.description, participants, mentioned.clone(), transcript)
                .await?;
            result.events.push(event);
        }

        info!(
            owner,
            session = session_id,
            entities = result.entities.len(),
            relationships = result.relationships.len(),
            events = result.events.len(),
            "Transcript ingested"
        );
        Ok(result)
    }

    async fn endpoint(&self, owner: &str, by_name: &HashMap<String, Entity>, name: &str) -> Result<Option<EntityId>> {
        if let Some(entity) = by_name.get(&name.to_lowercase()) {
            return Ok(Some(entity.id));
        }
        Ok(self.entities.resolve_entity(owner, name, "").await?.map(|e| e.id))
    }

    /// Summarize the owner's recent events into a persisted snapshot.
    ///
    /// Returns `None` when there were no events in the window. When the
    /// generator fails a plain listing-based summary is stored instead.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn create_weekly_snapshot(&self, owner: &str) -> Result<Option<MemorySnapshot>> {
        let since = days_before(now(), self.snapshot.window_days);
        let events = self.store.events_since(owner, since, self.snapshot.max_events)?;
        if events.is_empty() {
            debug!(owner, "No recent events, snapshot skipped");
            return Ok(None);
        }

        let listing = events
            .iter()
            .take(self.snapshot.prompt_events)
            .map(|e| format!("- {}", e.description))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = render_template(SUMMARY_USER, &[("events", &listing)]);
        let summary = match self.generator.generate(&prompt, &[], SUMMARY_SYSTEM).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback_summary(&events, self.snapshot.window_days),
            Err(e) => {
                warn!(owner, error = %e, "Snapshot summary generation failed, using fallback");
                fallback_summary(&events, self.snapshot.window_days)
            }
        };

        let snapshot = MemorySnapshot {
            id: SnapshotId::new(),
            owner: owner.to_string(),
            snapshot_date: now(),
            summary,
            entity_count: self.store.entity_counts(owner)?.active,
            relationship_count: self.store.relationship_count(owner)?,
            events_summarized: events.len() as u64,
        };
        self.store.insert_snapshot(&snapshot)?;
        info!(
            owner,
            snapshot_id = %snapshot.id,
            events = snapshot.events_summarized,
            "Memory snapshot created"
        );
        Ok(Some(snapshot))
    }
}

/// Deterministic summary used when no generator is available.
fn fallback_summary(events: &[Event], window_days: i64) -> String {
    let latest = events.last().map_or("", |e| e.description.as_str());
    let plural = if events.len() == 1 { "" } else { "s" };
    format!(
        "{} event{plural} recorded in the last {window_days} days. Most recent: {latest}",
        events.len()
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mgl_llm::generator::ScriptedGenerator;

    use super::*;
    use crate::config::{EntityConfig, EventConfig, RelationshipConfig};
    use crate::embedding::{Embedder, HashingEmbeddingProvider};
    use crate::persistence::SqliteStore;

    const SARAH_TOM: &str = r#"Here is the extraction:
```json
{
  "entities": [
    {"name": "Sarah", "type": "person", "context": "coworker on the billing project"},
    {"name": "Tom", "type": "person", "context": "manager in Berlin"}
  ],
  "relationships": [
    {"subject": "Sarah", "predicate": "works with", "object": "Tom", "confidence": 0.9}
  ],
  "events": [
    {"description": "Sarah and Tom shipped the billing release", "participants": ["Sarah", "tom", "Nobody"]}
  ]
}
```"#;

    struct Fixture {
        store: Arc<SqliteStore>,
        generator: Arc<ScriptedGenerator>,
        summarizer: MemorySummarizer,
    }

    fn fixture() -> Fixture {
        fixture_with(SnapshotConfig::default())
    }

    fn fixture_with(snapshot: SnapshotConfig) -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
        let generator = Arc::new(ScriptedGenerator::default());
        let embedder = Arc::new(Embedder::new(
            Arc::new(HashingEmbeddingProvider::default()),
            Duration::from_secs(5),
            0,
        ));
        let entities = Arc::new(EntityStore::new(store.clone(), embedder.clone(), EntityConfig::default()));
        let relationships = Arc::new(RelationshipStore::new(store.clone(), RelationshipConfig::default()));
        let events = Arc::new(EventStore::new(store.clone(), embedder, EventConfig::default()));
        let extractor = Arc::new(LlmExtractor::new(generator.clone(), ExtractionConfig::default()));
        let summarizer = MemorySummarizer::new(
            extractor,
            generator.clone(),
            store.clone(),
            entities,
            relationships,
            events,
            ExtractionConfig::default(),
            snapshot,
        );
        Fixture {
            store,
            generator,
            summarizer,
        }
    }

    #[test]
    fn parse_drops_blank_items_and_defaults_fields() {
        let raw = r#"{
            "entities": [{"name": "  "}, {"name": "Acme startup", "type": "company"}, {"name": 7}],
            "relationships": [{"subject": "A", "object": "B"}, {"subject": "", "object": "B"},
                              {"subject": "A", "predicate": "knows", "object": "B", "confidence": 3.5}],
            "events": [{"description": ""}, {"description": "Lunch", "participants": ["A", 4, " "]}]
        }"#;
        let parsed = parse_extraction(raw, 0.8);

        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities[0].kind, EntityType::Organization);
        assert_eq!(parsed.relationships.len(), 2);
        assert_eq!(parsed.relationships[0].predicate, DEFAULT_PREDICATE);
        assert!((parsed.relationships[0].confidence - 0.8).abs() < f64::EPSILON);
        assert!((parsed.relationships[1].confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(parsed.events.len(), 1);
        assert_eq!(parsed.events[0].participants, vec!["A".to_string()]);
    }

    #[test]
    fn parse_garbage_is_empty() {
        assert!(parse_extraction("I could not find anything.", 0.8).is_empty());
        assert!(parse_extraction("{ not json }", 0.8).is_empty());
        assert!(parse_extraction("{\"entities\": \"nope\"}", 0.8).is_empty());
    }

    #[tokio::test]
    async fn short_transcript_skips_generator() {
        let f = fixture();
        let result = f.summarizer.ingest("u1", "s1", "   hi there ").await.expect("ingest");
        assert!(result.is_empty());
        assert_eq!(f.generator.call_count(), 0);
    }

    #[tokio::test]
    async fn sarah_works_with_tom() {
        let f = fixture();
        f.generator.push_reply(SARAH_TOM);

        let result = f
            .summarizer
            .ingest("u1", "session-1", "Sarah works with Tom. Tom handles billing.")
            .await
            .expect("ingest");

        assert_eq!(f.generator.call_count(), 1);
        assert!(f.generator.calls()[0].prompt.contains("Transcript: \"Sarah works with Tom. Tom handles billing.\""));
        assert_eq!(result.entities.len(), 2);
        assert!(result.entities.iter().all(|e| e.kind == EntityType::Person));

        assert_eq!(result.relationships.len(), 1);
        let rel = &result.relationships[0];
        assert_eq!(rel.predicate, "worked_with");
        assert_eq!(rel.subject_id, result.entities[0].id);
        assert_eq!(rel.object_id, result.entities[1].id);
        assert!(rel.evidence.contains("session-1"));

        assert_eq!(result.events.len(), 1);
        let event = &result.events[0];
        assert_eq!(event.participants, vec![result.entities[0].id, result.entities[1].id]);
        assert_eq!(event.entities_mentioned.len(), 2);
        assert_eq!(event.session_id, "session-1");

        let counts = f.store.entity_counts("u1").expect("counts");
        assert_eq!(counts.active, 2);
    }

    #[tokio::test]
    async fn generator_failure_writes_nothing() {
        let f = fixture();
        f.generator.push_failure("model offline");
        let result = f
            .summarizer
            .ingest("u1", "s1", "A long enough transcript about nothing.")
            .await
            .expect("ingest");
        assert!(result.is_empty());
        assert_eq!(f.store.entity_counts("u1").expect("counts").active, 0);
    }

    #[tokio::test]
    async fn snapshot_uses_summary_or_fallback() {
        let f = fixture();
        assert!(f.summarizer.create_weekly_snapshot("u1").await.expect("snapshot").is_none());

        f.generator.push_reply(SARAH_TOM);
        f.summarizer
            .ingest("u1", "s1", "Today Sarah and I met Tom to wrap up the billing release.")
            .await
            .expect("ingest");

        f.generator.push_reply("  Sarah and Tom shipped billing.  ");
        let snap = f
            .summarizer
            .create_weekly_snapshot("u1")
            .await
            .expect("snapshot")
            .expect("some");
        assert_eq!(snap.summary, "Sarah and Tom shipped billing.");
        assert_eq!(snap.entity_count, 2);
        assert_eq!(snap.relationship_count, 1);
        assert_eq!(snap.events_summarized, 1);
        assert!(f.generator.calls()[1].prompt.contains("- Sarah and Tom shipped the billing release"));

        // Script exhausted: the generator now fails.
        let fallback = f
            .summarizer
            .create_weekly_snapshot("u1")
            .await
            .expect("snapshot")
            .expect("some");
        assert!(fallback.summary.starts_with("1 event recorded in the last 7 days"));
        assert_eq!(f.store.snapshots("u1", 10).expect("snapshots").len(), 2);
    }

    #[tokio::test]
    async fn oversized_snapshot_window_covers_all_events() {
        let f = fixture_with(SnapshotConfig {
            window_days: i64::MAX,
            ..SnapshotConfig::default()
        });
        f.generator.push_reply(SARAH_TOM);
        f.summarizer
            .ingest("u1", "s1", "Today Sarah and I met Tom to wrap up the billing release.")
            .await
            .expect("ingest");

        let snap = f
            .summarizer
            .create_weekly_snapshot("u1")
            .await
            .expect("snapshot")
            .expect("some");
        assert_eq!(snap.events_summarized, 1);
    }
}
