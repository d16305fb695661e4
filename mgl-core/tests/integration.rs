//! Integration Tests: end-to-end memory flows.
//!
//! Each test wires a full [`MemoryEngine`] over SQLite with the
//! deterministic hashing embedder and a scripted text generator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use mgl_core::config::{MglConfig, PersistenceConfig};
use mgl_core::embedding::{Embedder, HashingEmbeddingProvider};
use mgl_core::engine::NO_MEMORIES_ANSWER;
use mgl_core::persistence::{MemoryStore, SqliteStore};
use mgl_core::types::{now, EntityType};
use mgl_core::MemoryEngine;
use mgl_llm::generator::ScriptedGenerator;

const EXTRACTION: &str = r#"{
  "entities": [
    {"name": "Sarah", "type": "person", "context": "coworker"},
    {"name": "Tom", "type": "person", "context": "manager"},
    {"name": "Lisbon", "type": "place", "context": ""}
  ],
  "relationships": [
    {"subject": "Sarah", "predicate": "works with", "object": "Tom", "confidence": 0.9},
    {"subject": "Sarah", "predicate": "visited", "object": "Lisbon"},
    {"subject": "Sarah", "predicate": "knows", "object": "Nobody"}
  ],
  "events": [
    {"description": "Sarah shipped billing", "participants": ["Sarah"]}
  ]
}"#;

fn hashing_embedder() -> Arc<Embedder> {
    Arc::new(Embedder::new(
        Arc::new(HashingEmbeddingProvider::default()),
        Duration::from_secs(5),
        128,
    ))
}

fn engine_over(store: Arc<SqliteStore>, embedder: Arc<Embedder>) -> (MemoryEngine, Arc<ScriptedGenerator>) {
    let generator = Arc::new(ScriptedGenerator::default());
    let engine = MemoryEngine::new(store, embedder, generator.clone(), MglConfig::default());
    (engine, generator)
}

fn memory_engine() -> (MemoryEngine, Arc<ScriptedGenerator>) {
    let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
    engine_over(store, hashing_embedder())
}

// ---------------------------------------------------------------------------
// Ingest → recall → persist → reopen
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ingest_recall_and_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = PersistenceConfig {
        path: dir.path().join("mgl.db"),
        ..PersistenceConfig::default()
    };

    {
        let store = Arc::new(SqliteStore::open(&config).expect("open"));
        let (engine, generator) = engine_over(store, hashing_embedder());
        generator.push_reply(EXTRACTION);

        let result = engine
            .ingest("alice", "session-1", "I met Sarah and Tom today; Sarah just got back from Lisbon.")
            .await
            .expect("ingest");
        assert_eq!(result.entities.len(), 3);
        assert_eq!(result.relationships.len(), 2, "unknown endpoint is skipped");
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.entities[2].kind, EntityType::Place);

        let predicates: Vec<&str> = result.relationships.iter().map(|r| r.predicate.as_str()).collect();
        assert_eq!(predicates, vec!["worked_with", "met"]);

        let recall = engine.recall("alice", "Sarah", 5).await.expect("recall");
        assert_eq!(recall.entities[0].item.name, "Sarah");
        assert_eq!(recall.relationships.len(), 2);
        assert!(recall.memory_context.contains("Sarah worked_with Tom (confidence: 0.9)"));
        assert!(recall.memory_context.contains("Sarah met Lisbon (confidence: 0.8)"));
    }

    let store = Arc::new(SqliteStore::open(&config).expect("reopen"));
    assert!(store.integrity_check().expect("integrity"));
    let (engine, _) = engine_over(store, hashing_embedder());
    let stats = engine.stats("alice").expect("stats");
    assert_eq!(stats.active_entities, 3);
    assert_eq!(stats.active_relationships, 2);
    assert_eq!(stats.total_events, 1);
    assert_eq!(engine.owners().expect("owners"), vec!["alice".to_string()]);
    assert_eq!(engine.timeline("alice", 10).expect("timeline").len(), 1);
}

// ---------------------------------------------------------------------------
// Resolution and reinforcement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_resolution_counts_mentions() {
    let (engine, _) = memory_engine();
    let (sarah, _) = engine
        .create_entity("alice", "Sarah", Some(EntityType::Person), BTreeMap::new())
        .await
        .expect("create");

    let mut last = sarah.mention_count;
    for reference in ["Sarah", "sarah", "SARAH"] {
        let resolved = engine
            .entities()
            .resolve_entity("alice", reference, "")
            .await
            .expect("resolve")
            .expect("match");
        assert_eq!(resolved.id, sarah.id);
        assert!(resolved.mention_count > last);
        assert!(resolved.last_seen >= sarah.last_seen);
        last = resolved.mention_count;
    }
    assert_eq!(last, 4);
}

#[tokio::test]
async fn loved_then_enjoyed_is_one_relationship() {
    let (engine, _) = memory_engine();
    let (sarah, _) = engine
        .create_entity("alice", "Sarah", Some(EntityType::Person), BTreeMap::new())
        .await
        .expect("sarah");
    let (jazz, _) = engine
        .create_entity("alice", "jazz", Some(EntityType::Concept), BTreeMap::new())
        .await
        .expect("jazz");

    let first = engine
        .create_relationship("alice", sarah.id, "loved", jazz.id, Some(0.95))
        .expect("loved");
    let second = engine
        .create_relationship("alice", sarah.id, "enjoyed", jazz.id, Some(0.5))
        .expect("enjoyed");

    assert_eq!(first.id, second.id);
    assert_eq!(second.predicate, "liked");
    assert!((second.strength - 1.0).abs() < f64::EPSILON);
    assert!((second.confidence - 1.0).abs() < f64::EPSILON);
    assert_eq!(engine.relationships_of("alice", None, Some("liked")).expect("query").len(), 1);
}

// ---------------------------------------------------------------------------
// Decay and forgetting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forgotten_entities_stay_forgotten() {
    let (engine, _) = memory_engine();
    let (topic, _) = engine
        .create_entity("alice", "quantum computing", Some(EntityType::Concept), BTreeMap::new())
        .await
        .expect("create");
    let (friend, _) = engine
        .create_entity("alice", "Sarah", Some(EntityType::Person), BTreeMap::new())
        .await
        .expect("create");

    let stats = engine
        .decay_service()
        .run_cycle_at(now() + ChronoDuration::days(400))
        .expect("decay");
    assert_eq!(stats.entities_forgotten, 2);

    assert!(engine.entities().get_entity("alice", topic.id).expect("get").is_none());
    assert!(engine.reinforce_entity("alice", friend.id, Some(1.0)).expect("reinforce").is_none());
    assert!(engine
        .entities()
        .resolve_entity("alice", "quantum computing", "")
        .await
        .expect("resolve")
        .is_none());

    let (recreated, created) = engine
        .create_entity("alice", "quantum computing", Some(EntityType::Concept), BTreeMap::new())
        .await
        .expect("create");
    assert!(created);
    assert_ne!(recreated.id, topic.id);

    let counts = engine.stats("alice").expect("stats");
    assert_eq!(counts.forgotten_entities, 2);
    assert_eq!(counts.active_entities, 1);
}

#[tokio::test]
async fn people_outlast_concepts() {
    let (engine, _) = memory_engine();
    engine
        .create_entity("alice", "Sarah", Some(EntityType::Person), BTreeMap::new())
        .await
        .expect("create");
    engine
        .create_entity("alice", "chess", Some(EntityType::Concept), BTreeMap::new())
        .await
        .expect("create");

    // Concept: 0.9545^45 ≈ 0.12, gone. Person: 0.98636^45 ≈ 0.54, kept.
    let stats = engine
        .decay_service()
        .run_cycle_at(now() + ChronoDuration::days(45))
        .expect("decay");
    assert_eq!(stats.entities_forgotten, 1);
    assert_eq!(stats.entities_decayed, 1);

    let remaining = engine.list_entities("alice", None, 0, 10).expect("list");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "Sarah");
    assert!(remaining[0].confidence > 0.5 && remaining[0].confidence < 0.6);
}

// ---------------------------------------------------------------------------
// Degraded capabilities and isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn works_without_embeddings() {
    let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
    let (engine, _) = engine_over(store, Arc::new(Embedder::unavailable(384)));

    let (sarah, _) = engine
        .create_entity("alice", "Sarah Connor", Some(EntityType::Person), BTreeMap::new())
        .await
        .expect("create");
    assert!(sarah.embedding.is_zero());

    let fallback = engine
        .entities()
        .resolve_entity("alice", "sarah", "")
        .await
        .expect("resolve")
        .expect("substring match");
    assert_eq!(fallback.id, sarah.id);
    assert_eq!(fallback.mention_count, 1, "substring fallback records nothing");

    let recall = engine.recall("alice", "Sarah", 5).await.expect("recall");
    assert_eq!(recall.total_matches, 0);
    let answer = engine.answer_query("alice", "Who is Sarah?").await.expect("answer");
    assert_eq!(answer.answer, NO_MEMORIES_ANSWER);
}

#[tokio::test]
async fn owners_are_isolated() {
    let (engine, generator) = memory_engine();
    generator.push_reply(EXTRACTION);
    engine
        .ingest("alice", "s1", "I met Sarah and Tom today; Sarah just got back from Lisbon.")
        .await
        .expect("ingest");

    let recall = engine.recall("bob", "Sarah", 5).await.expect("recall");
    assert_eq!(recall.total_matches, 0);
    assert_eq!(engine.stats("bob").expect("stats").active_entities, 0);

    let sarah = engine.list_entities("alice", Some(EntityType::Person), 0, 10).expect("list");
    assert_eq!(sarah.len(), 2);
    assert!(!engine.forget_entity("bob", sarah[0].id).expect("forget"));
    assert!(engine.forget_entity("alice", sarah[0].id).expect("forget"));
    assert!(!engine.forget_entity("alice", sarah[0].id).expect("forget twice"));

    let reset = engine.reset("bob").expect("reset");
    assert_eq!(reset.entities, 0);
    assert_eq!(engine.stats("alice").expect("stats").active_entities, 2);
}

#[tokio::test]
async fn weekly_snapshot_flow() {
    let (engine, generator) = memory_engine();
    assert!(engine.create_weekly_snapshot("alice").await.expect("snapshot").is_none());

    generator.push_reply(EXTRACTION);
    engine
        .ingest("alice", "s1", "I met Sarah and Tom today; Sarah just got back from Lisbon.")
        .await
        .expect("ingest");
    generator.push_reply("Sarah shipped billing this week.");
    let snapshot = engine
        .create_weekly_snapshot("alice")
        .await
        .expect("snapshot")
        .expect("created");
    assert_eq!(snapshot.entity_count, 3);
    assert_eq!(snapshot.events_summarized, 1);

    let stored = engine.snapshots("alice", 10).expect("snapshots");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].summary, "Sarah shipped billing this week.");
}
