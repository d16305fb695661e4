//! Event store: append-only episodic records.

use std::sync::Arc;

use tracing::debug;

use crate::config::EventConfig;
use crate::embedding::{find_most_similar, Embedder, Scored};
use crate::error::Result;
use crate::persistence::MemoryStore;
use crate::types::{days_before, now, EntityId, Event, EventId};

/// Events returned per session / per entity lookup.
const LOOKUP_LIMIT: usize = 100;

/// Records and queries episodic events.
pub struct EventStore {
    store: Arc<dyn MemoryStore>,
    embedder: Arc<Embedder>,
    config: EventConfig,
}

impl EventStore {
    /// Build the store over a persistence engine and embedder.
    #[must_use]
    pub fn new(store: Arc<dyn MemoryStore>, embedder: Arc<Embedder>, config: EventConfig) -> Self {
        Self { store, embedder, config }
    }

    /// Append an event. The description is embedded and the transcript is
    /// cut to the configured length for provenance.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn record_event(
        &self,
        owner: &str,
        session_id: &str,
        description: &str,
        participants: Vec<EntityId>,
        entities_mentioned: Vec<EntityId>,
        source_transcript: &str,
    ) -> Result<Event> {
        let embedding = self.embedder.embed(description).await;
        let event = Event {
            id: EventId::new(),
            owner: owner.to_string(),
            session_id: session_id.to_string(),
            description: description.to_string(),
            embedding,
            participants,
            entities_mentioned,
            timestamp: now(),
            confidence: 1.0,
            source_transcript: mgl_llm::prompt::truncate_chars(source_transcript, self.config.transcript_limit_chars)
                .to_string(),
        };
        self.store.insert_event(&event)?;
        debug!(event_id = %event.id, owner, session = session_id, "Event recorded");
        Ok(event)
    }

    /// Semantic search over the owner's most recent events, optionally
    /// restricted to the last `since_days` days. A zero, negative or
    /// out-of-range window searches everything.
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
        let query = self.embedder.embed(query).await;
        let since = since_days.and_then(|days| days_before(now(), days));
        let candidates = self.store.recent_events(owner, since, self.config.search_limit)?;
        Ok(find_most_similar(&query, candidates, top_k, self.config.search_threshold))
    }

    /// Events of one session, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn events_for_session(&self, session_id: &str) -> Result<Vec<Event>> {
        self.store.events_for_session(session_id, LOOKUP_LIMIT)
    }

    /// Events where the entity took part or was mentioned, newest first.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn events_for_entity(&self, owner: &str, entity: EntityId) -> Result<Vec<Event>> {
        self.store.events_for_entity(owner, entity, LOOKUP_LIMIT)
    }

    /// Most recent events first.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn timeline(&self, owner: &str, limit: usize) -> Result<Vec<Event>> {
        self.store.recent_events(owner, None, limit)
    }

    /// Events from the last `days` days, oldest first. A non-positive or
    /// out-of-range window returns the oldest events overall.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn events_since(&self, owner: &str, days: i64, limit: usize) -> Result<Vec<Event>> {
        self.store.events_since(owner, days_before(now(), days), limit)
    }

    /// Total events of `owner`.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn count(&self, owner: &str) -> Result<u64> {
        self.store.event_count(owner)
    }
}
