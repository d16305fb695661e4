//! Persistence contract and the SQLite engine behind it.
//!
//! The memory graph lives in four logical collections keyed by a generated
//! UUID plus an owner string:
//!
//! ```sql
//! entities       (id PK, owner, name, kind, embedding BLOB, attributes JSON,
//!                 confidence, mention_count, first_seen, last_seen,
//!                 decay_rate, is_forgotten)
//! relationships  (id PK, owner, subject_id, predicate, object_id, strength,
//!                 confidence, created_at, updated_at, is_forgotten)
//! events         (id PK, owner, session_id, description, embedding BLOB,
//!                 participants JSON, entities_mentioned JSON, timestamp,
//!                 confidence, source_transcript)
//! snapshots      (id PK, owner, snapshot_date, summary, entity_count,
//!                 relationship_count, events_summarized)
//! ```
//!
//! Set-valued fields (entity aliases, relationship evidence, event entity
//! links) live in side tables so they can grow with `INSERT OR IGNORE`
//! instead of read-modify-write. Timestamps are fixed-width RFC 3339 strings
//! with microsecond precision, so lexical order is chronological order.
//!
//! Design rationale:
//! - WAL mode so request reads proceed while the decay cycle writes.
//! - Every mutation is a single atomic statement (`mention_count + 1`,
//!   `MAX(last_seen, ?)`, `MIN(1.0, confidence + ?)`).
//! - A partial unique index keeps at most one active relationship per
//!   (owner, subject, predicate, object).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row, ToSql};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::PersistenceConfig;
use crate::error::Result;
use crate::types::{
    Direction, Embedding, Entity, EntityId, EntityType, Event, EventId, MemorySnapshot,
    Relationship, RelationshipId, SnapshotId,
};

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Aggregate entity counts for one owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityCounts {
    /// Entities not forgotten.
    pub active: u64,
    /// Tombstoned entities.
    pub forgotten: u64,
    /// Active entities per type.
    pub by_type: BTreeMap<EntityType, u64>,
}

/// Rows physically removed by [`MemoryStore::reset_owner`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    /// Entities removed.
    pub entities: u64,
    /// Relationships removed.
    pub relationships: u64,
    /// Events removed.
    pub events: u64,
    /// Snapshots removed.
    pub snapshots: u64,
}

/// Outcome a decay cycle wants to write for one record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecayWrite {
    /// Persist the reduced confidence.
    Decay(f64),
    /// Tombstone with confidence 0.
    Forget,
}

/// Typed access to the four memory collections.
///
/// Every method is a short synchronous operation; implementations must be
/// safe to share between the request path and the decay scheduler.
/// "Active" means not forgotten.
pub trait MemoryStore: Send + Sync {
    // -- entities ----------------------------------------------------------

    /// Insert a new entity (aliases included).
    ///
    /// # Errors
    /// Persistence failure.
    fn insert_entity(&self, entity: &Entity) -> Result<()>;

    /// Fetch an entity by id, forgotten or not.
    ///
    /// # Errors
    /// Persistence failure.
    fn get_entity(&self, id: EntityId) -> Result<Option<Entity>>;

    /// Active entities of `owner`, most recently seen first.
    ///
    /// # Errors
    /// Persistence failure.
    fn list_active_entities(
        &self,
        owner: &str,
        kind: Option<EntityType>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Entity>>;

    /// Record a mention of an active entity: `mention_count + 1`,
    /// `last_seen = MAX(last_seen, seen_at)`, alias added. Returns the
    /// refreshed record, or `None` if the entity is gone or forgotten.
    ///
    /// # Errors
    /// Persistence failure.
    fn record_mention(&self, id: EntityId, alias: &str, seen_at: DateTime<Utc>) -> Result<Option<Entity>>;

    /// `confidence = MIN(1, confidence + boost)`, `mention_count + 1`,
    /// `last_seen` refreshed; active entities only.
    ///
    /// # Errors
    /// Persistence failure.
    fn reinforce_entity(&self, id: EntityId, boost: f64, seen_at: DateTime<Utc>) -> Result<Option<Entity>>;

    /// Overwrite an active entity's confidence. Returns whether a row matched.
    ///
    /// # Errors
    /// Persistence failure.
    fn set_entity_confidence(&self, id: EntityId, confidence: f64) -> Result<bool>;

    /// Tombstone an active entity. Returns whether anything changed.
    ///
    /// # Errors
    /// Persistence failure.
    fn forget_entity(&self, owner: &str, id: EntityId) -> Result<bool>;

    /// Apply a decay write if the entity is still active and its
    /// `last_seen` still equals `expected_last_seen`.
    ///
    /// # Errors
    /// Persistence failure.
    fn decay_entity(&self, id: EntityId, expected_last_seen: DateTime<Utc>, write: DecayWrite) -> Result<bool>;

    /// Active entities across all owners, least recently seen first.
    ///
    /// # Errors
    /// Persistence failure.
    fn decay_entity_candidates(&self, limit: usize) -> Result<Vec<Entity>>;

    /// Active / forgotten / per-type counts.
    ///
    /// # Errors
    /// Persistence failure.
    fn entity_counts(&self, owner: &str) -> Result<EntityCounts>;

    // -- relationships -----------------------------------------------------

    /// Insert a new relationship. Returns `false` when an active
    /// relationship with the same triple already exists.
    ///
    /// # Errors
    /// Persistence failure.
    fn insert_relationship(&self, relationship: &Relationship) -> Result<bool>;

    /// Fetch a relationship by id, forgotten or not.
    ///
    /// # Errors
    /// Persistence failure.
    fn get_relationship(&self, id: RelationshipId) -> Result<Option<Relationship>>;

    /// The active relationship for an exact (owner, subject, predicate,
    /// object) triple.
    ///
    /// # Errors
    /// Persistence failure.
    fn find_active_relationship(
        &self,
        owner: &str,
        subject: EntityId,
        predicate: &str,
        object: EntityId,
    ) -> Result<Option<Relationship>>;

    /// Atomically raise confidence and strength (each capped at 1), add
    /// `evidence` and refresh `updated_at`; active relationships only.
    ///
    /// # Errors
    /// Persistence failure.
    fn reinforce_relationship(
        &self,
        id: RelationshipId,
        confidence_boost: f64,
        strength_boost: f64,
        evidence: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Relationship>>;

    /// Active relationships matching every given filter, strongest first.
    ///
    /// # Errors
    /// Persistence failure.
    fn query_relationships(
        &self,
        owner: &str,
        subject: Option<EntityId>,
        predicate: Option<&str>,
        object: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<Relationship>>;

    /// Active relationships touching `entity` at the given end, strongest
    /// first.
    ///
    /// # Errors
    /// Persistence failure.
    fn relationships_for_entity(
        &self,
        owner: &str,
        entity: EntityId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Relationship>>;

    /// Tombstone an active relationship. Returns whether anything changed.
    ///
    /// # Errors
    /// Persistence failure.
    fn forget_relationship(&self, owner: &str, id: RelationshipId) -> Result<bool>;

    /// Apply a decay write if the relationship is still active and its
    /// `updated_at` still equals `expected_updated_at`.
    ///
    /// # Errors
    /// Persistence failure.
    fn decay_relationship(
        &self,
        id: RelationshipId,
        expected_updated_at: DateTime<Utc>,
        write: DecayWrite,
    ) -> Result<bool>;

    /// Active relationships across all owners, least recently updated first.
    ///
    /// # Errors
    /// Persistence failure.
    fn decay_relationship_candidates(&self, limit: usize) -> Result<Vec<Relationship>>;

    /// Number of active relationships.
    ///
    /// # Errors
    /// Persistence failure.
    fn relationship_count(&self, owner: &str) -> Result<u64>;

    // -- events ------------------------------------------------------------

    /// Append an event.
    ///
    /// # Errors
    /// Persistence failure.
    fn insert_event(&self, event: &Event) -> Result<()>;

    /// Events of `owner` (optionally not older than `since`), newest first.
    ///
    /// # Errors
    /// Persistence failure.
    fn recent_events(&self, owner: &str, since: Option<DateTime<Utc>>, limit: usize) -> Result<Vec<Event>>;

    /// Events of `owner` not older than `since` (all when `None`), oldest first.
    ///
    /// # Errors
    /// Persistence failure.
    fn events_since(&self, owner: &str, since: Option<DateTime<Utc>>, limit: usize) -> Result<Vec<Event>>;

    /// Events of one session, oldest first.
    ///
    /// # Errors
    /// Persistence failure.
    fn events_for_session(&self, session_id: &str, limit: usize) -> Result<Vec<Event>>;

    /// Events where `entity` participated or was mentioned, newest first.
    ///
    /// # Errors
    /// Persistence failure.
    fn events_for_entity(&self, owner: &str, entity: EntityId, limit: usize) -> Result<Vec<Event>>;

    /// Total events of `owner`.
    ///
    /// # Errors
    /// Persistence failure.
    fn event_count(&self, owner: &str) -> Result<u64>;

    // -- snapshots & housekeeping -----------------------------------------

    /// Persist a snapshot.
    ///
    /// # Errors
    /// Persistence failure.
    fn insert_snapshot(&self, snapshot: &MemorySnapshot) -> Result<()>;

    /// Snapshots of `owner`, newest first.
    ///
    /// # Errors
    /// Persistence failure.
    fn snapshots(&self, owner: &str, limit: usize) -> Result<Vec<MemorySnapshot>>;

    /// Every owner with at least one entity or event.
    ///
    /// # Errors
    /// Persistence failure.
    fn owners(&self) -> Result<Vec<String>>;

    /// Physically remove everything stored for `owner`.
    ///
    /// # Errors
    /// Persistence failure.
    fn reset_owner(&self, owner: &str) -> Result<ResetSummary>;
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

macro_rules! uuid_column {
    ($($name:ty),*) => {$(
        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0.to_string()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    )*};
}

uuid_column!(EntityId, RelationshipId, EventId, SnapshotId);

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion(idx: usize, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion(idx, e))
}

fn embedding_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Embedding> {
    let raw: Vec<u8> = row.get(idx)?;
    bincode::deserialize(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, e))
}

fn count_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let n: i64 = row.get(idx)?;
    u64::try_from(n).map_err(|e| conversion(idx, e))
}

fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn sql_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn changed(rows: usize) -> u64 {
    u64::try_from(rows).unwrap_or(u64::MAX)
}

const ENTITY_SELECT: &str = "SELECT e.id, e.owner, e.name, e.kind, e.embedding, e.attributes,
        e.confidence, e.mention_count, e.first_seen, e.last_seen, e.decay_rate, e.is_forgotten,
        (SELECT json_group_array(a.alias) FROM entity_aliases a WHERE a.entity_id = e.id)
     FROM entities e";

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let kind: String = row.get(3)?;
    Ok(Entity {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        kind: EntityType::from_label(&kind).ok_or_else(|| conversion(3, format!("unknown entity type '{kind}'")))?,
        embedding: embedding_column(row, 4)?,
        attributes: json_column(row, 5)?,
        confidence: row.get(6)?,
        mention_count: row.get(7)?,
        first_seen: time_column(row, 8)?,
        last_seen: time_column(row, 9)?,
        decay_rate: row.get(10)?,
        is_forgotten: row.get(11)?,
        aliases: json_column(row, 12)?,
    })
}

const RELATIONSHIP_SELECT: &str = "SELECT r.id, r.owner, r.subject_id, r.predicate, r.object_id,
        r.strength, r.confidence, r.created_at, r.updated_at, r.is_forgotten,
        (SELECT json_group_array(v.session_id) FROM relationship_evidence v WHERE v.relationship_id = r.id)
     FROM relationships r";

fn relationship_from_row(row: &Row<'_>) -> rusqlite::Result<Relationship> {
    Ok(Relationship {
        id: row.get(0)?,
        owner: row.get(1)?,
        subject_id: row.get(2)?,
        predicate: row.get(3)?,
        object_id: row.get(4)?,
        strength: row.get(5)?,
        confidence: row.get(6)?,
        created_at: time_column(row, 7)?,
        updated_at: time_column(row, 8)?,
        is_forgotten: row.get(9)?,
        evidence: json_column(row, 10)?,
    })
}

const EVENT_SELECT: &str = "SELECT ev.id, ev.owner, ev.session_id, ev.description, ev.embedding,
        ev.participants, ev.entities_mentioned, ev.timestamp, ev.confidence, ev.source_transcript
     FROM events ev";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        owner: row.get(1)?,
        session_id: row.get(2)?,
        description: row.get(3)?,
        embedding: embedding_column(row, 4)?,
        participants: json_column(row, 5)?,
        entities_mentioned: json_column(row, 6)?,
        timestamp: time_column(row, 7)?,
        confidence: row.get(8)?,
        source_transcript: row.get(9)?,
    })
}

const SNAPSHOT_SELECT: &str = "SELECT id, owner, snapshot_date, summary, entity_count,
        relationship_count, events_summarized
     FROM snapshots";

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<MemorySnapshot> {
    Ok(MemorySnapshot {
        id: row.get(0)?,
        owner: row.get(1)?,
        snapshot_date: time_column(row, 2)?,
        summary: row.get(3)?,
        entity_count: count_column(row, 4)?,
        relationship_count: count_column(row, 5)?,
        events_summarized: count_column(row, 6)?,
    })
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS entities (
        id            TEXT PRIMARY KEY,
        owner         TEXT NOT NULL,
        name          TEXT NOT NULL,
        kind          TEXT NOT NULL,
        embedding     BLOB NOT NULL,
        attributes    TEXT NOT NULL,
        confidence    REAL NOT NULL,
        mention_count INTEGER NOT NULL,
        first_seen    TEXT NOT NULL,
        last_seen     TEXT NOT NULL,
        decay_rate    REAL NOT NULL,
        is_forgotten  INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_entities_owner ON entities(owner);
    CREATE INDEX IF NOT EXISTS idx_entities_owner_active ON entities(owner, is_forgotten, last_seen);

    CREATE TABLE IF NOT EXISTS entity_aliases (
        entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        alias     TEXT NOT NULL,
        PRIMARY KEY (entity_id, alias)
    );

    CREATE TABLE IF NOT EXISTS relationships (
        id           TEXT PRIMARY KEY,
        owner        TEXT NOT NULL,
        subject_id   TEXT NOT NULL,
        predicate    TEXT NOT NULL,
        object_id    TEXT NOT NULL,
        strength     REAL NOT NULL,
        confidence   REAL NOT NULL,
        created_at   TEXT NOT NULL,
        updated_at   TEXT NOT NULL,
        is_forgotten INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_relationships_owner_active ON relationships(owner, is_forgotten, strength);
    CREATE INDEX IF NOT EXISTS idx_relationships_subject ON relationships(subject_id);
    CREATE INDEX IF NOT EXISTS idx_relationships_object ON relationships(object_id);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_relationships_active_triple
        ON relationships(owner, subject_id, predicate, object_id) WHERE is_forgotten = 0;

    CREATE TABLE IF NOT EXISTS relationship_evidence (
        relationship_id TEXT NOT NULL REFERENCES relationships(id) ON DELETE CASCADE,
        session_id      TEXT NOT NULL,
        PRIMARY KEY (relationship_id, session_id)
    );

    CREATE TABLE IF NOT EXISTS events (
        id                 TEXT PRIMARY KEY,
        owner              TEXT NOT NULL,
        session_id         TEXT NOT NULL,
        description        TEXT NOT NULL,
        embedding          BLOB NOT NULL,
        participants       TEXT NOT NULL,
        entities_mentioned TEXT NOT NULL,
        timestamp          TEXT NOT NULL,
        confidence         REAL NOT NULL,
        source_transcript  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_owner_time ON events(owner, timestamp);
    CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, timestamp);

    CREATE TABLE IF NOT EXISTS event_entities (
        event_id  TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        entity_id TEXT NOT NULL,
        PRIMARY KEY (event_id, entity_id)
    );
    CREATE INDEX IF NOT EXISTS idx_event_entities_entity ON event_entities(entity_id);

    CREATE TABLE IF NOT EXISTS snapshots (
        id                 TEXT PRIMARY KEY,
        owner              TEXT NOT NULL,
        snapshot_date      TEXT NOT NULL,
        summary            TEXT NOT NULL,
        entity_count       INTEGER NOT NULL,
        relationship_count INTEGER NOT NULL,
        events_summarized  INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_snapshots_owner_date ON snapshots(owner, snapshot_date);
";

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// [`MemoryStore`] backed by a single SQLite database.
///
/// # Usage
///
/// ```no_run
/// # use mgl_core::persistence::{MemoryStore, SqliteStore};
/// # use mgl_core::config::PersistenceConfig;
/// let store = SqliteStore::open(&PersistenceConfig::default())?;
/// let owners = store.owners()?;
/// # Ok::<(), mgl_core::error::MglError>(())
/// ```
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `config.path`.
    ///
    /// The schema is created if missing. WAL mode is enabled when
    /// `config.wal_mode` is `true`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::MglError::Database`] on SQLite failures.
    pub fn open(config: &PersistenceConfig) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&config.path, flags)?;

        if config.wal_mode {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!(mode = %mode, "Journal mode set");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;

        let store = Self::init(conn, config.path.clone())?;
        info!(
            path = %config.path.display(),
            wal = config.wal_mode,
            "MGL store opened"
        );
        Ok(store)
    }

    /// Open an in-memory database (useful for tests).
    ///
    /// # Errors
    ///
    /// Returns [`crate::MglError::Database`] on SQLite failures.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, db_path: PathBuf) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// Path of the database file (`:memory:` for in-memory stores).
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `PRAGMA integrity_check` and return whether it passed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::MglError::Database`] on SQLite failures.
    pub fn integrity_check(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(result == "ok")
    }

    fn query_entities(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Entity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, entity_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_relationships_sql(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Relationship>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, relationship_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_events(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Event>> {
        let start = Instant::now();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, event_from_row)?;
        let events = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        debug!(
            rows = events.len(),
            elapsed_us = start.elapsed().as_micros(),
            "Loaded events"
        );
        Ok(events)
    }

    fn count(&self, sql: &str, owner: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(sql, params![owner], |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

impl MemoryStore for SqliteStore {
    fn insert_entity(&self, entity: &Entity) -> Result<()> {
        let embedding = bincode::serialize(&entity.embedding)?;
        let attributes = serde_json::to_string(&entity.attributes)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO entities (id, owner, name, kind, embedding, attributes, confidence,
                                   mention_count, first_seen, last_seen, decay_rate, is_forgotten)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entity.id,
                entity.owner,
                entity.name,
                entity.kind.as_str(),
                embedding,
                attributes,
                entity.confidence,
                entity.mention_count,
                ts(&entity.first_seen),
                ts(&entity.last_seen),
                entity.decay_rate,
                entity.is_forgotten,
            ],
        )?;
        for alias in &entity.aliases {
            tx.execute(
                "INSERT OR IGNORE INTO entity_aliases (entity_id, alias) VALUES (?1, ?2)",
                params![entity.id, alias],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_entity(&self, id: EntityId) -> Result<Option<Entity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!("{ENTITY_SELECT} WHERE e.id = ?1"))?;
        Ok(stmt.query_row(params![id], entity_from_row).optional()?)
    }

    fn list_active_entities(
        &self,
        owner: &str,
        kind: Option<EntityType>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        self.query_entities(
            &format!(
                "{ENTITY_SELECT}
                 WHERE e.owner = ?1 AND e.is_forgotten = 0 AND (?2 IS NULL OR e.kind = ?2)
                 ORDER BY e.last_seen DESC, e.id
                 LIMIT ?3 OFFSET ?4"
            ),
            &[&owner, &kind.map(EntityType::as_str), &sql_limit(limit), &sql_limit(offset)],
        )
    }

    fn record_mention(&self, id: EntityId, alias: &str, seen_at: DateTime<Utc>) -> Result<Option<Entity>> {
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE entities
                 SET mention_count = mention_count + 1, last_seen = MAX(last_seen, ?2)
                 WHERE id = ?1 AND is_forgotten = 0",
                params![id, ts(&seen_at)],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            if !alias.is_empty() {
                tx.execute(
                    "INSERT OR IGNORE INTO entity_aliases (entity_id, alias) VALUES (?1, ?2)",
                    params![id, alias],
                )?;
            }
            tx.commit()?;
        }
        self.get_entity(id)
    }

    fn reinforce_entity(&self, id: EntityId, boost: f64, seen_at: DateTime<Utc>) -> Result<Option<Entity>> {
        let updated = self.conn.lock().execute(
            "UPDATE entities
             SET confidence = MIN(1.0, MAX(0.0, confidence + ?2)),
                 mention_count = mention_count + 1,
                 last_seen = MAX(last_seen, ?3)
             WHERE id = ?1 AND is_forgotten = 0",
            params![id, boost, ts(&seen_at)],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_entity(id)
    }

    fn set_entity_confidence(&self, id: EntityId, confidence: f64) -> Result<bool> {
        let updated = self.conn.lock().execute(
            "UPDATE entities SET confidence = ?2 WHERE id = ?1 AND is_forgotten = 0",
            params![id, confidence.clamp(0.0, 1.0)],
        )?;
        Ok(updated > 0)
    }

    fn forget_entity(&self, owner: &str, id: EntityId) -> Result<bool> {
        let updated = self.conn.lock().execute(
            "UPDATE entities SET is_forgotten = 1, confidence = 0.0
             WHERE id = ?1 AND owner = ?2 AND is_forgotten = 0",
            params![id, owner],
        )?;
        Ok(updated > 0)
    }

    fn decay_entity(&self, id: EntityId, expected_last_seen: DateTime<Utc>, write: DecayWrite) -> Result<bool> {
        let (confidence, forget) = match write {
            DecayWrite::Decay(c) => (c.clamp(0.0, 1.0), false),
            DecayWrite::Forget => (0.0, true),
        };
        let updated = self.conn.lock().execute(
            "UPDATE entities SET confidence = ?2, is_forgotten = ?3
             WHERE id = ?1 AND is_forgotten = 0 AND last_seen = ?4",
            params![id, confidence, forget, ts(&expected_last_seen)],
        )?;
        Ok(updated > 0)
    }

    fn decay_entity_candidates(&self, limit: usize) -> Result<Vec<Entity>> {
        self.query_entities(
            &format!("{ENTITY_SELECT} WHERE e.is_forgotten = 0 ORDER BY e.last_seen, e.id LIMIT ?1"),
            &[&sql_limit(limit)],
        )
    }

    fn entity_counts(&self, owner: &str) -> Result<EntityCounts> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT kind, is_forgotten, COUNT(*) FROM entities WHERE owner = ?1 GROUP BY kind, is_forgotten",
        )?;
        let rows = stmt.query_map(params![owner], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?, count_column(row, 2)?))
        })?;

        let mut counts = EntityCounts::default();
        for row in rows {
            let (kind, forgotten, n) = row?;
            if forgotten {
                counts.forgotten += n;
                continue;
            }
            counts.active += n;
            if let Some(kind) = EntityType::from_label(&kind) {
                *counts.by_type.entry(kind).or_default() += n;
            }
        }
        Ok(counts)
    }

    fn insert_relationship(&self, relationship: &Relationship) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO relationships (id, owner, subject_id, predicate, object_id, strength,
                                        confidence, created_at, updated_at, is_forgotten)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                relationship.id,
                relationship.owner,
                relationship.subject_id,
                relationship.predicate,
                relationship.object_id,
                relationship.strength,
                relationship.confidence,
                ts(&relationship.created_at),
                ts(&relationship.updated_at),
                relationship.is_forgotten,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                debug!(
                    subject = %relationship.subject_id,
                    predicate = %relationship.predicate,
                    object = %relationship.object_id,
                    "Active relationship already exists"
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        for session in &relationship.evidence {
            tx.execute(
                "INSERT OR IGNORE INTO relationship_evidence (relationship_id, session_id) VALUES (?1, ?2)",
                params![relationship.id, session],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn get_relationship(&self, id: RelationshipId) -> Result<Option<Relationship>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!("{RELATIONSHIP_SELECT} WHERE r.id = ?1"))?;
        Ok(stmt.query_row(params![id], relationship_from_row).optional()?)
    }

    fn find_active_relationship(
        &self,
        owner: &str,
        subject: EntityId,
        predicate: &str,
        object: EntityId,
    ) -> Result<Option<Relationship>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{RELATIONSHIP_SELECT}
             WHERE r.owner = ?1 AND r.subject_id = ?2 AND r.predicate = ?3 AND r.object_id = ?4
               AND r.is_forgotten = 0"
        ))?;
        Ok(stmt
            .query_row(params![owner, subject, predicate, object], relationship_from_row)
            .optional()?)
    }

    fn reinforce_relationship(
        &self,
        id: RelationshipId,
        confidence_boost: f64,
        strength_boost: f64,
        evidence: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Relationship>> {
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE relationships
                 SET confidence = MIN(1.0, confidence + ?2),
                     strength = MIN(1.0, strength + ?3),
                     updated_at = MAX(updated_at, ?4)
                 WHERE id = ?1 AND is_forgotten = 0",
                params![id, confidence_boost, strength_boost, ts(&at)],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            if let Some(session) = evidence {
                tx.execute(
                    "INSERT OR IGNORE INTO relationship_evidence (relationship_id, session_id) VALUES (?1, ?2)",
                    params![id, session],
                )?;
            }
            tx.commit()?;
        }
        self.get_relationship(id)
    }

    fn query_relationships(
        &self,
        owner: &str,
        subject: Option<EntityId>,
        predicate: Option<&str>,
        object: Option<EntityId>,
        limit: usize,
    ) -> Result<Vec<Relationship>> {
        self.query_relationships_sql(
            &format!(
                "{RELATIONSHIP_SELECT}
                 WHERE r.owner = ?1 AND r.is_forgotten = 0
                   AND (?2 IS NULL OR r.subject_id = ?2)
                   AND (?3 IS NULL OR r.predicate = ?3)
                   AND (?4 IS NULL OR r.object_id = ?4)
                 ORDER BY r.strength DESC, r.created_at, r.id
                 LIMIT ?5"
            ),
            &[&owner, &subject, &predicate, &object, &sql_limit(limit)],
        )
    }

    fn relationships_for_entity(
        &self,
        owner: &str,
        entity: EntityId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Relationship>> {
        let end = match direction {
            Direction::Subject => "r.subject_id = ?2",
            Direction::Object => "r.object_id = ?2",
            Direction::Both => "(r.subject_id = ?2 OR r.object_id = ?2)",
        };
        self.query_relationships_sql(
            &format!(
                "{RELATIONSHIP_SELECT}
                 WHERE r.owner = ?1 AND r.is_forgotten = 0 AND {end}
                 ORDER BY r.strength DESC, r.created_at, r.id
                 LIMIT ?3"
            ),
            &[&owner, &entity, &sql_limit(limit)],
        )
    }

    fn forget_relationship(&self, owner: &str, id: RelationshipId) -> Result<bool> {
        let updated = self.conn.lock().execute(
            "UPDATE relationships SET is_forgotten = 1, confidence = 0.0
             WHERE id = ?1 AND owner = ?2 AND is_forgotten = 0",
            params![id, owner],
        )?;
        Ok(updated > 0)
    }

    fn decay_relationship(
        &self,
        id: RelationshipId,
        expected_updated_at: DateTime<Utc>,
        write: DecayWrite,
    ) -> Result<bool> {
        let (confidence, forget) = match write {
            DecayWrite::Decay(c) => (c.clamp(0.0, 1.0), false),
            DecayWrite::Forget => (0.0, true),
        };
        let updated = self.conn.lock().execute(
            "UPDATE relationships SET confidence = ?2, is_forgotten = ?3
             WHERE id = ?1 AND is_forgotten = 0 AND updated_at = ?4",
            params![id, confidence, forget, ts(&expected_updated_at)],
        )?;
        Ok(updated > 0)
    }

    fn decay_relationship_candidates(&self, limit: usize) -> Result<Vec<Relationship>> {
        self.query_relationships_sql(
            &format!("{RELATIONSHIP_SELECT} WHERE r.is_forgotten = 0 ORDER BY r.updated_at, r.id LIMIT ?1"),
            &[&sql_limit(limit)],
        )
    }

    fn relationship_count(&self, owner: &str) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM relationships WHERE owner = ?1 AND is_forgotten = 0",
            owner,
        )
    }

    fn insert_event(&self, event: &Event) -> Result<()> {
        let embedding = bincode::serialize(&event.embedding)?;
        let participants = serde_json::to_string(&event.participants)?;
        let mentioned = serde_json::to_string(&event.entities_mentioned)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO events (id, owner, session_id, description, embedding, participants,
                                 entities_mentioned, timestamp, confidence, source_transcript)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.id,
                event.owner,
                event.session_id,
                event.description,
                embedding,
                participants,
                mentioned,
                ts(&event.timestamp),
                event.confidence,
                event.source_transcript,
            ],
        )?;
        for entity in event.participants.iter().chain(&event.entities_mentioned) {
            tx.execute(
                "INSERT OR IGNORE INTO event_entities (event_id, entity_id) VALUES (?1, ?2)",
                params![event.id, entity],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn recent_events(&self, owner: &str, since: Option<DateTime<Utc>>, limit: usize) -> Result<Vec<Event>> {
        self.query_events(
            &format!(
                "{EVENT_SELECT}
                 WHERE ev.owner = ?1 AND (?2 IS NULL OR ev.timestamp >= ?2)
                 ORDER BY ev.timestamp DESC, ev.rowid DESC
                 LIMIT ?3"
            ),
            &[&owner, &since.as_ref().map(ts), &sql_limit(limit)],
        )
    }

    fn events_since(&self, owner: &str, since: Option<DateTime<Utc>>, limit: usize) -> Result<Vec<Event>> {
        self.query_events(
            &format!(
                "{EVENT_SELECT}
                 WHERE ev.owner = ?1 AND (?2 IS NULL OR ev.timestamp >= ?2)
                 ORDER BY ev.timestamp, ev.rowid
                 LIMIT ?3"
            ),
            &[&owner, &since.as_ref().map(ts), &sql_limit(limit)],
        )
    }

    fn events_for_session(&self, session_id: &str, limit: usize) -> Result<Vec<Event>> {
        self.query_events(
            &format!(
                "{EVENT_SELECT}
                 WHERE ev.session_id = ?1
                 ORDER BY ev.timestamp, ev.rowid
                 LIMIT ?2"
            ),
            &[&session_id, &sql_limit(limit)],
        )
    }

    fn events_for_entity(&self, owner: &str, entity: EntityId, limit: usize) -> Result<Vec<Event>> {
        self.query_events(
            &format!(
                "{EVENT_SELECT}
                 WHERE ev.owner = ?1
                   AND ev.id IN (SELECT event_id FROM event_entities WHERE entity_id = ?2)
                 ORDER BY ev.timestamp DESC, ev.rowid DESC
                 LIMIT ?3"
            ),
            &[&owner, &entity, &sql_limit(limit)],
        )
    }

    fn event_count(&self, owner: &str) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM events WHERE owner = ?1", owner)
    }

    fn insert_snapshot(&self, snapshot: &MemorySnapshot) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO snapshots (id, owner, snapshot_date, summary, entity_count,
                                    relationship_count, events_summarized)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.id,
                snapshot.owner,
                ts(&snapshot.snapshot_date),
                snapshot.summary,
                sql_count(snapshot.entity_count),
                sql_count(snapshot.relationship_count),
                sql_count(snapshot.events_summarized),
            ],
        )?;
        Ok(())
    }

    fn snapshots(&self, owner: &str, limit: usize) -> Result<Vec<MemorySnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{SNAPSHOT_SELECT} WHERE owner = ?1 ORDER BY snapshot_date DESC, rowid DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![owner, sql_limit(limit)], snapshot_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn owners(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT owner FROM entities UNION SELECT owner FROM events ORDER BY owner",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    fn reset_owner(&self, owner: &str) -> Result<ResetSummary> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let summary = ResetSummary {
            relationships: changed(tx.execute("DELETE FROM relationships WHERE owner = ?1", params![owner])?),
            events: changed(tx.execute("DELETE FROM events WHERE owner = ?1", params![owner])?),
            entities: changed(tx.execute("DELETE FROM entities WHERE owner = ?1", params![owner])?),
            snapshots: changed(tx.execute("DELETE FROM snapshots WHERE owner = ?1", params![owner])?),
        };
        tx.commit()?;
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
