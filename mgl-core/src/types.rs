//! Core record types for the memory graph.
//!
//! Four collections, each keyed by a generated UUID plus an owner string:
//! entities, relationships, events and snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity Types
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a remembered entity.
    EntityId
);
uuid_id!(
    /// Unique identifier for a relationship edge.
    RelationshipId
);
uuid_id!(
    /// Unique identifier for an episodic event.
    EventId
);
uuid_id!(
    /// Unique identifier for a periodic memory snapshot.
    SnapshotId
);

/// Current time truncated to microseconds, the precision stored on disk.
///
/// Timestamps read back from the store compare equal to the ones written.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// The instant `days` days before `at`, used as a lower time bound.
///
/// `None` means "no lower bound": a non-positive window, or one reaching
/// past the representable range.
#[must_use]
pub fn days_before(at: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    if days <= 0 {
        return None;
    }
    TimeDelta::try_days(days).and_then(|d| at.checked_sub_signed(d))
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

/// A dense vector embedding (384 dimensions with `all-MiniLM-L6-v2`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    /// An all-zero vector, the fallback when no embedding can be computed.
    #[must_use]
    pub fn zeros(dimensions: usize) -> Self {
        Self(vec![0.0; dimensions])
    }

    /// Number of dimensions.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    /// `true` when the vector has no components at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `true` when every component is zero (including the empty vector).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|x| *x == 0.0)
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Category of a remembered entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A human being.
    Person,
    /// A physical or named location.
    Place,
    /// A company, team, institution.
    Organization,
    /// Anything else: topics, objects, ideas.
    Concept,
}

impl EntityType {
    /// All variants in declaration order.
    pub const ALL: [Self; 4] = [Self::Person, Self::Place, Self::Organization, Self::Concept];

    /// Lowercase label used in storage and prompts.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Place => "place",
            Self::Organization => "organization",
            Self::Concept => "concept",
        }
    }

    /// Parse a label case-insensitively; `None` for anything unknown.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "person" => Some(Self::Person),
            "place" => Some(Self::Place),
            "organization" | "organisation" => Some(Self::Organization),
            "concept" => Some(Self::Concept),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remembered person, place, organization or concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier.
    pub id: EntityId,
    /// Owning user.
    pub owner: String,
    /// Display name as first mentioned.
    pub name: String,
    /// Category.
    pub kind: EntityType,
    /// Lowercased alternative references; grows only.
    pub aliases: BTreeSet<String>,
    /// Embedding over name plus source context.
    pub embedding: Embedding,
    /// Open-ended key/value facts.
    pub attributes: BTreeMap<String, String>,
    /// Belief score in \[0, 1\].
    pub confidence: f64,
    /// Times this entity has been mentioned; never decremented.
    pub mention_count: u32,
    /// When the entity was created.
    pub first_seen: DateTime<Utc>,
    /// Most recent mention or reinforcement.
    pub last_seen: DateTime<Utc>,
    /// Base per-day decay rate.
    pub decay_rate: f64,
    /// Terminal tombstone flag.
    pub is_forgotten: bool,
}

impl Entity {
    /// Every string this entity answers to: its name followed by its aliases.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

// ---------------------------------------------------------------------------
// Relationships
// ---------------------------------------------------------------------------

/// A directed, predicate-labelled edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Unique identifier.
    pub id: RelationshipId,
    /// Owning user.
    pub owner: String,
    /// Source entity.
    pub subject_id: EntityId,
    /// Canonical predicate (see [`crate::relationship::canonical_predicate`]).
    pub predicate: String,
    /// Target entity.
    pub object_id: EntityId,
    /// Accumulated evidence in \[0, 1\].
    pub strength: f64,
    /// Decaying belief in \[0, 1\].
    pub confidence: f64,
    /// Session ids that mentioned this relationship.
    pub evidence: BTreeSet<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last reinforcement or decay.
    pub updated_at: DateTime<Utc>,
    /// Terminal tombstone flag.
    pub is_forgotten: bool,
}

/// Which end of a relationship an entity must occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// The entity is the subject.
    Subject,
    /// The entity is the object.
    Object,
    /// Either end.
    #[default]
    Both,
}

// ---------------------------------------------------------------------------
// Events & snapshots
// ---------------------------------------------------------------------------

/// An episodic record of something that happened in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier.
    pub id: EventId,
    /// Owning user.
    pub owner: String,
    /// Conversation session the event came from.
    pub session_id: String,
    /// What happened.
    pub description: String,
    /// Embedding of `description`.
    pub embedding: Embedding,
    /// Entities that took part.
    pub participants: Vec<EntityId>,
    /// Entities discussed in the same transcript.
    pub entities_mentioned: Vec<EntityId>,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Always 1.0 at creation; events do not decay.
    pub confidence: f64,
    /// Truncated transcript, provenance only.
    pub source_transcript: String,
}

/// A compact periodic rollup of recent events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Unique identifier.
    pub id: SnapshotId,
    /// Owning user.
    pub owner: String,
    /// When the snapshot was taken.
    pub snapshot_date: DateTime<Utc>,
    /// Short natural-language summary.
    pub summary: String,
    /// Active entities at snapshot time.
    pub entity_count: u64,
    /// Active relationships at snapshot time.
    pub relationship_count: u64,
    /// Number of events fed into the summary.
    pub events_summarized: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_labels_round_trip() {
        for kind in EntityType::ALL {
            assert_eq!(EntityType::from_label(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityType::from_label(" Person "), Some(EntityType::Person));
        assert_eq!(EntityType::from_label("animal"), None);
    }

    #[test]
    fn entity_type_serializes_lowercase() {
        let json = serde_json::to_string(&EntityType::Organization).expect("serialize");
        assert_eq!(json, "\"organization\"");
    }

    #[test]
    fn ids_parse_from_display() {
        let id = EntityId::new();
        let parsed: EntityId = id.to_string().parse().expect("parse");
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<EventId>().is_err());
    }

    #[test]
    fn zero_embedding_detection() {
        assert!(Embedding::zeros(4).is_zero());
        assert!(Embedding::default().is_zero());
        assert!(!Embedding(vec![0.0, 0.1]).is_zero());
    }
}
