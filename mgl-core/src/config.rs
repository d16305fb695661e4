//! Configuration for the MGL memory system.
//!
//! Maps directly to `mgl.toml`. Every field has a serde default, so an empty
//! file (or no file at all) yields a working configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MglError, Result};
use crate::types::EntityType;

/// Top-level MGL configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MglConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Embedding provider settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Entity resolution and search.
    #[serde(default)]
    pub entities: EntityConfig,
    /// Relationship reinforcement.
    #[serde(default)]
    pub relationships: RelationshipConfig,
    /// Event search and provenance.
    #[serde(default)]
    pub events: EventConfig,
    /// Confidence decay and forgetting.
    #[serde(default)]
    pub decay: DecayConfig,
    /// Transcript extraction.
    #[serde(default)]
    pub extraction: ExtractionConfig,
    /// Recall and question answering.
    #[serde(default)]
    pub recall: RecallConfig,
    /// Weekly snapshot job.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// LLM integration settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Persistence / database settings.
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl MglConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `MglError::Config` if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| MglError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Apply `MGL_*` environment overrides on top of the loaded values.
    #[must_use]
    pub fn apply_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    #[must_use]
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("MGL_DB_PATH") {
            self.persistence.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MGL_LOG_LEVEL") {
            self.general.log_level = v;
        }
        if let Some(v) = lookup("MGL_LLM_PROVIDER") {
            self.llm.provider = v;
        }
        if let Some(v) = lookup("MGL_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = lookup("MGL_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = lookup("MGL_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = lookup("MGL_EMBEDDING_PROVIDER") {
            self.embedding.provider = v;
        }
        self
    }

    /// Reject values that would break the memory model.
    ///
    /// # Errors
    /// Returns `MglError::Config` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let unit = [
            ("entities.similarity_threshold", self.entities.similarity_threshold),
            ("entities.search_threshold", self.entities.search_threshold),
            ("entities.default_decay_rate", self.entities.default_decay_rate),
            ("events.search_threshold", self.events.search_threshold),
            ("decay.min_confidence", self.decay.min_confidence),
            ("decay.protection_factor", self.decay.protection_factor),
            ("relationships.default_confidence", self.relationships.default_confidence),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(MglError::Config(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.embedding.dimensions == 0 {
            return Err(MglError::Config("embedding.dimensions must be positive".to_string()));
        }
        if self.decay.interval_hours == 0 || self.snapshot.interval_hours == 0 {
            return Err(MglError::Config("scheduler intervals must be positive".to_string()));
        }
        if self.snapshot.window_days <= 0 {
            return Err(MglError::Config(format!(
                "snapshot.window_days must be positive, got {}",
                self.snapshot.window_days
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// General system settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error. `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

/// Embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// `hashing`, `onnx` or `none`.
    #[serde(default = "default_hashing")]
    pub provider: String,
    /// Model identity for the ONNX provider.
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Vector dimension D.
    #[serde(default = "default_384")]
    pub dimensions: usize,
    /// Per-call budget before falling back to a zero vector.
    #[serde(default = "default_2000")]
    pub timeout_ms: u64,
    /// Successful embeddings kept in the LRU cache.
    #[serde(default = "default_1024")]
    pub cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_hashing(),
            model: default_embedding_model(),
            dimensions: 384,
            timeout_ms: 2000,
            cache_capacity: 1024,
        }
    }
}

/// Entity resolution and search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Minimum similarity for a resolution match.
    #[serde(default = "default_0_72")]
    pub similarity_threshold: f64,
    /// Minimum similarity for `search_entities`.
    #[serde(default = "default_0_4")]
    pub search_threshold: f64,
    /// Active candidates fetched per resolution.
    #[serde(default = "default_500")]
    pub candidate_limit: usize,
    /// Active candidates fetched per search.
    #[serde(default = "default_1000")]
    pub search_limit: usize,
    /// Decay rate given to new entities.
    #[serde(default = "default_decay_rate")]
    pub default_decay_rate: f64,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.72,
            search_threshold: 0.4,
            candidate_limit: 500,
            search_limit: 1000,
            default_decay_rate: 0.05,
        }
    }
}

/// Relationship reinforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipConfig {
    /// Confidence added when an existing triple is observed again.
    #[serde(default = "default_0_1")]
    pub confidence_boost: f64,
    /// Strength added when an existing triple is observed again.
    #[serde(default = "default_0_15")]
    pub strength_boost: f64,
    /// Confidence for relationships created without one.
    #[serde(default = "default_0_9")]
    pub default_confidence: f64,
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            confidence_boost: 0.1,
            strength_boost: 0.15,
            default_confidence: 0.9,
        }
    }
}

/// Event search and provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Minimum similarity for `search_events`.
    #[serde(default = "default_0_35")]
    pub search_threshold: f64,
    /// Most recent events considered per search.
    #[serde(default = "default_500")]
    pub search_limit: usize,
    /// Source transcript is truncated to this many characters.
    #[serde(default = "default_500")]
    pub transcript_limit_chars: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            search_threshold: 0.35,
            search_limit: 500,
            transcript_limit_chars: 500,
        }
    }
}

/// Confidence decay and forgetting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayConfig {
    /// Hours between decay cycles.
    #[serde(default = "default_24")]
    pub interval_hours: u64,
    /// Below this a record is forgotten.
    #[serde(default = "default_0_15")]
    pub min_confidence: f64,
    /// Entity types that decay slower.
    #[serde(default = "default_protected_types")]
    pub protected_types: Vec<EntityType>,
    /// Multiplier applied to protected types' decay.
    #[serde(default = "default_0_3")]
    pub protection_factor: f64,
    /// Per-mention damping coefficient.
    #[serde(default = "default_0_1")]
    pub mention_damping: f64,
    /// Per-evidence damping coefficient.
    #[serde(default = "default_0_2")]
    pub evidence_damping: f64,
    /// Default boost for `reinforce_entity`.
    #[serde(default = "default_0_2")]
    pub reinforce_boost: f64,
    /// Upper bound on records read per collection in one cycle.
    #[serde(default = "default_10000")]
    pub batch_limit: usize,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            interval_hours: 24,
            min_confidence: 0.15,
            protected_types: default_protected_types(),
            protection_factor: 0.3,
            mention_damping: 0.1,
            evidence_damping: 0.2,
            reinforce_boost: 0.2,
            batch_limit: 10_000,
        }
    }
}

/// Transcript extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Trimmed transcripts shorter than this are ignored.
    #[serde(default = "default_10")]
    pub min_transcript_chars: usize,
    /// Confidence for extracted relationships that carry none.
    #[serde(default = "default_0_8")]
    pub default_relationship_confidence: f64,
    /// Transcript is truncated to this many characters before prompting.
    #[serde(default = "default_8000")]
    pub max_prompt_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_transcript_chars: 10,
            default_relationship_confidence: 0.8,
            max_prompt_chars: 8000,
        }
    }
}

/// Recall and question answering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallConfig {
    /// Default `top_k` for `recall`.
    #[serde(default = "default_5")]
    pub top_k: usize,
    /// `top_k` used by `answer_query`.
    #[serde(default = "default_10")]
    pub query_top_k: usize,
    /// Reinforce entities that come back from a recall.
    #[serde(default)]
    pub reinforce_on_recall: bool,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            query_top_k: 10,
            reinforce_on_recall: false,
        }
    }
}

/// Weekly snapshot job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Days of events covered by one snapshot.
    #[serde(default = "default_7")]
    pub window_days: i64,
    /// Hours between snapshot runs.
    #[serde(default = "default_168")]
    pub interval_hours: u64,
    /// Events read per snapshot.
    #[serde(default = "default_100")]
    pub max_events: usize,
    /// Events included in the summary prompt.
    #[serde(default = "default_30_usize")]
    pub prompt_events: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            interval_hours: 168,
            max_events: 100,
            prompt_events: 30,
        }
    }
}

/// LLM integration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// `ollama`, `openai` or `none`.
    #[serde(default = "default_ollama")]
    pub provider: String,
    /// Backend base URL.
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    /// Model name.
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Bearer token for OpenAI-compatible backends.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-request timeout.
    #[serde(default = "default_30000")]
    pub request_timeout_ms: u64,
    /// Retries after the first failed attempt.
    #[serde(default = "default_2")]
    pub max_retries: u32,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Completion length cap.
    #[serde(default = "default_512")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_ollama(),
            base_url: default_ollama_url(),
            model: default_llm_model(),
            api_key: None,
            request_timeout_ms: 30_000,
            max_retries: 2,
            temperature: 0.2,
            max_tokens: 512,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Enable WAL journaling.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    /// How long a writer waits on a locked database.
    #[serde(default = "default_5000")]
    pub busy_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            wal_mode: true,
            busy_timeout_ms: 5000,
        }
    }
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_hashing() -> String { "hashing".to_string() }
fn default_embedding_model() -> String { "all-MiniLM-L6-v2".to_string() }
fn default_ollama() -> String { "ollama".to_string() }
fn default_ollama_url() -> String { "http://localhost:11434".to_string() }
fn default_llm_model() -> String { "qwen2.5:1.5b".to_string() }
fn default_db_path() -> PathBuf { PathBuf::from("mgl.db") }
fn default_protected_types() -> Vec<EntityType> { vec![EntityType::Person] }
fn default_temperature() -> f32 { 0.2 }
fn default_0_1() -> f64 { 0.1 }
fn default_0_15() -> f64 { 0.15 }
fn default_0_2() -> f64 { 0.2 }
fn default_0_3() -> f64 { 0.3 }
fn default_0_35() -> f64 { 0.35 }
fn default_0_4() -> f64 { 0.4 }
fn default_0_72() -> f64 { 0.72 }
fn default_0_8() -> f64 { 0.8 }
fn default_0_9() -> f64 { 0.9 }
fn default_decay_rate() -> f64 { 0.05 }
fn default_2() -> u32 { 2 }
fn default_5() -> usize { 5 }
fn default_7() -> i64 { 7 }
fn default_10() -> usize { 10 }
fn default_24() -> u64 { 24 }
fn default_30_usize() -> usize { 30 }
fn default_100() -> usize { 100 }
fn default_168() -> u64 { 168 }
fn default_384() -> usize { 384 }
fn default_500() -> usize { 500 }
fn default_512() -> u32 { 512 }
fn default_1000() -> usize { 1000 }
fn default_1024() -> usize { 1024 }
fn default_2000() -> u64 { 2000 }
fn default_5000() -> u64 { 5000 }
fn default_8000() -> usize { 8000 }
fn default_10000() -> usize { 10_000 }
fn default_30000() -> u64 { 30_000 }
