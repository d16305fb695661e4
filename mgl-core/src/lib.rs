//! # MGL Core Library
//!
//! Long-term conversational memory as a small knowledge graph.
//!
//! Transcripts are turned into three kinds of record, each scoped to an
//! owner (one end user):
//!
//! - **Entities**: people, places, organizations and concepts, resolved
//!   across sessions by embedding similarity
//! - **Relationships**: directed, predicate-normalized edges between
//!   entities, reinforced rather than duplicated
//! - **Events**: append-only episodes tied to a session
//!
//! Confidence decays every day a record is not reinforced; below a floor
//! the record is forgotten (tombstoned, never revived). [`MemoryEngine`]
//! bundles the stores and answers recall and question-answering requests
//! with a memory context block for a chat model.
//!
//! The text-generation capability lives in `mgl-llm`; the storage engine
//! sits behind [`persistence::MemoryStore`].

#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod decay;
pub mod embedding;
pub mod engine;
pub mod entity;
pub mod error;
pub mod event;
pub mod extractor;
pub mod logging;
pub mod persistence;
pub mod relationship;
pub mod types;

pub use config::MglConfig;
pub use engine::MemoryEngine;
pub use error::{MglError, Result};
pub use types::*;
