//! # mgl-llm: Text-Generation Capability for MGL
//!
//! The memory graph layer treats the language model as an unreliable
//! capability: "given a prompt, return text". This crate provides:
//!   - **[`TextGenerator`]**: the narrow async trait the core depends on
//!   - **[`LlmClient`]**: Ollama and OpenAI-compatible backends with
//!     timeouts and retries
//!   - **Prompt templates** for structured extraction, weekly summaries and
//!     memory-grounded question answering
//!   - **Lenient JSON extraction** from free-form model output
//!
//! Callers are expected to wrap every call with a fallback; nothing in the
//! memory layer fails just because the model is down.
//!
//! # Architecture
//!
//! ```text
//! mgl-core (Extractor, MemoryEngine)
//!        │  Arc<dyn TextGenerator>
//!        ▼
//! ┌──────────────────────┐   ┌────────────────────┐
//! │ LlmClient            │   │ ScriptedGenerator  │  (tests)
//! │  Ollama /api/generate│   │ UnavailableGen.    │  (degraded mode)
//! │  OpenAI /v1/chat     │   └────────────────────┘
//! └──────────────────────┘
//! ```

#![deny(clippy::unwrap_used)]

pub mod client;
pub mod error;
pub mod generator;
pub mod prompt;
pub mod types;

pub use client::{LlmClient, LlmProvider};
pub use error::LlmError;
pub use generator::{ScriptedGenerator, TextGenerator, UnavailableGenerator};
pub use types::{ChatRole, ChatTurn, LlmRequest, LlmResponse};
