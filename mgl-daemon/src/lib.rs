//! # mgl-daemon
//!
//! Wires the memory engine into a long-running process: one SQLite store,
//! the configured embedding and text-generation backends, and two
//! background schedules (confidence decay, weekly snapshots) that stop
//! cleanly on shutdown.

#![deny(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{info, warn};

use mgl_core::config::{LlmConfig, MglConfig};
use mgl_core::decay::{DecayScheduler, PeriodicTask};
use mgl_core::embedding::Embedder;
use mgl_core::persistence::SqliteStore;
use mgl_core::MemoryEngine;
use mgl_llm::{LlmClient, LlmProvider, TextGenerator, UnavailableGenerator};

/// Build the text generator named by `config.provider`.
///
/// # Errors
///
/// Unknown provider names, or `openai` without an API key.
pub fn generator_from_config(config: &LlmConfig) -> anyhow::Result<Arc<dyn TextGenerator>> {
    let provider = match config.provider.as_str() {
        "none" => return Ok(Arc::new(UnavailableGenerator)),
        "ollama" => LlmProvider::Ollama {
            base_url: config.base_url.clone(),
        },
        "openai" => {
            let Some(api_key) = config.api_key.clone() else {
                bail!("llm.provider = \"openai\" requires llm.api_key (or MGL_LLM_API_KEY)");
            };
            LlmProvider::OpenAiCompatible {
                base_url: config.base_url.clone(),
                api_key,
            }
        }
        other => bail!("unknown llm.provider: {other}"),
    };
    let client = LlmClient::new(provider, config.model.clone(), config.max_retries).with_request_defaults(
        config.request_timeout_ms,
        config.max_tokens,
        config.temperature,
    );
    Ok(Arc::new(client))
}

/// Open storage and assemble a [`MemoryEngine`] from `config`.
///
/// # Errors
///
/// Invalid configuration, an unopenable database, or an unusable
/// embedding or LLM provider setting.
pub fn build_engine(config: MglConfig) -> anyhow::Result<Arc<MemoryEngine>> {
    config.validate().context("invalid configuration")?;
    let store = SqliteStore::open(&config.persistence)
        .with_context(|| format!("opening database at {}", config.persistence.path.display()))?;
    let embedder = Embedder::from_config(&config.embedding).context("initializing embeddings")?;
    if !embedder.is_available() {
        warn!("Embeddings disabled; recall and resolution fall back to substring matching");
    }
    let generator = generator_from_config(&config.llm)?;
    Ok(Arc::new(MemoryEngine::new(
        Arc::new(store),
        Arc::new(embedder),
        generator,
        config,
    )))
}

/// Snapshot every known owner. Returns how many snapshots were written.
pub async fn snapshot_all_owners(engine: &MemoryEngine) -> usize {
    let owners = match engine.owners() {
        Ok(owners) => owners,
        Err(e) => {
            warn!(error = %e, "Listing owners for snapshots failed");
            return 0;
        }
    };
    let mut written = 0;
    for owner in owners {
        match engine.create_weekly_snapshot(&owner).await {
            Ok(Some(_)) => written += 1,
            Ok(None) => {}
            Err(e) => warn!(owner = %owner, error = %e, "Snapshot failed"),
        }
    }
    info!(written, "Snapshot run complete");
    written
}

/// The running background schedules.
pub struct Daemon {
    engine: Arc<MemoryEngine>,
    decay: DecayScheduler,
    snapshots: PeriodicTask,
}

impl Daemon {
    /// Start the decay and snapshot schedules for `engine`.
    #[must_use]
    pub fn start(engine: Arc<MemoryEngine>) -> Self {
        let mut decay = DecayScheduler::from_config(engine.decay_service());
        decay.start();

        let period = Duration::from_secs(engine.config().snapshot.interval_hours.saturating_mul(3600));
        let snapshot_engine = Arc::clone(&engine);
        let snapshots = PeriodicTask::start("snapshots", period, move || {
            let engine = Arc::clone(&snapshot_engine);
            async move {
                snapshot_all_owners(&engine).await;
            }
        });

        info!("MGL daemon started");
        Self {
            engine,
            decay,
            snapshots,
        }
    }

    /// The engine served by this daemon.
    #[must_use]
    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }

    /// Whether both schedules are alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.decay.is_running() && self.snapshots.is_running()
    }

    /// Stop both schedules and wait for them.
    pub async fn stop(mut self) {
        self.decay.stop().await;
        self.snapshots.stop().await;
        info!("MGL daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &tempfile::TempDir) -> MglConfig {
        let mut config = MglConfig::default();
        config.persistence.path = dir.path().join("mgl.db");
        config.embedding.provider = "hashing".to_string();
        config.llm.provider = "none".to_string();
        config
    }

    #[test]
    fn generator_selection() {
        let mut llm = LlmConfig::default();
        llm.provider = "none".to_string();
        assert_eq!(generator_from_config(&llm).expect("none").model_name(), "none");

        llm.provider = "ollama".to_string();
        assert_eq!(generator_from_config(&llm).expect("ollama").model_name(), llm.model);

        llm.provider = "openai".to_string();
        llm.api_key = None;
        assert!(generator_from_config(&llm).is_err());

        llm.provider = "carrier-pigeon".to_string();
        assert!(generator_from_config(&llm).is_err());
    }

    #[tokio::test]
    async fn start_and_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = build_engine(config_in(&dir)).expect("engine");
        let daemon = Daemon::start(engine);
        assert!(daemon.is_running());
        assert_eq!(daemon.engine().stats("nobody").expect("stats").active_entities, 0);
        daemon.stop().await;
    }

    #[tokio::test]
    async fn snapshots_skip_owners_without_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = build_engine(config_in(&dir)).expect("engine");
        engine
            .create_entity("alice", "Sarah", None, Default::default())
            .await
            .expect("create");
        assert_eq!(snapshot_all_owners(&engine).await, 0);

        engine
            .events()
            .record_event("alice", "s1", "Sarah shipped billing", vec![], vec![], "")
            .await
            .expect("event");
        // No LLM configured: the fallback summary is stored.
        assert_eq!(snapshot_all_owners(&engine).await, 1);
        let stored = engine.snapshots("alice", 10).expect("snapshots");
        assert!(stored[0].summary.contains("Sarah shipped billing"));
    }
}
