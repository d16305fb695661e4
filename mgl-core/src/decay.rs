//! Confidence decay and forgetting.
//!
//! Each day without reinforcement multiplies a record's confidence by
//! `(1 - d)`, where the effective rate `d` is damped by how much evidence
//! supports the record:
//!
//! ```text
//! entity:        d = decay_rate × protection × 1 / (1 + mentions × 0.1)
//! relationship:  d = base_rate              × 1 / (1 + |evidence| × 0.2)
//! confidence'  = clamp(confidence × (1 - d)^days, 0, 1)
//! ```
//!
//! `protection` is 0.3 for protected types (people by default) and 1.0
//! otherwise. A record whose confidence falls below `min_confidence` is
//! forgotten: tombstoned with confidence 0, never revived automatically.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::DecayConfig;
use crate::error::Result;
use crate::persistence::{DecayWrite, MemoryStore};
use crate::types::{now, Entity, EntityId, Relationship};

const MILLIS_PER_DAY: f64 = 86_400_000.0;
/// Shortest schedule period accepted by [`PeriodicTask`].
const MIN_PERIOD: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Pure math
// ---------------------------------------------------------------------------

/// Fractional days between `from` and `to` (negative if `to` is earlier).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn days_elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / MILLIS_PER_DAY
}

/// `min(1, 1 / (1 + mentions × coefficient))`.
#[must_use]
pub fn mention_damping(mention_count: u32, coefficient: f64) -> f64 {
    (1.0 / (1.0 + f64::from(mention_count) * coefficient)).min(1.0)
}

/// `min(1, 1 / (1 + evidence × coefficient))`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn evidence_damping(evidence_count: usize, coefficient: f64) -> f64 {
    (1.0 / (1.0 + evidence_count as f64 * coefficient)).min(1.0)
}

/// Effective per-day decay for an entity.
#[must_use]
pub fn entity_effective_decay(entity: &Entity, config: &DecayConfig) -> f64 {
    let protection = if config.protected_types.contains(&entity.kind) {
        config.protection_factor
    } else {
        1.0
    };
    entity.decay_rate * protection * mention_damping(entity.mention_count, config.mention_damping)
}

/// Effective per-day decay for a relationship.
#[must_use]
pub fn relationship_effective_decay(relationship: &Relationship, base_rate: f64, config: &DecayConfig) -> f64 {
    base_rate * evidence_damping(relationship.evidence.len(), config.evidence_damping)
}

/// `clamp(confidence × (1 - effective_decay)^days, 0, 1)`.
#[must_use]
pub fn decayed_confidence(confidence: f64, effective_decay: f64, days: f64) -> f64 {
    let retained = (1.0 - effective_decay.clamp(0.0, 1.0)).powf(days.max(0.0));
    (confidence * retained).clamp(0.0, 1.0)
}

/// Round to four decimals, the precision persisted after decay.
#[must_use]
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn decay_write(current: f64, effective: f64, days: f64, min_confidence: f64) -> DecayWrite {
    let next = decayed_confidence(current, effective, days);
    if next < min_confidence {
        DecayWrite::Forget
    } else {
        DecayWrite::Decay(round4(next))
    }
}

// ---------------------------------------------------------------------------
// Decay cycle
// ---------------------------------------------------------------------------

/// Counters from one decay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecayStats {
    /// Entities whose confidence was reduced.
    pub entities_decayed: u64,
    /// Entities tombstoned.
    pub entities_forgotten: u64,
    /// Relationships whose confidence was reduced.
    pub relationships_decayed: u64,
    /// Relationships tombstoned.
    pub relationships_forgotten: u64,
    /// Records touched by someone else between read and write.
    pub skipped: u64,
    /// Records whose write failed.
    pub failed: u64,
}

/// Applies decay to every active entity and relationship.
pub struct DecayService {
    store: Arc<dyn MemoryStore>,
    config: DecayConfig,
    relationship_rate: f64,
}

impl DecayService {
    /// `relationship_rate` is the base decay rate for relationships
    /// (entities carry their own).
    #[must_use]
    pub fn new(store: Arc<dyn MemoryStore>, config: DecayConfig, relationship_rate: f64) -> Self {
        Self {
            store,
            config,
            relationship_rate,
        }
    }

    /// The decay settings in use.
    #[must_use]
    pub fn config(&self) -> &DecayConfig {
        &self.config
    }

    /// Run one cycle against the current time.
    ///
    /// # Errors
    ///
    /// Only if the candidate records cannot be read at all; per-record
    /// failures are counted in [`DecayStats::failed`].
    pub fn run_cycle(&self) -> Result<DecayStats> {
        self.run_cycle_at(now())
    }

    /// Run one cycle as if the time were `at`.
    ///
    /// Records seen or updated less than a day before `at` are left alone.
    /// Every write is conditional on the record being unchanged since it
    /// was read, so a concurrent mention or reinforcement wins.
    ///
    /// # Errors
    ///
    /// Only if the candidate records cannot be read at all.
    pub fn run_cycle_at(&self, at: DateTime<Utc>) -> Result<DecayStats> {
        let mut stats = DecayStats::default();
        let min = self.config.min_confidence;

        for entity in self.store.decay_entity_candidates(self.config.batch_limit)? {
            let days = days_elapsed(entity.last_seen, at);
            if days < 1.0 {
                continue;
            }
            let write = decay_write(entity.confidence, entity_effective_decay(&entity, &self.config), days, min);
            match self.store.decay_entity(entity.id, entity.last_seen, write) {
                Ok(true) if write == DecayWrite::Forget => {
                    debug!(entity_id = %entity.id, name = %entity.name, "Entity forgotten by decay");
                    stats.entities_forgotten += 1;
                }
                Ok(true) => stats.entities_decayed += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    warn!(entity_id = %entity.id, error = %e, "Entity decay failed");
                    stats.failed += 1;
                }
            }
        }

        for relationship in self.store.decay_relationship_candidates(self.config.batch_limit)? {
            let days = days_elapsed(relationship.updated_at, at);
            if days < 1.0 {
                continue;
            }
            let effective = relationship_effective_decay(&relationship, self.relationship_rate, &self.config);
            let write = decay_write(relationship.confidence, effective, days, min);
            match self.store.decay_relationship(relationship.id, relationship.updated_at, write) {
                Ok(true) if write == DecayWrite::Forget => stats.relationships_forgotten += 1,
                Ok(true) => stats.relationships_decayed += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    warn!(relationship_id = %relationship.id, error = %e, "Relationship decay failed");
                    stats.failed += 1;
                }
            }
        }

        info!(
            entities_decayed = stats.entities_decayed,
            entities_forgotten = stats.entities_forgotten,
            relationships_decayed = stats.relationships_decayed,
            relationships_forgotten = stats.relationships_forgotten,
            skipped = stats.skipped,
            failed = stats.failed,
            "Decay cycle complete"
        );
        Ok(stats)
    }

    /// Raise an active entity's confidence by `boost` (default from config,
    /// capped at 1), count a mention and refresh `last_seen`. Forgotten
    /// entities are left untouched and yield `None`.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn reinforce_entity(&self, id: EntityId, boost: Option<f64>) -> Result<Option<Entity>> {
        let boost = boost.unwrap_or(self.config.reinforce_boost);
        let reinforced = self.store.reinforce_entity(id, boost, now())?;
        if let Some(entity) = &reinforced {
            debug!(entity_id = %id, confidence = entity.confidence, "Entity reinforced");
        }
        Ok(reinforced)
    }
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// A cancellable job that runs every `period`, first one period after start.
///
/// Each run is spawned as its own task, so a panicking run is logged and the
/// schedule continues. Dropping the handle also stops the loop.
pub struct PeriodicTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn the loop on the current tokio runtime.
    pub fn start<F, Fut>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(MIN_PERIOD);
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(task = name, period_secs = period.as_secs(), "Periodic task started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = tokio::spawn(job()).await {
                            error!(task = name, error = %e, "Periodic run panicked");
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(task = name, "Periodic task stopped");
        });
        Self {
            name,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Whether the loop is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal shutdown and wait for the loop (and any in-flight run) to end.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(task = self.name, error = %e, "Periodic task ended abnormally");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Runs [`DecayService::run_cycle`] on a fixed interval.
pub struct DecayScheduler {
    service: Arc<DecayService>,
    interval: Duration,
    task: Option<PeriodicTask>,
}

impl DecayScheduler {
    /// Prepare a scheduler; nothing runs until [`DecayScheduler::start`].
    #[must_use]
    pub fn new(service: Arc<DecayService>, interval: Duration) -> Self {
        Self {
            service,
            interval,
            task: None,
        }
    }

    /// Scheduler using `decay.interval_hours` from the service's config.
    #[must_use]
    pub fn from_config(service: Arc<DecayService>) -> Self {
        let interval = Duration::from_secs(service.config().interval_hours.saturating_mul(3600));
        Self::new(service, interval)
    }

    /// Start the loop. Calling it while running does nothing.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let service = Arc::clone(&self.service);
        self.task = Some(PeriodicTask::start("decay", self.interval, move || {
            let service = Arc::clone(&service);
            async move {
                match tokio::task::spawn_blocking(move || service.run_cycle()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!(error = %e, "Decay cycle failed, retrying next interval"),
                    Err(e) => error!(error = %e, "Decay cycle panicked, retrying next interval"),
                }
            }
        }));
    }

    /// Whether the loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(PeriodicTask::is_running)
    }

    /// Stop the loop and wait for it to finish.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::persistence::SqliteStore;
    use crate::types::{Embedding, EntityType, RelationshipId};

    fn entity(kind: EntityType, confidence: f64, mentions: u32, days_ago: i64) -> Entity {
        let seen = now() - ChronoDuration::days(days_ago);
        Entity {
            id: EntityId::new(),
            owner: "u1".to_string(),
            name: "Sarah".to_string(),
            kind,
            aliases: BTreeSet::new(),
            embedding: Embedding::default(),
            attributes: BTreeMap::new(),
            confidence,
            mention_count: mentions,
            first_seen: seen,
            last_seen: seen,
            decay_rate: 0.05,
            is_forgotten: false,
        }
    }

    fn service() -> (Arc<SqliteStore>, DecayService) {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
        let service = DecayService::new(store.clone(), DecayConfig::default(), 0.05);
        (store, service)
    }

    #[test]
    fn damping_factors() {
        assert!((mention_damping(1, 0.1) - 1.0 / 1.1).abs() < 1e-12);
        assert!((mention_damping(0, 0.1) - 1.0).abs() < 1e-12);
        assert!((evidence_damping(5, 0.2) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn protected_people_decay_slower() {
        let config = DecayConfig::default();
        let person = entity(EntityType::Person, 1.0, 1, 10);
        let concept = entity(EntityType::Concept, 1.0, 1, 10);
        let dp = entity_effective_decay(&person, &config);
        let dc = entity_effective_decay(&concept, &config);
        assert!((dp - 0.05 * 0.3 / 1.1).abs() < 1e-12);
        assert!(dp < dc);
    }

    #[test]
    fn decay_is_bounded_and_non_increasing() {
        assert_eq!(decayed_confidence(0.8, 0.05, 0.0), 0.8);
        assert!(decayed_confidence(0.8, 0.05, 3.0) < 0.8);
        assert_eq!(decayed_confidence(0.8, 1.0, 2.0), 0.0);
        assert_eq!(decayed_confidence(1.5, 0.0, 2.0), 1.0);
    }

    #[test]
    fn sarah_after_ten_days_stays_active() {
        let (store, service) = service();
        let sarah = entity(EntityType::Person, 1.0, 1, 10);
        store.insert_entity(&sarah).expect("insert");

        let stats = service.run_cycle().expect("cycle");
        assert_eq!(stats.entities_decayed, 1);
        assert_eq!(stats.entities_forgotten, 0);

        let loaded = store.get_entity(sarah.id).expect("get").expect("present");
        let expected = (1.0_f64 - 0.05 * 0.3 / 1.1).powi(10);
        assert!((loaded.confidence - expected).abs() < 1e-3, "got {}", loaded.confidence);
        assert!((loaded.confidence - 0.8717).abs() < 1e-3);
        assert!(!loaded.is_forgotten);
    }

    #[test]
    fn weak_stale_concept_is_forgotten_for_good() {
        let (store, service) = service();
        let faded = entity(EntityType::Concept, 0.2, 1, 30);
        let fresh = entity(EntityType::Concept, 0.2, 1, 0);
        store.insert_entity(&faded).expect("insert");
        store.insert_entity(&fresh).expect("insert");

        let stats = service.run_cycle().expect("cycle");
        assert_eq!(stats.entities_forgotten, 1);
        assert_eq!(stats.entities_decayed, 0, "records seen within a day are skipped");

        let loaded = store.get_entity(faded.id).expect("get").expect("present");
        assert!(loaded.is_forgotten);
        assert_eq!(loaded.confidence, 0.0);

        assert!(service.reinforce_entity(faded.id, Some(1.0)).expect("reinforce").is_none());
        let again = service.run_cycle().expect("cycle");
        assert_eq!(again.entities_forgotten, 0);
        assert!(store.get_entity(faded.id).expect("get").expect("present").is_forgotten);
    }

    #[test]
    fn relationships_decay_with_evidence_damping() {
        let (store, service) = service();
        let t = now() - ChronoDuration::days(5);
        let rel = Relationship {
            id: RelationshipId::new(),
            owner: "u1".to_string(),
            subject_id: EntityId::new(),
            predicate: "knows".to_string(),
            object_id: EntityId::new(),
            strength: 0.9,
            confidence: 0.9,
            evidence: BTreeSet::from(["s1".to_string()]),
            created_at: t,
            updated_at: t,
            is_forgotten: false,
        };
        store.insert_relationship(&rel).expect("insert");

        let stats = service.run_cycle().expect("cycle");
        assert_eq!(stats.relationships_decayed, 1);
        let loaded = store.get_relationship(rel.id).expect("get").expect("present");
        let expected = 0.9 * (1.0_f64 - 0.05 / 1.2).powi(5);
        assert!((loaded.confidence - expected).abs() < 1e-3);
        assert!((loaded.strength - 0.9).abs() < f64::EPSILON, "strength does not decay");
    }

    #[test]
    fn reinforce_caps_and_counts() {
        let (store, service) = service();
        let e = entity(EntityType::Concept, 0.9, 1, 3);
        store.insert_entity(&e).expect("insert");
        let reinforced = service.reinforce_entity(e.id, None).expect("reinforce").expect("active");
        assert!((reinforced.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(reinforced.mention_count, 2);
        assert!(reinforced.last_seen > e.last_seen);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_waits_one_period_and_stops() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = PeriodicTask::start("test", Duration::from_secs(3600), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(3599)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(3600 + 2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(task.is_running());

        task.stop().await;
        tokio::time::sleep(Duration::from_secs(5 * 3600)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_run_does_not_end_the_schedule() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = PeriodicTask::start("flaky", Duration::from_secs(60), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(181)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        task.stop().await;
    }

    #[tokio::test]
    async fn scheduler_start_stop_lifecycle() {
        let (_, service) = service();
        let mut scheduler = DecayScheduler::new(Arc::new(service), Duration::from_secs(3600));
        assert!(!scheduler.is_running());
        scheduler.start();
        scheduler.start();
        assert!(scheduler.is_running());
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }
}
