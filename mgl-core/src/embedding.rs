//! Vector embedding abstraction layer.
//!
//! Provides a trait-based interface for generating text embeddings used for
//! entity resolution and semantic search, plus the async [`Embedder`]
//! service the stores call. The service never fails its callers: when the
//! provider is missing, errors, panics or times out, it hands back a
//! correctly-shaped zero vector and logs a warning.
//!
//! The production implementation uses ONNX Runtime (via `fastembed-rs`)
//! with the `all-MiniLM-L6-v2` model behind the `onnx` feature. A
//! deterministic feature-hashing provider covers tests and model-less
//! deployments.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{MglError, Result};
use crate::types::{Embedding, Entity, Event};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Generate vector embeddings from text.
///
/// Implementations are synchronous (CPU/GPU bound) and must be
/// `Send + Sync`; [`Embedder`] moves calls onto the blocking pool.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string.
    ///
    /// Returns a vector of `dimensions()` floats.
    ///
    /// # Errors
    ///
    /// Returns [`MglError::Serialization`] if the model fails to
    /// produce an embedding.
    fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embed a batch of texts.
    ///
    /// Default implementation calls `embed` in a loop. High-throughput
    /// providers should override this with a native batch API.
    ///
    /// # Errors
    ///
    /// Returns an error if any embedding in the batch fails.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// The dimensionality of embeddings produced by this provider.
    fn dimensions(&self) -> usize;

    /// A human-readable name for the model (e.g. `"all-MiniLM-L6-v2"`).
    fn model_name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Cosine similarity & ranking
// ---------------------------------------------------------------------------

/// Compute the cosine similarity between two embedding vectors.
///
/// Returns a value in \[-1.0, 1.0\]. Returns `0.0` if either vector has
/// zero magnitude or the dimensions differ.
#[must_use]
pub fn cosine_similarity(a: &Embedding, b: &Embedding) -> f64 {
    if a.0.len() != b.0.len() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut mag_a = 0.0_f64;
    let mut mag_b = 0.0_f64;

    for (x, y) in a.0.iter().zip(b.0.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }

    let denom = mag_a.sqrt() * mag_b.sqrt();
    if denom < f64::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

/// A record that carries an embedding usable for ranking.
pub trait Embedded {
    /// The vector to compare against a query.
    fn embedding(&self) -> &Embedding;
}

impl Embedded for Entity {
    fn embedding(&self) -> &Embedding {
        &self.embedding
    }
}

impl Embedded for Event {
    fn embedding(&self) -> &Embedding {
        &self.embedding
    }
}

impl<T: Embedded> Embedded for &T {
    fn embedding(&self) -> &Embedding {
        (*self).embedding()
    }
}

/// A ranked candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scored<T> {
    /// The candidate record.
    pub item: T,
    /// Cosine similarity to the query.
    pub similarity: f64,
}

/// Rank `candidates` by similarity to `query`.
///
/// Candidates with an empty vector or a dimension other than the query's
/// are skipped. Survivors with similarity `>= threshold` are sorted
/// descending (ties keep their input order) and at most `top_k` are
/// returned. A zero query vector (embedding unavailable) ranks nothing.
#[must_use]
pub fn find_most_similar<T, I>(query: &Embedding, candidates: I, top_k: usize, threshold: f64) -> Vec<Scored<T>>
where
    T: Embedded,
    I: IntoIterator<Item = T>,
{
    if top_k == 0 || query.is_zero() {
        return Vec::new();
    }
    let dims = query.dimensions();

    let mut scored: Vec<Scored<T>> = candidates
        .into_iter()
        .filter(|c| !c.embedding().is_empty() && c.embedding().dimensions() == dims)
        .filter_map(|c| {
            let similarity = cosine_similarity(query, c.embedding());
            (similarity >= threshold).then_some(Scored { item: c, similarity })
        })
        .collect();

    scored.sort_by_key(|s| std::cmp::Reverse(OrderedFloat(s.similarity)));
    scored.truncate(top_k);
    scored
}

// ---------------------------------------------------------------------------
// Embedder service
// ---------------------------------------------------------------------------

/// Best-effort async embedding service shared by the stores.
///
/// Wraps an optional [`EmbeddingProvider`]; calls run on the blocking pool
/// under a timeout and successful results are kept in a bounded LRU cache.
pub struct Embedder {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    dimensions: usize,
    timeout: Duration,
    cache: Option<Mutex<LruCache<String, Embedding>>>,
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("model", &self.model_name())
            .field("dimensions", &self.dimensions)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Embedder {
    /// Wrap a provider.
    #[must_use]
    pub fn new(provider: Arc<dyn EmbeddingProvider>, timeout: Duration, cache_capacity: usize) -> Self {
        let dimensions = provider.dimensions();
        Self {
            provider: Some(provider),
            dimensions,
            timeout,
            cache: NonZeroUsize::new(cache_capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    /// An embedder with no backing capability: every call yields zeros.
    #[must_use]
    pub fn unavailable(dimensions: usize) -> Self {
        Self {
            provider: None,
            dimensions,
            timeout: Duration::ZERO,
            cache: None,
        }
    }

    /// Build the provider named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`MglError::Config`] for an unknown provider name, or when
    /// `onnx` is requested without the feature compiled in.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let provider: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
            "hashing" => Arc::new(HashingEmbeddingProvider::new(config.dimensions)),
            "onnx" => Arc::new(OnnxEmbeddingProvider::new(&config.model)?),
            "none" => return Ok(Self::unavailable(config.dimensions)),
            other => {
                return Err(MglError::Config(format!("unknown embedding provider: {other}")));
            }
        };
        if provider.dimensions() != config.dimensions {
            return Err(MglError::Config(format!(
                "embedding model '{}' produces {}-dim vectors but config specifies {}",
                provider.model_name(),
                provider.dimensions(),
                config.dimensions
            )));
        }
        Ok(Self::new(provider, timeout, config.cache_capacity))
    }

    /// Vector dimension D.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Model identity, `"none"` when unavailable.
    #[must_use]
    pub fn model_name(&self) -> &str {
        self.provider.as_deref().map_or("none", |p| p.model_name())
    }

    /// Whether a provider is configured.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    /// Embed one text; zero vector on any failure.
    pub async fn embed(&self, text: &str) -> Embedding {
        if let Some(hit) = self.cached(text) {
            return hit;
        }
        let Some(provider) = self.provider.clone() else {
            return Embedding::zeros(self.dimensions);
        };

        let owned = text.to_string();
        let task = tokio::task::spawn_blocking(move || provider.embed(&owned));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(embedding))) if embedding.dimensions() == self.dimensions => {
                self.remember(text, &embedding);
                embedding
            }
            Ok(Ok(Ok(embedding))) => {
                warn!(
                    expected = self.dimensions,
                    actual = embedding.dimensions(),
                    "Embedding dimension mismatch, using zero vector"
                );
                Embedding::zeros(self.dimensions)
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "Embedding failed, using zero vector");
                Embedding::zeros(self.dimensions)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Embedding task panicked, using zero vector");
                Embedding::zeros(self.dimensions)
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis(), "Embedding timed out, using zero vector");
                Embedding::zeros(self.dimensions)
            }
        }
    }

    /// Embed several texts in one provider call; zeros for the whole batch
    /// on failure.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Embedding> {
        let mut out: Vec<Option<Embedding>> = texts.iter().map(|t| self.cached(t)).collect();
        let missing: Vec<String> = texts
            .iter()
            .zip(&out)
            .filter(|(_, hit)| hit.is_none())
            .map(|(t, _)| t.clone())
            .collect();

        if !missing.is_empty() {
            let fresh = self.embed_uncached_batch(missing.clone()).await;
            let mut fresh = missing.iter().zip(fresh);
            for slot in out.iter_mut().filter(|slot| slot.is_none()) {
                if let Some((text, embedding)) = fresh.next() {
                    if let Some(embedding) = embedding {
                        self.remember(text, &embedding);
                        *slot = Some(embedding);
                    }
                }
            }
        }

        out.into_iter()
            .map(|e| e.unwrap_or_else(|| Embedding::zeros(self.dimensions)))
            .collect()
    }

    async fn embed_uncached_batch(&self, texts: Vec<String>) -> Vec<Option<Embedding>> {
        let count = texts.len();
        let Some(provider) = self.provider.clone() else {
            return vec![None; count];
        };
        let task = tokio::task::spawn_blocking(move || provider.embed_batch(&texts));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(batch))) if batch.len() == count => batch
                .into_iter()
                .map(|e| (e.dimensions() == self.dimensions).then_some(e))
                .collect(),
            Ok(Ok(Ok(batch))) => {
                warn!(expected = count, actual = batch.len(), "Embedding batch size mismatch");
                vec![None; count]
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, batch = count, "Batch embedding failed, using zero vectors");
                vec![None; count]
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Batch embedding task panicked, using zero vectors");
                vec![None; count]
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis(), "Batch embedding timed out");
                vec![None; count]
            }
        }
    }

    fn cached(&self, text: &str) -> Option<Embedding> {
        let hit = self.cache.as_ref()?.lock().get(text).cloned();
        if hit.is_some() {
            debug!(len = text.len(), "Embedding cache hit");
        }
        hit
    }

    fn remember(&self, text: &str, embedding: &Embedding) {
        if let Some(cache) = &self.cache {
            cache.lock().put(text.to_string(), embedding.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Feature-hashing provider (tests & model-less deployments)
// ---------------------------------------------------------------------------

/// Deterministic bag-of-words embedding via the hashing trick.
///
/// Each lowercased word contributes to one signed bucket, and its character
/// trigrams contribute at half weight so near-spellings stay close. The
/// result is L2-normalized. Text without any word characters embeds to the
/// zero vector.
pub struct HashingEmbeddingProvider {
    dims: usize,
}

impl HashingEmbeddingProvider {
    /// Create a provider with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dims: dimensions.max(1) }
    }

    fn add_feature(&self, v: &mut [f32], feature: &[u8], weight: f32) {
        let h = fnv1a(feature);
        #[allow(clippy::cast_possible_truncation)]
        let bucket = (h % self.dims as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

impl Default for HashingEmbeddingProvider {
    fn default() -> Self {
        Self::new(384)
    }
}

impl EmbeddingProvider for HashingEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Embedding> {
        let mut v = vec![0.0_f32; self.dims];
        let lowered = text.to_lowercase();
        for word in lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            self.add_feature(&mut v, word.as_bytes(), 1.0);
            let chars: Vec<char> = word.chars().collect();
            for gram in chars.windows(3) {
                let gram: String = gram.iter().collect();
                self.add_feature(&mut v, format!("#{gram}").as_bytes(), 0.5);
            }
        }

        let mag: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if mag < f32::EPSILON {
            return Ok(Embedding(vec![0.0; self.dims]));
        }
        Ok(Embedding(v.into_iter().map(|x| x / mag).collect()))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "feature-hashing"
    }
}

/// 64-bit FNV-1a, stable across platforms and releases.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |h, b| (h ^ u64::from(*b)).wrapping_mul(PRIME))
}

// ---------------------------------------------------------------------------
// ONNX provider
// ---------------------------------------------------------------------------

/// Production embedding provider: `all-MiniLM-L6-v2` (384-d) through
/// `fastembed`. Requires the `onnx` feature.
#[cfg(feature = "onnx")]
pub struct OnnxEmbeddingProvider {
    model: fastembed::TextEmbedding,
    name: String,
}

#[cfg(feature = "onnx")]
impl OnnxEmbeddingProvider {
    /// Load the named model, downloading it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`MglError::Config`] for an unsupported model name or if the
    /// ONNX model cannot be loaded.
    pub fn new(model_name: &str) -> Result<Self> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let model = match model_name {
            "all-MiniLM-L6-v2" | "AllMiniLML6V2" => EmbeddingModel::AllMiniLML6V2,
            other => return Err(MglError::Config(format!("unsupported ONNX model: {other}"))),
        };
        let model = TextEmbedding::try_new(InitOptions::new(model))
            .map_err(|e| MglError::Config(format!("failed to load {model_name}: {e}")))?;
        tracing::info!(model = model_name, "ONNX embedding model loaded");
        Ok(Self {
            model,
            name: model_name.to_string(),
        })
    }
}

#[cfg(feature = "onnx")]
impl EmbeddingProvider for OnnxEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Embedding> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| MglError::Serialization("empty embedding result".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        self.model
            .embed(texts.to_vec(), None)
            .map(|batch| batch.into_iter().map(Embedding).collect())
            .map_err(|e| MglError::Serialization(e.to_string()))
    }

    fn dimensions(&self) -> usize {
        384
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

/// Stand-in when the crate is built without the `onnx` feature.
#[cfg(not(feature = "onnx"))]
pub struct OnnxEmbeddingProvider {
    _private: (),
}

#[cfg(not(feature = "onnx"))]
impl OnnxEmbeddingProvider {
    /// Always fails: rebuild with `--features onnx`.
    ///
    /// # Errors
    ///
    /// Always returns [`MglError::Config`].
    pub fn new(model_name: &str) -> Result<Self> {
        Err(MglError::Config(format!(
            "ONNX embedding provider for '{model_name}' requires the `onnx` feature"
        )))
    }
}

#[cfg(not(feature = "onnx"))]
impl EmbeddingProvider for OnnxEmbeddingProvider {
    fn embed(&self, _text: &str) -> Result<Embedding> {
        Err(MglError::Config("onnx feature disabled".to_string()))
    }

    fn dimensions(&self) -> usize {
        384
    }

    fn model_name(&self) -> &str {
        "onnx-disabled"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cosine_identical_vectors() {
        let a = Embedding(vec![1.0, 0.0, 0.0]);
        let b = Embedding(vec![1.0, 0.0, 0.0]);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        let a = Embedding(vec![1.0, 0.0]);
        let b = Embedding(vec![0.0, 1.0]);
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_opposite_vectors() {
        let a = Embedding(vec![1.0, 0.0]);
        let b = Embedding(vec![-1.0, 0.0]);
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_and_mismatched() {
        let zero = Embedding(vec![0.0, 0.0]);
        let a = Embedding(vec![1.0, 0.0]);
        assert_eq!(cosine_similarity(&zero, &a), 0.0);
        assert_eq!(cosine_similarity(&a, &Embedding(vec![1.0, 0.0, 0.0])), 0.0);
    }

    struct Item(Embedding, &'static str);

    impl Embedded for Item {
        fn embedding(&self) -> &Embedding {
            &self.0
        }
    }

    #[test]
    fn ranking_filters_sorts_and_truncates() {
        let query = Embedding(vec![1.0, 0.0]);
        let items = vec![
            Item(Embedding(vec![0.6, 0.8]), "mid"),
            Item(Embedding(vec![1.0, 0.0]), "best"),
            Item(Embedding(vec![0.0, 1.0]), "orthogonal"),
            Item(Embedding(vec![1.0, 0.0, 0.0]), "wrong-dims"),
            Item(Embedding(vec![]), "empty"),
            Item(Embedding(vec![0.8, 0.6]), "good"),
        ];
        let ranked = find_most_similar(&query, &items, 2, 0.5);
        let names: Vec<&str> = ranked.iter().map(|s| s.item.1).collect();
        assert_eq!(names, vec!["best", "good"]);
        assert!(ranked.iter().all(|s| s.similarity >= 0.5));
    }

    #[test]
    fn ranking_ties_keep_input_order() {
        let query = Embedding(vec![1.0, 0.0]);
        let items = vec![
            Item(Embedding(vec![2.0, 0.0]), "first"),
            Item(Embedding(vec![1.0, 0.0]), "second"),
        ];
        let ranked = find_most_similar(&query, &items, 5, 0.0);
        assert_eq!(ranked[0].item.1, "first");
        assert_eq!(ranked[1].item.1, "second");
    }

    #[test]
    fn zero_query_ranks_nothing() {
        let items = vec![Item(Embedding(vec![1.0, 0.0]), "a")];
        assert!(find_most_similar(&Embedding::zeros(2), &items, 3, 0.0).is_empty());
    }

    #[test]
    fn hashing_is_deterministic_and_normalized() {
        let provider = HashingEmbeddingProvider::new(64);
        let a = provider.embed("Sarah from accounting").expect("embed");
        let b = provider.embed("sarah FROM accounting").expect("embed");
        assert_eq!(a, b);
        let mag: f32 = a.0.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 1e-4);
        assert!(provider.embed("  ... ").expect("embed").is_zero());
    }

    #[test]
    fn hashing_prefers_shared_words() {
        let provider = HashingEmbeddingProvider::default();
        let q = provider.embed("Tom billing").expect("embed");
        let near = provider.embed("Tom handles billing").expect("embed");
        let far = provider.embed("Lisbon holiday").expect("embed");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    struct CountingProvider {
        calls: AtomicUsize,
    }

    impl EmbeddingProvider for CountingProvider {
        fn embed(&self, text: &str) -> Result<Embedding> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text == "boom" {
                return Err(MglError::Serialization("model exploded".to_string()));
            }
            Ok(Embedding(vec![1.0, 0.0, 0.0]))
        }

        fn dimensions(&self) -> usize {
            3
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn embedder_caches_successes_only() {
        let provider = Arc::new(CountingProvider { calls: AtomicUsize::new(0) });
        let embedder = Embedder::new(provider.clone(), Duration::from_secs(5), 8);

        embedder.embed("hello").await;
        embedder.embed("hello").await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        assert!(embedder.embed("boom").await.is_zero());
        assert!(embedder.embed("boom").await.is_zero());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn embedder_batch_mixes_cache_and_fresh() {
        let provider = Arc::new(CountingProvider { calls: AtomicUsize::new(0) });
        let embedder = Embedder::new(provider, Duration::from_secs(5), 8);
        embedder.embed("a").await;

        let batch = embedder.embed_batch(&["a".to_string(), "b".to_string()]).await;
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|e| e.dimensions() == 3 && !e.is_zero()));
    }

    #[tokio::test]
    async fn unavailable_embedder_returns_shaped_zeros() {
        let embedder = Embedder::unavailable(16);
        let e = embedder.embed("anything").await;
        assert_eq!(e.dimensions(), 16);
        assert!(e.is_zero());
        assert_eq!(embedder.embed_batch(&["x".to_string(), "y".to_string()]).await.len(), 2);
        assert_eq!(embedder.model_name(), "none");
    }

    #[test]
    fn from_config_rejects_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "word2vec".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(matches!(Embedder::from_config(&config), Err(MglError::Config(_))));
    }
}
