//! Candidate reranking with a backend fallback chain
//!
//! Backends are tried in configured order: cross-encoder, embedding
//! similarity, then BM25 term overlap. A backend that fails to load or
//! score is skipped with a warning and the next one serves the request.
//! The lexical scorer always closes the chain, so reranking itself never
//! fails for backend reasons.
//!
//! Reranking only filters and reorders: every returned candidate is one of
//! the inputs with `reranked_score` filled in.

pub mod cross_encoder;
pub mod embedding;
pub mod lexical;

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RerankerConfig;
use crate::error::{MemoryError, Result};
use crate::ports::EmbeddingPort;

use super::types::Candidate;

pub use cross_encoder::CrossEncoderBackend;
pub use embedding::EmbeddingBackend;
pub use lexical::LexicalBackend;

/// Reranking backends, in the names used by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankerKind {
    CrossEncoder,
    Embedding,
    Lexical,
}

impl RerankerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RerankerKind::CrossEncoder => "cross_encoder",
            RerankerKind::Embedding => "embedding",
            RerankerKind::Lexical => "lexical",
        }
    }
}

/// Scores (query, document) pairs
#[async_trait]
pub trait RerankBackend: Send + Sync {
    fn kind(&self) -> RerankerKind;

    /// Make the backend ready. Fails with `ModelLoad` when it cannot be used.
    async fn load(&self) -> Result<()>;

    /// One score in [0, 1] per document, in input order
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

struct CachedScores {
    at: Instant,
    kind: RerankerKind,
    scores: Vec<f32>,
}

pub struct Reranker {
    backends: Vec<Arc<dyn RerankBackend>>,
    cache: Mutex<LruCache<u64, CachedScores>>,
    ttl: Duration,
    active: RwLock<Option<RerankerKind>>,
    warnings: Mutex<Vec<String>>,
    config: RerankerConfig,
}

impl Reranker {
    /// Build the configured chain. `embedder` serves the embedding backend.
    pub fn new(config: RerankerConfig, embedder: Arc<dyn EmbeddingPort>) -> Self {
        let backends: Vec<Arc<dyn RerankBackend>> = config
            .backends
            .iter()
            .map(|kind| -> Arc<dyn RerankBackend> {
                match kind {
                    RerankerKind::CrossEncoder => Arc::new(CrossEncoderBackend::new()),
                    RerankerKind::Embedding => Arc::new(EmbeddingBackend::new(embedder.clone())),
                    RerankerKind::Lexical => Arc::new(LexicalBackend),
                }
            })
            .collect();
        Self::with_backends(config, backends)
    }

    /// Use an explicit chain. A lexical backend is appended when missing.
    pub fn with_backends(config: RerankerConfig, mut backends: Vec<Arc<dyn RerankBackend>>) -> Self {
        if !backends.iter().any(|b| b.kind() == RerankerKind::Lexical) {
            backends.push(Arc::new(LexicalBackend));
        }
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            backends,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_secs(config.cache_ttl_secs),
            active: RwLock::new(None),
            warnings: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &RerankerConfig {
        &self.config
    }

    /// Backend that served the most recent request
    pub fn active_backend(&self) -> Option<RerankerKind> {
        *self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fallback warnings seen so far
    pub fn warnings(&self) -> Vec<String> {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rerank with the configured `top_k` and `threshold`
    pub async fn rerank_default(&self, query: &str, candidates: Vec<Candidate>) -> Result<Vec<Candidate>> {
        self.rerank(query, candidates, self.config.top_k, self.config.threshold)
            .await
    }

    /// Score, sort best first, drop anything below `threshold` and keep `top_k`
    pub async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<Candidate>,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<Candidate>> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(MemoryError::Validation(format!(
                "threshold must be within [0, 1], got {threshold}"
            )));
        }
        if candidates.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let documents: Vec<String> = candidates.iter().map(|c| c.content.clone()).collect();
        let (kind, scores) = self.scores_for(query, &documents).await;
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(kind);

        for (candidate, score) in candidates.iter_mut().zip(scores) {
            candidate.reranked_score = Some(score);
        }
        // Stable sort keeps retrieval order among equal scores
        candidates.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.retain(|c| c.score() >= threshold);
        candidates.truncate(top_k);

        debug!(
            "Reranked with {}: kept {} of {} candidates",
            kind.as_str(),
            candidates.len(),
            documents.len()
        );
        Ok(candidates)
    }

    async fn scores_for(&self, query: &str, documents: &[String]) -> (RerankerKind, Vec<f32>) {
        let key = cache_key(query, documents);
        if let Some(hit) = self.cached(key) {
            return hit;
        }

        for backend in &self.backends {
            let kind = backend.kind();
            let attempt = match backend.load().await {
                Ok(()) => backend.score(query, documents).await,
                Err(e) => Err(e),
            };
            match attempt {
                Ok(scores) if scores.len() == documents.len() => {
                    self.remember(key, kind, &scores);
                    return (kind, scores);
                }
                Ok(scores) => self.warn_fallback(
                    kind,
                    &format!("returned {} scores for {} documents", scores.len(), documents.len()),
                ),
                Err(e) => self.warn_fallback(kind, &e.to_string()),
            }
        }

        // Only reachable when a custom lexical backend misbehaves
        let scores = documents
            .iter()
            .map(|d| LexicalBackend::score_one(query, d))
            .collect();
        (RerankerKind::Lexical, scores)
    }

    fn cached(&self, key: u64) -> Option<(RerankerKind, Vec<f32>)> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = cache.get(&key).map(|c| c.at.elapsed() < self.ttl)?;
        if !fresh {
            cache.pop(&key);
            return None;
        }
        cache.get(&key).map(|c| (c.kind, c.scores.clone()))
    }

    fn remember(&self, key: u64, kind: RerankerKind, scores: &[f32]) {
        if self.ttl.is_zero() {
            return;
        }
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(
                key,
                CachedScores {
                    at: Instant::now(),
                    kind,
                    scores: scores.to_vec(),
                },
            );
    }

    fn warn_fallback(&self, kind: RerankerKind, reason: &str) {
        let message = format!("{} reranker unavailable: {}", kind.as_str(), reason);
        warn!("{}, falling back", message);
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }
}

fn cache_key(query: &str, documents: &[String]) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    documents.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::types::CandidateSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that counts calls and scores by a fixed table
    struct CountingBackend {
        kind: RerankerKind,
        fail_load: bool,
        loads: AtomicUsize,
        scores: AtomicUsize,
    }

    impl CountingBackend {
        fn new(kind: RerankerKind, fail_load: bool) -> Self {
            Self {
                kind,
                fail_load,
                loads: AtomicUsize::new(0),
                scores: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RerankBackend for CountingBackend {
        fn kind(&self) -> RerankerKind {
            self.kind
        }

        async fn load(&self) -> Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_load {
                Err(MemoryError::ModelLoad("no model".to_string()))
            } else {
                Ok(())
            }
        }

        async fn score(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>> {
            self.scores.fetch_add(1, Ordering::SeqCst);
            Ok((0..documents.len()).map(|i| 1.0 / (i as f32 + 1.0)).collect())
        }
    }

    fn candidates(n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|i| Candidate::new(format!("document {i}"), CandidateSource::Episodic, 0.5))
            .collect()
    }

    #[tokio::test]
    async fn test_falls_back_and_reports_active_backend() {
        let broken = Arc::new(CountingBackend::new(RerankerKind::CrossEncoder, true));
        let reranker = Reranker::with_backends(RerankerConfig::default(), vec![broken.clone()]);

        let out = reranker.rerank("document", candidates(3), 10, 0.0).await.unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(reranker.active_backend(), Some(RerankerKind::Lexical));
        assert_eq!(reranker.warnings().len(), 1);
    }

    #[tokio::test]
    async fn test_filters_and_reorders_only() {
        let primary = Arc::new(CountingBackend::new(RerankerKind::CrossEncoder, false));
        let reranker = Reranker::with_backends(RerankerConfig::default(), vec![primary]);
        let input = candidates(5);

        let out = reranker.rerank("q", input.clone(), 3, 0.3).await.unwrap();
        // Scores are 1, 1/2, 1/3, 1/4, 1/5
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].content, "document 0");
        for c in &out {
            assert!(c.reranked_score.unwrap() >= 0.3);
            assert!(input.iter().any(|i| i.content == c.content));
        }
        assert_eq!(reranker.active_backend(), Some(RerankerKind::CrossEncoder));
    }

    #[tokio::test]
    async fn test_identical_requests_hit_cache() {
        let primary = Arc::new(CountingBackend::new(RerankerKind::Embedding, false));
        let reranker = Reranker::with_backends(RerankerConfig::default(), vec![primary.clone()]);

        reranker.rerank("q", candidates(4), 10, 0.0).await.unwrap();
        reranker.rerank("q", candidates(4), 10, 0.0).await.unwrap();
        assert_eq!(primary.scores.load(Ordering::SeqCst), 1);

        reranker.rerank("other", candidates(4), 10, 0.0).await.unwrap();
        assert_eq!(primary.scores.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_cache() {
        let primary = Arc::new(CountingBackend::new(RerankerKind::Embedding, false));
        let config = RerankerConfig {
            cache_ttl_secs: 0,
            ..Default::default()
        };
        let reranker = Reranker::with_backends(config, vec![primary.clone()]);
        reranker.rerank("q", candidates(2), 10, 0.0).await.unwrap();
        reranker.rerank("q", candidates(2), 10, 0.0).await.unwrap();
        assert_eq!(primary.scores.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejects_bad_threshold_and_handles_empty() {
        let reranker = Reranker::with_backends(RerankerConfig::default(), vec![]);
        assert!(reranker.rerank("q", candidates(2), 5, 1.5).await.is_err());
        assert!(reranker.rerank("q", vec![], 5, 0.5).await.unwrap().is_empty());
        assert!(reranker.rerank("q", candidates(2), 0, 0.5).await.unwrap().is_empty());
    }
}
