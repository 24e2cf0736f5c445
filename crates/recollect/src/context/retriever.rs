//! Multi-source retrieval
//!
//! Fans out to the episodic log, the knowledge graph and the rule store
//! concurrently. The [`RetrievalStrategy`] of the call decides which of them
//! are consulted. A failing source is logged and reported as degraded; the
//! other sources still contribute.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{RetrievalConfig, RetrievalStrategy};
use crate::episodic::{EpisodicQuery, EpisodicStore};
use crate::error::{MemoryError, Result};
use crate::procedural::ProceduralStore;
use crate::semantic::{SemanticFact, SemanticGraphStore, TraversalQuery};

use super::types::{Candidate, CandidateSource, RetrievalResult};

pub struct Retriever {
    episodic: Arc<EpisodicStore>,
    semantic: Arc<SemanticGraphStore>,
    procedural: Arc<ProceduralStore>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        episodic: Arc<EpisodicStore>,
        semantic: Arc<SemanticGraphStore>,
        procedural: Arc<ProceduralStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            episodic,
            semantic,
            procedural,
            config,
        }
    }

    /// Configuration used when a call brings none of its own
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve candidates for `query`, optionally restricting the episodic
    /// source to one session
    pub async fn retrieve(
        &self,
        query: &str,
        session_id: Option<&str>,
        config: &RetrievalConfig,
    ) -> Result<RetrievalResult> {
        if query.trim().is_empty() {
            return Err(MemoryError::Validation("query must not be empty".to_string()));
        }

        let strategy = config.strategy;
        debug!("Retrieving with {} strategy", strategy);
        let (episodic, semantic, procedural) = tokio::join!(
            async {
                if strategy.uses_episodic() {
                    self.from_episodic(query, session_id, config).await
                } else {
                    Ok(Vec::new())
                }
            },
            async {
                if strategy.uses_semantic() {
                    self.from_graph(query, config).await
                } else {
                    Ok(Vec::new())
                }
            },
            async {
                if strategy.uses_procedural() {
                    self.from_rules(query, config).await
                } else {
                    Ok(Vec::new())
                }
            },
        );

        let mut result = RetrievalResult::default();
        let mut merged: Vec<Candidate> = Vec::new();
        for (source, fetched) in [
            (CandidateSource::Episodic, episodic),
            (CandidateSource::Semantic, semantic),
            (CandidateSource::Procedural, procedural),
        ] {
            match fetched {
                Ok(candidates) => {
                    debug!("Retrieved {} {} candidates", candidates.len(), source);
                    merged.extend(candidates);
                }
                Err(e) => {
                    warn!("Retrieval source {} failed, continuing without it: {}", source, e);
                    result.degraded_sources.push(source);
                }
            }
        }

        result.strategy = strategy;
        result.candidates = merge_candidates(merged, config.max_candidates);
        Ok(result)
    }

    async fn from_episodic(
        &self,
        query: &str,
        session_id: Option<&str>,
        config: &RetrievalConfig,
    ) -> Result<Vec<Candidate>> {
        let mut request = EpisodicQuery::text(query)
            .limit(config.episodic_top_k)
            .min_relevance(config.min_relevance);
        if config.temporal_boost {
            request = request.boosted();
        }
        if let Some(session) = session_id {
            request = request.in_session(session);
        }

        let hits = self.episodic.search(&request).await?;
        Ok(hits
            .into_iter()
            .map(|hit| {
                Candidate::new(
                    hit.entry.content,
                    CandidateSource::Episodic,
                    config.episodic_weight * hit.final_score,
                )
                .with_timestamp(hit.entry.timestamp)
            })
            .collect())
    }

    /// Facts touching entities named in the query, plus facts reachable from them
    async fn from_graph(&self, query: &str, config: &RetrievalConfig) -> Result<Vec<Candidate>> {
        let entities = self.semantic.find_mentioned_entities(query).await;
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Query mentions entities: {:?}", entities);

        let mut best: HashMap<Uuid, (SemanticFact, f32)> = HashMap::new();
        let mut keep = |fact: SemanticFact, score: f32| {
            let slot = best.entry(fact.id).or_insert((fact, score));
            slot.1 = slot.1.max(score);
        };

        for entity in &entities {
            for fact in self.semantic.query_current(Some(entity.as_str()), None).await {
                if fact.confidence >= config.semantic_min_confidence {
                    let score = fact.confidence;
                    keep(fact, score);
                }
            }

            let traversal = TraversalQuery::new(entity.clone(), config.semantic_max_hops)
                .min_confidence(config.semantic_min_confidence);
            for path in self.semantic.traverse(&traversal).await? {
                // A path scores the product of its confidences
                let score = path.iter().map(|f| f.confidence).product::<f32>();
                if let Some(last) = path.into_iter().last() {
                    keep(last, score);
                }
            }
        }

        Ok(best
            .into_values()
            .map(|(fact, score)| {
                Candidate::new(
                    fact.describe(),
                    CandidateSource::Semantic,
                    config.semantic_weight * score,
                )
                .with_timestamp(fact.event_time_start)
                .with_confidence(fact.confidence)
            })
            .collect())
    }

    async fn from_rules(&self, query: &str, config: &RetrievalConfig) -> Result<Vec<Candidate>> {
        let matches = self
            .procedural
            .match_rules(
                query,
                config.procedural_min_confidence,
                config.procedural_limit,
            )
            .await?;
        Ok(matches
            .into_iter()
            .map(|m| {
                let mut candidate = Candidate::new(
                    m.rule.describe(),
                    CandidateSource::Procedural,
                    config.procedural_weight * m.similarity,
                )
                .with_confidence(m.rule.confidence);
                candidate.timestamp = m.rule.last_used;
                candidate
            })
            .collect())
    }
}

/// Drop duplicate contents (keeping the best score), order best first and cap
fn merge_candidates(candidates: Vec<Candidate>, max: usize) -> Vec<Candidate> {
    let mut by_content: HashMap<String, Candidate> = HashMap::new();
    for candidate in candidates {
        match by_content.get(&candidate.content) {
            Some(existing) if existing.initial_score >= candidate.initial_score => {}
            _ => {
                by_content.insert(candidate.content.clone(), candidate);
            }
        }
    }

    let mut merged: Vec<Candidate> = by_content.into_values().collect();
    merged.sort_by(|a, b| {
        b.initial_score
            .partial_cmp(&a.initial_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.source.cmp(&b.source))
            .then(a.content.cmp(&b.content))
    });
    merged.truncate(max);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EpisodicConfig, ProceduralConfig};
    use crate::episodic::{LinearBackend, Role};
    use crate::procedural::ProceduralRule;
    use crate::testing::{FailingEmbedder, HashingEmbedder, ManualClock};

    struct Fixture {
        retriever: Retriever,
        episodic: Arc<EpisodicStore>,
        semantic: Arc<SemanticGraphStore>,
        procedural: Arc<ProceduralStore>,
    }

    fn fixture(embedder: Arc<dyn crate::ports::EmbeddingPort>) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let episodic = Arc::new(EpisodicStore::new(
            Arc::new(LinearBackend::new()),
            embedder.clone(),
            clock.clone(),
            EpisodicConfig::default(),
        ));
        let semantic = Arc::new(SemanticGraphStore::new(clock.clone()));
        let procedural = Arc::new(ProceduralStore::new(
            embedder,
            clock,
            ProceduralConfig::default(),
        ));
        Fixture {
            retriever: Retriever::new(
                episodic.clone(),
                semantic.clone(),
                procedural.clone(),
                RetrievalConfig::default(),
            ),
            episodic,
            semantic,
            procedural,
        }
    }

    #[tokio::test]
    async fn test_rejects_empty_query() {
        let f = fixture(Arc::new(HashingEmbedder::default()));
        assert!(matches!(
            f.retriever.retrieve("  ", None, &RetrievalConfig::default()).await,
            Err(MemoryError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_all_three_sources_contribute() {
        let f = fixture(Arc::new(HashingEmbedder::default()));
        f.episodic
            .record("s1", Role::User, "I am learning Rust ownership")
            .await
            .unwrap();
        f.semantic.ensure_entity("Rust", "language").await.unwrap();
        f.semantic.ensure_entity("memory safety", "concept").await.unwrap();
        f.semantic
            .assert_fact("Rust", "guarantees", "memory safety", 0.9)
            .await
            .unwrap();
        f.procedural
            .add_rule(ProceduralRule::new("r1", "learning Rust ownership", "suggest the book", 0.8))
            .await
            .unwrap();

        let result = f
            .retriever
            .retrieve("learning Rust ownership", Some("s1"), f.retriever.config())
            .await
            .unwrap();
        assert!(!result.is_degraded());
        assert_eq!(result.strategy, RetrievalStrategy::Hybrid);

        let sources: Vec<CandidateSource> = result.candidates.iter().map(|c| c.source).collect();
        assert!(sources.contains(&CandidateSource::Episodic));
        assert!(sources.contains(&CandidateSource::Semantic));
        assert!(sources.contains(&CandidateSource::Procedural));
        assert!(
            result
                .candidates
                .iter()
                .any(|c| c.content == "Rust guarantees memory safety")
        );
    }

    #[tokio::test]
    async fn test_failing_source_is_degraded_not_fatal() {
        let f = fixture(Arc::new(HashingEmbedder::default()));
        let config = RetrievalConfig {
            procedural_min_confidence: 2.0,
            ..Default::default()
        };
        f.episodic
            .record("s1", Role::User, "Rust ownership")
            .await
            .unwrap();

        let result = f.retriever.retrieve("Rust ownership", None, &config).await.unwrap();
        assert_eq!(result.degraded_sources, vec![CandidateSource::Procedural]);
        assert_eq!(result.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_embedding_outage_still_returns_graph_facts() {
        let f = fixture(Arc::new(FailingEmbedder::default()));
        f.semantic.ensure_entity("Paris", "city").await.unwrap();
        f.semantic.ensure_entity("France", "country").await.unwrap();
        f.semantic
            .assert_fact("Paris", "capital_of", "France", 0.95)
            .await
            .unwrap();

        let result = f
            .retriever
            .retrieve("tell me about Paris", None, f.retriever.config())
            .await
            .unwrap();
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].content, "Paris capital_of France");
    }

    #[tokio::test]
    async fn test_strategy_limits_sources() {
        let f = fixture(Arc::new(HashingEmbedder::default()));
        f.episodic
            .record("s1", Role::User, "I am learning Rust ownership")
            .await
            .unwrap();
        f.semantic.ensure_entity("Rust", "language").await.unwrap();
        f.semantic.ensure_entity("memory safety", "concept").await.unwrap();
        f.semantic
            .assert_fact("Rust", "guarantees", "memory safety", 0.9)
            .await
            .unwrap();
        f.procedural
            .add_rule(ProceduralRule::new("r1", "learning Rust ownership", "suggest the book", 0.8))
            .await
            .unwrap();

        for (strategy, expected) in [
            (RetrievalStrategy::Episodic, vec![CandidateSource::Episodic]),
            (RetrievalStrategy::Semantic, vec![CandidateSource::Semantic]),
        ] {
            let config = RetrievalConfig {
                strategy,
                ..Default::default()
            };
            let result = f
                .retriever
                .retrieve("learning Rust ownership", Some("s1"), &config)
                .await
                .unwrap();
            let mut sources: Vec<CandidateSource> =
                result.candidates.iter().map(|c| c.source).collect();
            sources.dedup();
            assert_eq!(sources, expected, "{strategy}");
            assert_eq!(result.strategy, strategy);
        }
    }

    #[tokio::test]
    async fn test_semantic_strategy_survives_embedding_outage() {
        let f = fixture(Arc::new(FailingEmbedder::default()));
        f.semantic.ensure_entity("Paris", "city").await.unwrap();
        f.semantic.ensure_entity("France", "country").await.unwrap();
        f.semantic
            .assert_fact("Paris", "capital_of", "France", 0.95)
            .await
            .unwrap();
        let config = RetrievalConfig {
            strategy: RetrievalStrategy::Semantic,
            ..Default::default()
        };

        // Episodic and procedural lookups would need embeddings; they are not consulted
        let result = f.retriever.retrieve("about Paris", None, &config).await.unwrap();
        assert!(!result.is_degraded());
        assert_eq!(result.candidates.len(), 1);
    }

    #[test]
    fn test_merge_dedups_and_caps() {
        let merged = merge_candidates(
            vec![
                Candidate::new("a", CandidateSource::Episodic, 0.2),
                Candidate::new("a", CandidateSource::Episodic, 0.7),
                Candidate::new("b", CandidateSource::Semantic, 0.5),
                Candidate::new("c", CandidateSource::Procedural, 0.1),
            ],
            2,
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].content, "a");
        assert!((merged[0].initial_score - 0.7).abs() < 1e-6);
        assert_eq!(merged[1].content, "b");
    }
}
