//! MemoryManager - one handle over every store, the consolidation engine
//! and the context pipeline
//!
//! Bindings, the CLI and templates call into this type; it owns the shared
//! `Arc`s and wires collaborators (embedder, generator, persistence, clock)
//! into each component.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::config::{Config, RetrievalConfig};
use crate::consolidation::{
    ConsolidationDaemon, ConsolidationEngine, ConsolidationMode, ConsolidationReport, MetricsSnapshot,
};
use crate::context::{
    AssembledContext, Candidate, CompressionResult, Compressor, ContextPipeline, OptimizeOptions,
    OptimizedContext, Reranker, RetrievalResult, Retriever,
};
use crate::episodic::{EpisodicEntry, EpisodicHit, EpisodicQuery, EpisodicStore, Role, build_backend};
use crate::error::{MemoryError, Result};
use crate::ports::{Clock, EmbeddingPort, GenerationPort, StatePersistencePort, SystemClock};
use crate::procedural::{ProceduralRule, ProceduralStore, RuleMatch};
use crate::semantic::{
    Entity, FactPath, FactQuery, FactUpdate, SemanticFact, SemanticGraphStore, TraversalQuery,
};

/// Collaborators a [`MemoryManager`] is built from
pub struct Collaborators {
    pub embedder: Arc<dyn EmbeddingPort>,
    pub generator: Arc<dyn GenerationPort>,
    pub persistence: Arc<dyn StatePersistencePort>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Use the system clock
    pub fn new(
        embedder: Arc<dyn EmbeddingPort>,
        generator: Arc<dyn GenerationPort>,
        persistence: Arc<dyn StatePersistencePort>,
    ) -> Self {
        Self {
            embedder,
            generator,
            persistence,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct MemoryManager {
    config: Config,
    episodic: Arc<EpisodicStore>,
    semantic: Arc<SemanticGraphStore>,
    procedural: Arc<ProceduralStore>,
    engine: Arc<ConsolidationEngine>,
    daemon: ConsolidationDaemon,
    pipeline: ContextPipeline,
    persistence: Arc<dyn StatePersistencePort>,
}

impl MemoryManager {
    pub fn new(config: Config, parts: Collaborators) -> Result<Self> {
        config.validate()?;
        if parts.embedder.dimensions() != config.embedding.dimension {
            return Err(MemoryError::Config(format!(
                "embedder '{}' produces {} dimensions, config expects {}",
                parts.embedder.name(),
                parts.embedder.dimensions(),
                config.embedding.dimension
            )));
        }

        let backend = build_backend(
            config.storage.episodic_backend,
            config.embedding.dimension,
            &config.hnsw,
        )?;
        let episodic = Arc::new(EpisodicStore::new(
            backend,
            parts.embedder.clone(),
            parts.clock.clone(),
            config.episodic.clone(),
        ));
        let semantic = Arc::new(SemanticGraphStore::new(parts.clock.clone()));
        let procedural = Arc::new(ProceduralStore::new(
            parts.embedder.clone(),
            parts.clock.clone(),
            config.procedural.clone(),
        ));

        let engine = Arc::new(ConsolidationEngine::new(
            episodic.clone(),
            semantic.clone(),
            parts.generator.clone(),
            config.consolidation.clone(),
        ));
        let daemon = ConsolidationDaemon::new(engine.clone());

        let pipeline = ContextPipeline::new(
            Retriever::new(
                episodic.clone(),
                semantic.clone(),
                procedural.clone(),
                config.retrieval.clone(),
            ),
            Reranker::new(config.reranker.clone(), parts.embedder.clone()),
            Compressor::new(Some(parts.generator.clone()), config.compression.clone()),
            config.pipeline.clone(),
        );

        info!(
            "Memory manager ready: episodic backend={}, embedder={}, generator={}",
            episodic.backend_name(),
            parts.embedder.name(),
            parts.generator.name()
        );

        Ok(Self {
            config,
            episodic,
            semantic,
            procedural,
            engine,
            daemon,
            pipeline,
            persistence: parts.persistence,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn episodic(&self) -> &Arc<EpisodicStore> {
        &self.episodic
    }

    pub fn semantic(&self) -> &Arc<SemanticGraphStore> {
        &self.semantic
    }

    pub fn procedural(&self) -> &Arc<ProceduralStore> {
        &self.procedural
    }

    pub fn pipeline(&self) -> &ContextPipeline {
        &self.pipeline
    }

    // Episodic

    pub async fn add_episodic(&self, session_id: &str, role: Role, content: &str) -> Result<Uuid> {
        self.episodic.record(session_id, role, content).await
    }

    pub async fn add_episodic_entry(&self, entry: EpisodicEntry) -> Result<Uuid> {
        self.episodic.add(entry).await
    }

    pub async fn search_episodic(&self, query: &EpisodicQuery) -> Result<Vec<EpisodicHit>> {
        self.episodic.search(query).await
    }

    pub fn mark_processed(&self, ids: &[Uuid]) -> usize {
        self.episodic.mark_processed(ids)
    }

    pub fn export_episodic(&self, session_id: Option<&str>) -> Vec<EpisodicEntry> {
        self.episodic.export(session_id)
    }

    pub fn apply_retention(&self, before: DateTime<Utc>) -> Result<usize> {
        self.episodic.apply_retention(before)
    }

    // Semantic

    pub async fn add_entity(&self, entity: Entity) -> Result<String> {
        self.semantic.add_entity(entity).await
    }

    pub async fn add_fact(&self, fact: SemanticFact) -> Result<Uuid> {
        self.semantic.add_fact(fact).await
    }

    /// Facts touching `entity`, optionally narrowed by relationship and a
    /// point in time. `include_history` returns every version instead.
    pub async fn query_facts(
        &self,
        entity: Option<&str>,
        relationship: Option<&str>,
        as_of: Option<DateTime<Utc>>,
        include_history: bool,
    ) -> Vec<SemanticFact> {
        let query = FactQuery {
            entity: entity.map(str::to_string),
            relationship: relationship.map(str::to_string),
            as_of,
            include_history,
            known_at: None,
        };
        self.semantic.query_facts(&query).await
    }

    pub async fn traverse(&self, query: &TraversalQuery) -> Result<Vec<FactPath>> {
        self.semantic.traverse(query).await
    }

    pub async fn update_fact(&self, id: &Uuid, update: FactUpdate) -> Result<Uuid> {
        self.semantic.update_fact(id, update).await
    }

    pub async fn delete_fact(&self, id: &Uuid) -> Result<bool> {
        self.semantic.delete_fact(id, None).await
    }

    // Procedural

    pub async fn add_rule(&self, rule: ProceduralRule) -> Result<()> {
        self.procedural.add_rule(rule).await
    }

    pub async fn match_rules(&self, context: &str, min_confidence: f32, limit: usize) -> Result<Vec<RuleMatch>> {
        self.procedural
            .match_rules(context, min_confidence, limit)
            .await
    }

    // Consolidation

    pub async fn consolidate(&self, session_id: &str, mode: ConsolidationMode) -> Result<ConsolidationReport> {
        self.engine.consolidate(session_id, mode).await
    }

    pub fn configure_consolidation(
        &self,
        interval: Option<Duration>,
        batch_size: Option<usize>,
        model: Option<String>,
    ) -> Result<()> {
        self.engine.configure(interval, batch_size, model)
    }

    pub fn start_daemon(&self) -> Result<()> {
        self.daemon.start()
    }

    pub async fn stop_daemon(&self) {
        self.daemon.stop().await
    }

    pub fn daemon_running(&self) -> bool {
        self.daemon.is_running()
    }

    pub fn daemon_metrics(&self) -> MetricsSnapshot {
        self.daemon.metrics()
    }

    // Context

    /// Retrieve candidates; `config` overrides the configured retrieval settings
    pub async fn retrieve(
        &self,
        query: &str,
        session_id: Option<&str>,
        config: Option<&RetrievalConfig>,
    ) -> Result<RetrievalResult> {
        self.pipeline.retrieve(query, session_id, config).await
    }

    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<Candidate>,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<Candidate>> {
        self.pipeline.rerank(query, candidates, top_k, threshold).await
    }

    pub async fn compress(&self, candidates: &[Candidate], target_tokens: usize) -> Result<CompressionResult> {
        self.pipeline.compress(candidates, target_tokens).await
    }

    pub fn assemble(
        &self,
        candidates: &[Candidate],
        query: &str,
        include_confidence: bool,
        token_budget: usize,
    ) -> Result<AssembledContext> {
        self.pipeline
            .assemble(candidates, query, include_confidence, token_budget)
    }

    pub async fn optimize(&self, query: &str, session_id: Option<&str>, budget: usize) -> Result<OptimizedContext> {
        self.pipeline.optimize(query, session_id, budget).await
    }

    pub async fn optimize_with(
        &self,
        query: &str,
        session_id: Option<&str>,
        budget: usize,
        options: &OptimizeOptions,
    ) -> Result<OptimizedContext> {
        self.pipeline
            .optimize_with(query, session_id, budget, options)
            .await
    }

    // Persistence

    /// Save the graph, the episodic log and the rules under their
    /// configured snapshot keys
    pub async fn save_snapshot(&self) -> Result<()> {
        let storage = &self.config.storage;
        let persistence = self.persistence.as_ref();
        self.semantic
            .snapshot(persistence, &storage.snapshot_key)
            .await?;
        self.episodic
            .snapshot(persistence, &storage.episodic_snapshot_key)
            .await?;
        self.procedural
            .snapshot(persistence, &storage.procedural_snapshot_key)
            .await
    }

    /// Load whichever snapshots exist. Returns true if any was found.
    pub async fn restore_snapshot(&self) -> Result<bool> {
        let storage = &self.config.storage;
        let persistence = self.persistence.as_ref();
        let graph = self
            .semantic
            .restore(persistence, &storage.snapshot_key)
            .await?;
        let episodic = self
            .episodic
            .restore(persistence, &storage.episodic_snapshot_key)
            .await?;
        let procedural = self
            .procedural
            .restore(persistence, &storage.procedural_snapshot_key)
            .await?;
        Ok(graph || episodic || procedural)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::ports::InMemoryPersistence;
    use crate::testing::{HashingEmbedder, ManualClock, ScriptedGenerator};

    fn linear_config() -> Config {
        let mut config = Config::default();
        config.storage.episodic_backend = BackendKind::Linear;
        config
    }

    fn manager(persistence: Arc<dyn StatePersistencePort>) -> (MemoryManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let m = MemoryManager::new(
            linear_config(),
            Collaborators::new(
                Arc::new(HashingEmbedder::default()),
                Arc::new(ScriptedGenerator::new()),
                persistence,
            )
            .with_clock(clock.clone()),
        )
        .unwrap();
        (m, clock)
    }

    #[test]
    fn test_rejects_dimension_mismatch() {
        let result = MemoryManager::new(
            Config::default(),
            Collaborators::new(
                Arc::new(HashingEmbedder::new(16)),
                Arc::new(ScriptedGenerator::new()),
                Arc::new(InMemoryPersistence::new()),
            ),
        );
        assert!(matches!(result, Err(MemoryError::Config(_))));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_through_persistence() {
        let persistence: Arc<dyn StatePersistencePort> = Arc::new(InMemoryPersistence::new());
        let (m, _) = manager(persistence.clone());
        m.semantic().ensure_entity("Rust", "language").await.unwrap();
        m.semantic().ensure_entity("fast", "quality").await.unwrap();
        m.semantic().assert_fact("Rust", "is", "fast", 0.9).await.unwrap();
        m.save_snapshot().await.unwrap();

        let (other, _) = manager(persistence);
        assert!(other.restore_snapshot().await.unwrap());
        assert_eq!(other.semantic().fact_count().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_covers_episodic_and_rules() {
        let persistence: Arc<dyn StatePersistencePort> = Arc::new(InMemoryPersistence::new());
        let (m, _) = manager(persistence.clone());
        let id = m
            .add_episodic("s1", Role::User, "I moved to Lisbon last spring")
            .await
            .unwrap();
        m.mark_processed(&[id]);
        m.add_rule(ProceduralRule::new("r1", "user asks about travel", "mention Lisbon", 0.8))
            .await
            .unwrap();
        m.save_snapshot().await.unwrap();

        let (other, _) = manager(persistence.clone());
        other
            .add_rule(ProceduralRule::new("stale", "anything", "nothing", 0.5))
            .await
            .unwrap();
        assert!(other.restore_snapshot().await.unwrap());

        let entries = other.export_episodic(Some("s1"));
        assert_eq!(entries.len(), 1);
        assert!(entries[0].consolidated);
        let hits = other
            .search_episodic(&EpisodicQuery::text("I moved to Lisbon last spring").limit(1))
            .await
            .unwrap();
        assert_eq!(hits[0].entry.id, id);
        assert!(other.procedural().get_rule("r1").await.is_some());
        assert!(other.procedural().get_rule("stale").await.is_none());

        // Restoring twice does not duplicate entries
        assert!(other.restore_snapshot().await.unwrap());
        assert_eq!(other.export_episodic(None).len(), 1);
    }

    #[tokio::test]
    async fn test_restore_without_snapshots() {
        let (m, _) = manager(Arc::new(InMemoryPersistence::new()));
        assert!(!m.restore_snapshot().await.unwrap());
    }

    #[tokio::test]
    async fn test_query_facts_history_flag() {
        let (m, clock) = manager(Arc::new(InMemoryPersistence::new()));
        m.semantic().ensure_entity("User", "person").await.unwrap();
        m.semantic().ensure_entity("blue", "color").await.unwrap();
        let id = m
            .semantic()
            .assert_fact("User", "favorite_color", "blue", 0.9)
            .await
            .unwrap();

        clock.advance(chrono::Duration::hours(1));
        assert!(m.delete_fact(&id).await.unwrap());
        assert!(m.query_facts(Some("User"), None, None, false).await.is_empty());
        assert_eq!(m.query_facts(Some("User"), None, None, true).await.len(), 1);
    }

    #[tokio::test]
    async fn test_episodic_round_trip() {
        let (m, _) = manager(Arc::new(InMemoryPersistence::new()));
        let id = m
            .add_episodic("s1", Role::User, "I moved to Lisbon last spring")
            .await
            .unwrap();
        let hits = m
            .search_episodic(&EpisodicQuery::text("where do I live?").limit(5).min_relevance(0.0))
            .await
            .unwrap();
        assert!(hits.iter().any(|h| h.entry.id == id));
        assert_eq!(m.mark_processed(&[id]), 1);
        assert_eq!(m.export_episodic(Some("s1")).len(), 1);
    }
}
