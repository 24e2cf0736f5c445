use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::context::reranker::RerankerKind;
use crate::error::{MemoryError, Result};

/// Main configuration structure for Recollect
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Storage configuration (data directory, episodic backend)
    #[serde(default)]
    pub storage: StorageConfig,
    /// Episodic scoring configuration
    #[serde(default)]
    pub episodic: EpisodicConfig,
    /// HNSW index tuning
    #[serde(default)]
    pub hnsw: HnswConfig,
    /// Embedding model configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Remote generation endpoint configuration
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Consolidation engine and daemon configuration
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    /// Procedural rule matching configuration
    #[serde(default)]
    pub procedural: ProceduralConfig,
    /// Retrieval fan-out configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Reranker configuration
    #[serde(default)]
    pub reranker: RerankerConfig,
    /// Compression configuration
    #[serde(default)]
    pub compression: CompressionConfig,
    /// End-to-end pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Parse a configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| MemoryError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break scoring or scheduling invariants
    pub fn validate(&self) -> Result<()> {
        let unit_fields = [
            ("consolidation.min_confidence", self.consolidation.min_confidence),
            ("retrieval.semantic_min_confidence", self.retrieval.semantic_min_confidence),
            ("retrieval.min_relevance", self.retrieval.min_relevance),
            ("procedural.min_similarity", self.procedural.min_similarity),
            ("procedural.reinforcement", self.procedural.reinforcement),
            ("reranker.threshold", self.reranker.threshold),
            ("episodic.min_relevance", self.episodic.min_relevance),
        ];
        for (name, value) in unit_fields {
            if !(0.0..=1.0).contains(&value) {
                return Err(MemoryError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        if self.consolidation.batch_size == 0 {
            return Err(MemoryError::Config(
                "consolidation.batch_size must be at least 1".to_string(),
            ));
        }

        if self.consolidation.interval_secs == 0
            || self.consolidation.fast_interval_secs == 0
            || self.consolidation.slow_interval_secs == 0
        {
            return Err(MemoryError::Config(
                "consolidation intervals must be non-zero".to_string(),
            ));
        }

        if self.retrieval.semantic_max_hops == 0 {
            return Err(MemoryError::Config(
                "retrieval.semantic_max_hops must be at least 1".to_string(),
            ));
        }

        if self.reranker.backends.is_empty() {
            return Err(MemoryError::Config(
                "reranker.backends must name at least one backend".to_string(),
            ));
        }

        if self.embedding.dimension == 0 {
            return Err(MemoryError::Config(
                "embedding.dimension must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Which episodic backend to run behind the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Linear scan over all entries
    Linear,
    /// Approximate nearest-neighbour index
    #[default]
    Hnsw,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory for snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Episodic search backend
    #[serde(default)]
    pub episodic_backend: BackendKind,
    /// Persistence key the graph snapshot is written under
    #[serde(default = "default_snapshot_key")]
    pub snapshot_key: String,
    /// Persistence key for the episodic log
    #[serde(default = "default_episodic_snapshot_key")]
    pub episodic_snapshot_key: String,
    /// Persistence key for procedural rules
    #[serde(default = "default_procedural_snapshot_key")]
    pub procedural_snapshot_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            episodic_backend: BackendKind::default(),
            snapshot_key: default_snapshot_key(),
            episodic_snapshot_key: default_episodic_snapshot_key(),
            procedural_snapshot_key: default_procedural_snapshot_key(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".recollect"))
        .unwrap_or_else(|| PathBuf::from(".recollect"))
}

fn default_snapshot_key() -> String {
    "semantic-graph".to_string()
}

fn default_episodic_snapshot_key() -> String {
    "episodic-log".to_string()
}

fn default_procedural_snapshot_key() -> String {
    "procedural-rules".to_string()
}

/// Episodic search scoring parameters
///
/// `final = relevance * (1 + recency_weight * recency + frequency_weight * frequency)`
/// where `recency = exp(-decay_rate * age_days)`.
#[derive(Debug, Clone, Deserialize)]
pub struct EpisodicConfig {
    /// Weight of the recency term (lambda)
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f32,
    /// Weight of the frequency term (mu)
    #[serde(default = "default_frequency_weight")]
    pub frequency_weight: f32,
    /// Exponential decay rate per day
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f32,
    /// Width of the same-session frequency window in hours
    #[serde(default = "default_frequency_window_hours")]
    pub frequency_window_hours: i64,
    /// Result limit when a query does not set one
    #[serde(default = "default_episodic_limit")]
    pub default_limit: usize,
    /// Minimum relevance when a query does not set one
    #[serde(default)]
    pub min_relevance: f32,
}

impl Default for EpisodicConfig {
    fn default() -> Self {
        Self {
            recency_weight: default_recency_weight(),
            frequency_weight: default_frequency_weight(),
            decay_rate: default_decay_rate(),
            frequency_window_hours: default_frequency_window_hours(),
            default_limit: default_episodic_limit(),
            min_relevance: 0.0,
        }
    }
}

fn default_recency_weight() -> f32 {
    0.3
}

fn default_frequency_weight() -> f32 {
    0.1
}

fn default_decay_rate() -> f32 {
    0.1
}

fn default_frequency_window_hours() -> i64 {
    24
}

fn default_episodic_limit() -> usize {
    10
}

/// HNSW index tuning
#[derive(Debug, Clone, Deserialize)]
pub struct HnswConfig {
    /// Graph connectivity (higher = better recall, more memory)
    #[serde(default = "default_connectivity")]
    pub connectivity: usize,
    /// Expansion factor while inserting
    #[serde(default = "default_expansion_add")]
    pub expansion_add: usize,
    /// Expansion factor while searching
    #[serde(default = "default_expansion_search")]
    pub expansion_search: usize,
    /// Over-fetch multiplier applied before filtering
    #[serde(default = "default_oversample")]
    pub oversample: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            connectivity: default_connectivity(),
            expansion_add: default_expansion_add(),
            expansion_search: default_expansion_search(),
            oversample: default_oversample(),
        }
    }
}

fn default_connectivity() -> usize {
    16
}

fn default_expansion_add() -> usize {
    128
}

fn default_expansion_search() -> usize {
    64
}

fn default_oversample() -> usize {
    3
}

/// Embedding model configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding dimension size
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: default_embedding_dimension(),
        }
    }
}

fn default_embedding_dimension() -> usize {
    384
}

/// OpenAI-compatible generation endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    /// API endpoint URL
    #[serde(default)]
    pub api_url: String,
    /// Environment variable name for API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model identifier for the remote API
    #[serde(default = "default_generation_model")]
    pub model: String,
    /// Request timeout in seconds
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key_env: default_api_key_env(),
            model: default_generation_model(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "RECOLLECT_API_KEY".to_string()
}

fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_generation_timeout_secs() -> u64 {
    30
}

/// Consolidation engine and daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConsolidationConfig {
    /// Run the background daemon
    #[serde(default = "default_consolidation_enabled")]
    pub enabled: bool,
    /// Normal tick interval in seconds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Interval used when the queue is deep
    #[serde(default = "default_fast_interval_secs")]
    pub fast_interval_secs: u64,
    /// Interval used when the queue is shallow
    #[serde(default = "default_slow_interval_secs")]
    pub slow_interval_secs: u64,
    /// Episodic entries per pass (also the background trigger threshold)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Model name passed to the generation capability
    #[serde(default = "default_generation_model")]
    pub model: String,
    /// Sampling temperature (low for deterministic-leaning output)
    #[serde(default)]
    pub temperature: f32,
    /// Max tokens for the consolidation response
    #[serde(default = "default_consolidation_max_tokens")]
    pub max_tokens: u32,
    /// Operations below this confidence are skipped
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Maximum current facts listed in the prompt
    #[serde(default = "default_max_prompt_facts")]
    pub max_prompt_facts: usize,
    /// Fall back to pattern extraction when generation is unavailable
    #[serde(default = "default_extraction_fallback")]
    pub extraction_fallback: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: default_consolidation_enabled(),
            interval_secs: default_interval_secs(),
            fast_interval_secs: default_fast_interval_secs(),
            slow_interval_secs: default_slow_interval_secs(),
            batch_size: default_batch_size(),
            model: default_generation_model(),
            temperature: 0.0,
            max_tokens: default_consolidation_max_tokens(),
            min_confidence: default_min_confidence(),
            max_prompt_facts: default_max_prompt_facts(),
            extraction_fallback: default_extraction_fallback(),
        }
    }
}

fn default_consolidation_enabled() -> bool {
    true
}

fn default_extraction_fallback() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    300
}

fn default_fast_interval_secs() -> u64 {
    30
}

fn default_slow_interval_secs() -> u64 {
    1800
}

fn default_batch_size() -> usize {
    10
}

fn default_consolidation_max_tokens() -> u32 {
    1024
}

fn default_min_confidence() -> f32 {
    0.5
}

fn default_max_prompt_facts() -> usize {
    50
}

/// Procedural rule matching configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProceduralConfig {
    /// Minimum condition similarity for a rule to match
    #[serde(default = "default_procedural_min_similarity")]
    pub min_similarity: f32,
    /// Confidence added to a rule each time it matches
    #[serde(default = "default_reinforcement")]
    pub reinforcement: f32,
}

impl Default for ProceduralConfig {
    fn default() -> Self {
        Self {
            min_similarity: default_procedural_min_similarity(),
            reinforcement: default_reinforcement(),
        }
    }
}

fn default_procedural_min_similarity() -> f32 {
    0.3
}

fn default_reinforcement() -> f32 {
    0.01
}

/// Which memory sources a retrieval consults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalStrategy {
    /// Conversation history only
    Episodic,
    /// Knowledge graph only
    Semantic,
    /// Conversation history, knowledge graph and rules
    #[default]
    Hybrid,
}

impl RetrievalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn uses_episodic(&self) -> bool {
        matches!(self, Self::Episodic | Self::Hybrid)
    }

    pub fn uses_semantic(&self) -> bool {
        matches!(self, Self::Semantic | Self::Hybrid)
    }

    pub fn uses_procedural(&self) -> bool {
        matches!(self, Self::Hybrid)
    }
}

impl fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalStrategy {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "episodic" => Ok(Self::Episodic),
            "semantic" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(MemoryError::Config(format!(
                "Unknown strategy '{other}'. Valid: episodic, semantic, hybrid"
            ))),
        }
    }
}

/// Retrieval fan-out configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    /// Sources to consult
    #[serde(default)]
    pub strategy: RetrievalStrategy,
    /// Episodic hits to fetch
    #[serde(default = "default_episodic_top_k")]
    pub episodic_top_k: usize,
    /// Minimum episodic relevance
    #[serde(default = "default_retrieval_min_relevance")]
    pub min_relevance: f32,
    /// Apply recency/frequency boosting to episodic hits
    #[serde(default = "default_temporal_boost")]
    pub temporal_boost: bool,
    /// Traversal depth from entities mentioned in the query
    #[serde(default = "default_semantic_max_hops")]
    pub semantic_max_hops: usize,
    /// Minimum fact confidence during traversal
    #[serde(default = "default_semantic_min_confidence")]
    pub semantic_min_confidence: f32,
    /// Procedural rules to fetch
    #[serde(default = "default_procedural_limit")]
    pub procedural_limit: usize,
    /// Minimum rule confidence
    #[serde(default = "default_semantic_min_confidence")]
    pub procedural_min_confidence: f32,
    /// Score multiplier for episodic candidates
    #[serde(default = "default_episodic_weight")]
    pub episodic_weight: f32,
    /// Score multiplier for semantic candidates
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f32,
    /// Score multiplier for procedural candidates
    #[serde(default = "default_procedural_weight")]
    pub procedural_weight: f32,
    /// Cap on the merged candidate list
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            strategy: RetrievalStrategy::default(),
            episodic_top_k: default_episodic_top_k(),
            min_relevance: default_retrieval_min_relevance(),
            temporal_boost: default_temporal_boost(),
            semantic_max_hops: default_semantic_max_hops(),
            semantic_min_confidence: default_semantic_min_confidence(),
            procedural_limit: default_procedural_limit(),
            procedural_min_confidence: default_semantic_min_confidence(),
            episodic_weight: default_episodic_weight(),
            semantic_weight: default_semantic_weight(),
            procedural_weight: default_procedural_weight(),
            max_candidates: default_max_candidates(),
        }
    }
}

fn default_episodic_top_k() -> usize {
    10
}

fn default_retrieval_min_relevance() -> f32 {
    0.1
}

fn default_temporal_boost() -> bool {
    true
}

fn default_semantic_max_hops() -> usize {
    2
}

fn default_semantic_min_confidence() -> f32 {
    0.3
}

fn default_procedural_limit() -> usize {
    5
}

fn default_episodic_weight() -> f32 {
    1.0
}

fn default_semantic_weight() -> f32 {
    0.9
}

fn default_procedural_weight() -> f32 {
    0.8
}

fn default_max_candidates() -> usize {
    50
}

/// Reranker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RerankerConfig {
    /// Fallback chain, tried in order
    #[serde(default = "default_reranker_backends")]
    pub backends: Vec<RerankerKind>,
    /// Time-to-live for cached score sets
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Number of cached score sets
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Results kept after reranking
    #[serde(default = "default_rerank_top_k")]
    pub top_k: usize,
    /// Results scoring below this are dropped
    #[serde(default)]
    pub threshold: f32,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            backends: default_reranker_backends(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
            top_k: default_rerank_top_k(),
            threshold: 0.0,
        }
    }
}

fn default_reranker_backends() -> Vec<RerankerKind> {
    vec![
        RerankerKind::CrossEncoder,
        RerankerKind::Embedding,
        RerankerKind::Lexical,
    ]
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_cache_capacity() -> usize {
    256
}

fn default_rerank_top_k() -> usize {
    10
}

/// How candidate text is shrunk to fit a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionStrategy {
    /// Sentence-importance ranking only
    Extractive,
    /// Generation-based summarisation only
    Generative,
    /// Extractive first, generative if still over budget
    #[default]
    Hybrid,
}

/// Compression configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    /// Compression strategy
    #[serde(default)]
    pub strategy: CompressionStrategy,
    /// Temperature for generative summaries
    #[serde(default = "default_summary_temperature")]
    pub temperature: f32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            strategy: CompressionStrategy::default(),
            temperature: default_summary_temperature(),
        }
    }
}

fn default_summary_temperature() -> f32 {
    0.2
}

/// End-to-end pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Default deadline for `optimize`, in milliseconds
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Annotate assembled entries with their scores
    #[serde(default = "default_include_confidence")]
    pub include_confidence: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deadline_ms: None,
            include_confidence: default_include_confidence(),
        }
    }
}

fn default_include_confidence() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.storage.episodic_backend, BackendKind::Hnsw);
        assert_eq!(config.storage.snapshot_key, "semantic-graph");
        assert_eq!(config.storage.episodic_snapshot_key, "episodic-log");
        assert_eq!(config.retrieval.strategy, RetrievalStrategy::Hybrid);
        assert!(config.consolidation.extraction_fallback);
        assert!((config.episodic.recency_weight - 0.3).abs() < f32::EPSILON);
        assert_eq!(config.episodic.frequency_window_hours, 24);
        assert_eq!(config.hnsw.connectivity, 16);
        assert_eq!(config.embedding.dimension, 384);
        assert_eq!(config.consolidation.batch_size, 10);
        assert_eq!(config.consolidation.interval_secs, 300);
        assert_eq!(config.retrieval.semantic_max_hops, 2);
        assert_eq!(config.reranker.backends.len(), 3);
        assert_eq!(config.compression.strategy, CompressionStrategy::Hybrid);
        assert!(config.pipeline.deadline_ms.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[storage]
data_dir = "/tmp/recollect"
episodic_backend = "linear"

[episodic]
recency_weight = 0.5
decay_rate = 0.2

[consolidation]
interval_secs = 60
batch_size = 25
model = "llama3.2"
min_confidence = 0.7

[generation]
api_url = "http://localhost:11434/v1"
api_key_env = "OLLAMA_KEY"

[reranker]
backends = ["embedding", "lexical"]
threshold = 0.4

[compression]
strategy = "extractive"

[pipeline]
deadline_ms = 250
"#;

        let config = Config::from_toml_str(toml_str).expect("Failed to parse TOML");

        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/recollect"));
        assert_eq!(config.storage.episodic_backend, BackendKind::Linear);
        assert!((config.episodic.recency_weight - 0.5).abs() < f32::EPSILON);
        assert!((config.episodic.decay_rate - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.consolidation.interval_secs, 60);
        assert_eq!(config.consolidation.batch_size, 25);
        assert_eq!(config.consolidation.model, "llama3.2");
        assert_eq!(config.generation.api_url, "http://localhost:11434/v1");
        assert_eq!(config.generation.api_key_env, "OLLAMA_KEY");
        assert_eq!(
            config.reranker.backends,
            vec![RerankerKind::Embedding, RerankerKind::Lexical]
        );
        assert_eq!(config.compression.strategy, CompressionStrategy::Extractive);
        assert_eq!(config.pipeline.deadline_ms, Some(250));
    }

    #[test]
    fn test_toml_partial_deserialization() {
        let toml_str = r#"
[retrieval]
episodic_top_k = 20
strategy = "semantic"
"#;

        let config = Config::from_toml_str(toml_str).expect("Failed to parse partial TOML");

        assert_eq!(config.retrieval.episodic_top_k, 20);
        assert_eq!(config.retrieval.strategy, RetrievalStrategy::Semantic);
        assert_eq!(config.retrieval.procedural_limit, 5);
        assert_eq!(config.consolidation.batch_size, 10);
        assert_eq!(config.generation.api_key_env, "RECOLLECT_API_KEY");
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = Config::from_toml_str("").expect("empty config should parse");
        assert_eq!(config.episodic.default_limit, 10);
    }

    #[test]
    fn test_validate_rejects_out_of_range_confidence() {
        let toml_str = r#"
[consolidation]
min_confidence = 1.5
"#;
        let err = Config::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("consolidation.min_confidence"));
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let mut config = Config::default();
        config.consolidation.batch_size = 0;
        assert!(matches!(config.validate(), Err(MemoryError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_reranker_chain() {
        let mut config = Config::default();
        config.reranker.backends.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("Episodic".parse::<RetrievalStrategy>().unwrap(), RetrievalStrategy::Episodic);
        assert_eq!(" hybrid ".parse::<RetrievalStrategy>().unwrap(), RetrievalStrategy::Hybrid);
        let err = "graph".parse::<RetrievalStrategy>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: Unknown strategy 'graph'. Valid: episodic, semantic, hybrid"
        );
        assert_eq!(RetrievalStrategy::Semantic.to_string(), "semantic");
    }

    #[test]
    fn test_unknown_backend_fails_to_parse() {
        let toml_str = r#"
[storage]
episodic_backend = "faiss"
"#;
        assert!(Config::from_toml_str(toml_str).is_err());
    }
}
