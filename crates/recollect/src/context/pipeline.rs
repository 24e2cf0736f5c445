//! retrieve -> rerank -> compress -> assemble
//!
//! [`ContextPipeline::optimize`] runs all four stages under an optional
//! deadline. A stage that runs out of time degrades instead of failing:
//! retrieval yields nothing, reranking keeps retrieval order, compression
//! is skipped and assembly truncates.

use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{PipelineConfig, RetrievalConfig, RetrievalStrategy};
use crate::error::{MemoryError, Result};

use super::assembler::{AssembledContext, Assembler, MIN_TOKEN_BUDGET};
use super::compressor::{CompressionResult, Compressor};
use super::reranker::{Reranker, RerankerKind};
use super::retriever::Retriever;
use super::types::{Candidate, CandidateSource, RetrievalResult};

/// Reserved per candidate for the markup the assembler adds
const PER_ITEM_MARKUP_TOKENS: usize = 8;

/// Milliseconds spent in each stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    pub retrieve_ms: u64,
    pub rerank_ms: u64,
    pub compress_ms: u64,
    pub assemble_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineMetadata {
    pub strategy: RetrievalStrategy,
    pub retrieval_count: usize,
    pub reranked_count: usize,
    pub reranker_backend: Option<RerankerKind>,
    pub original_tokens: usize,
    pub compression_ratio: f32,
    pub final_tokens: usize,
    /// The last included candidate was cut to fit
    pub clipped: bool,
    pub timings: StageTimings,
    /// Retrieval sources that failed
    pub degraded_sources: Vec<CandidateSource>,
    /// Stages skipped or cut short by the deadline
    pub degraded_stages: Vec<String>,
}

/// Per-call overrides for [`ContextPipeline::optimize_with`]
#[derive(Debug, Clone, Default)]
pub struct OptimizeOptions {
    /// Deadline for the whole run; `None` means no deadline
    pub deadline: Option<Duration>,
    /// Retrieval settings; `None` uses the pipeline's own
    pub retrieval: Option<RetrievalConfig>,
}

impl OptimizeOptions {
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn strategy(mut self, strategy: RetrievalStrategy, base: &RetrievalConfig) -> Self {
        let mut retrieval = self.retrieval.take().unwrap_or_else(|| base.clone());
        retrieval.strategy = strategy;
        self.retrieval = Some(retrieval);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizedContext {
    pub context: String,
    pub metadata: PipelineMetadata,
}

pub struct ContextPipeline {
    retriever: Retriever,
    reranker: Reranker,
    compressor: Compressor,
    assembler: Assembler,
    config: PipelineConfig,
}

impl ContextPipeline {
    pub fn new(
        retriever: Retriever,
        reranker: Reranker,
        compressor: Compressor,
        config: PipelineConfig,
    ) -> Self {
        Self {
            retriever,
            reranker,
            compressor,
            assembler: Assembler::new(),
            config,
        }
    }

    pub fn reranker(&self) -> &Reranker {
        &self.reranker
    }

    /// Default retrieval settings
    pub fn retrieval_config(&self) -> &RetrievalConfig {
        self.retriever.config()
    }

    /// Retrieve with `config`, or the default settings when `None`
    pub async fn retrieve(
        &self,
        query: &str,
        session_id: Option<&str>,
        config: Option<&RetrievalConfig>,
    ) -> Result<RetrievalResult> {
        let config = config.unwrap_or_else(|| self.retriever.config());
        self.retriever.retrieve(query, session_id, config).await
    }

    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<Candidate>,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<Candidate>> {
        self.reranker.rerank(query, candidates, top_k, threshold).await
    }

    pub async fn compress(&self, candidates: &[Candidate], target_tokens: usize) -> Result<CompressionResult> {
        self.compressor.compress(candidates, target_tokens).await
    }

    pub fn assemble(
        &self,
        candidates: &[Candidate],
        query: &str,
        include_confidence: bool,
        token_budget: usize,
    ) -> Result<AssembledContext> {
        self.assembler
            .assemble(candidates, query, include_confidence, token_budget)
    }

    /// Run every stage with the configured default deadline
    pub async fn optimize(&self, query: &str, session_id: Option<&str>, budget: usize) -> Result<OptimizedContext> {
        let deadline = self.config.deadline_ms.map(Duration::from_millis);
        self.optimize_with_deadline(query, session_id, budget, deadline)
            .await
    }

    pub async fn optimize_with_deadline(
        &self,
        query: &str,
        session_id: Option<&str>,
        budget: usize,
        deadline: Option<Duration>,
    ) -> Result<OptimizedContext> {
        let options = OptimizeOptions {
            deadline,
            retrieval: None,
        };
        self.optimize_with(query, session_id, budget, &options).await
    }

    /// Run every stage with per-call deadline and retrieval settings
    pub async fn optimize_with(
        &self,
        query: &str,
        session_id: Option<&str>,
        budget: usize,
        options: &OptimizeOptions,
    ) -> Result<OptimizedContext> {
        if budget < MIN_TOKEN_BUDGET {
            return Err(MemoryError::Validation(format!(
                "token budget must be at least {MIN_TOKEN_BUDGET}, got {budget}"
            )));
        }
        if query.trim().is_empty() {
            return Err(MemoryError::Validation("query must not be empty".to_string()));
        }

        let started = Instant::now();
        let ends_at = options.deadline.map(|d| started + d);
        let retrieval = options
            .retrieval
            .as_ref()
            .unwrap_or_else(|| self.retriever.config());
        let mut metadata = PipelineMetadata {
            strategy: retrieval.strategy,
            ..Default::default()
        };

        // Retrieve
        let stage = Instant::now();
        let retrieved = match within(ends_at, self.retriever.retrieve(query, session_id, retrieval)).await {
            Some(result) => result?,
            None => {
                warn!("Retrieval exceeded the deadline, continuing without candidates");
                metadata.degraded_stages.push("retrieve".to_string());
                RetrievalResult::default()
            }
        };
        metadata.timings.retrieve_ms = elapsed_ms(stage);
        metadata.retrieval_count = retrieved.candidates.len();
        metadata.degraded_sources = retrieved.degraded_sources.clone();

        // Rerank
        let stage = Instant::now();
        let top_k = self.reranker.config().top_k;
        let threshold = self.reranker.config().threshold;
        let fallback_order = {
            let mut c = retrieved.candidates.clone();
            c.truncate(top_k);
            c
        };
        let reranked = match within(ends_at, self.reranker.rerank(query, retrieved.candidates, top_k, threshold)).await {
            Some(result) => {
                metadata.reranker_backend = self.reranker.active_backend();
                result?
            }
            None => {
                warn!("Reranking exceeded the deadline, keeping retrieval order");
                metadata.degraded_stages.push("rerank".to_string());
                fallback_order
            }
        };
        metadata.timings.rerank_ms = elapsed_ms(stage);
        metadata.reranked_count = reranked.len();

        // Compress
        let stage = Instant::now();
        let overhead = self.assembler.overhead_tokens(query) + reranked.len() * PER_ITEM_MARKUP_TOKENS;
        let target = budget.saturating_sub(overhead).max(1);
        let compressed = match within(ends_at, self.compressor.compress(&reranked, target)).await {
            Some(result) => {
                let result = result?;
                metadata.original_tokens = result.original_tokens;
                metadata.compression_ratio = result.ratio;
                result.candidates
            }
            None => {
                warn!("Compression exceeded the deadline, relying on assembly truncation");
                metadata.degraded_stages.push("compress".to_string());
                reranked
            }
        };
        metadata.timings.compress_ms = elapsed_ms(stage);

        // Assemble
        let stage = Instant::now();
        let assembled = self
            .assembler
            .assemble(&compressed, query, self.config.include_confidence, budget)?;
        metadata.timings.assemble_ms = elapsed_ms(stage);
        metadata.final_tokens = assembled.tokens;
        metadata.clipped = assembled.clipped;
        metadata.timings.total_ms = elapsed_ms(started);

        info!(
            "Optimized context ({}): {} retrieved, {} reranked, {} tokens in {}ms",
            metadata.strategy,
            metadata.retrieval_count, metadata.reranked_count, metadata.final_tokens, metadata.timings.total_ms
        );
        debug!("Pipeline metadata: {:?}", metadata);

        Ok(OptimizedContext {
            context: assembled.context,
            metadata,
        })
    }
}

/// Await `fut`, or give up at `ends_at`. `None` means the deadline passed.
async fn within<F: Future>(ends_at: Option<Instant>, fut: F) -> Option<F::Output> {
    match ends_at {
        None => Some(fut.await),
        Some(end) => {
            let remaining = end.saturating_duration_since(Instant::now());
            tokio::time::timeout(remaining, fut).await.ok()
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
