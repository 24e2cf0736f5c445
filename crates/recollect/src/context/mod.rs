//! Context engineering: retrieve, rerank, compress, assemble

pub mod assembler;
pub mod compressor;
pub mod pipeline;
pub mod reranker;
pub mod retriever;
pub mod tokens;
pub mod types;

pub use assembler::{AssembledContext, Assembler, MIN_TOKEN_BUDGET};
pub use compressor::{CompressionMethod, CompressionResult, Compressor, SUMMARY_PROMPT};
pub use pipeline::{ContextPipeline, OptimizeOptions, OptimizedContext, PipelineMetadata, StageTimings};
pub use reranker::{RerankBackend, Reranker, RerankerKind};
pub use retriever::Retriever;
pub use tokens::{estimate_tokens, truncate_to_tokens};
pub use types::{Candidate, CandidateSource, RetrievalResult};
