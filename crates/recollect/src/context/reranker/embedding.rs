//! Bi-encoder scorer: cosine similarity between query and document vectors

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::{MemoryError, Result};
use crate::ports::{EmbeddingPort, cosine_similarity};

use super::{RerankBackend, RerankerKind};

pub struct EmbeddingBackend {
    embedder: Arc<dyn EmbeddingPort>,
    probe: OnceCell<std::result::Result<(), String>>,
}

impl EmbeddingBackend {
    pub fn new(embedder: Arc<dyn EmbeddingPort>) -> Self {
        Self {
            embedder,
            probe: OnceCell::new(),
        }
    }
}

#[async_trait]
impl RerankBackend for EmbeddingBackend {
    fn kind(&self) -> RerankerKind {
        RerankerKind::Embedding
    }

    /// Probe the embedder once; the outcome is remembered
    async fn load(&self) -> Result<()> {
        let probe = self
            .probe
            .get_or_init(|| async {
                match self.embedder.embed("probe").await {
                    Ok(_) => {
                        info!("Embedding reranker ready ({})", self.embedder.name());
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;
        probe.clone().map_err(MemoryError::ModelLoad)
    }

    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let q = self.embedder.embed(query).await?;
        let mut scores = Vec::with_capacity(documents.len());
        for document in documents {
            let d = self.embedder.embed(document).await?;
            scores.push(cosine_similarity(&q, &d).max(0.0));
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingEmbedder, HashingEmbedder};

    #[tokio::test]
    async fn test_scores_follow_similarity() {
        let backend = EmbeddingBackend::new(Arc::new(HashingEmbedder::default()));
        backend.load().await.unwrap();
        let scores = backend
            .score(
                "rust ownership",
                &["rust ownership rules".to_string(), "baking bread".to_string()],
            )
            .await
            .unwrap();
        assert!(scores[0] > scores[1]);
    }

    #[tokio::test]
    async fn test_load_failure_is_model_load() {
        let backend = EmbeddingBackend::new(Arc::new(FailingEmbedder::default()));
        assert!(matches!(backend.load().await, Err(MemoryError::ModelLoad(_))));
        // Remembered, not retried
        assert!(matches!(backend.load().await, Err(MemoryError::ModelLoad(_))));
    }
}
