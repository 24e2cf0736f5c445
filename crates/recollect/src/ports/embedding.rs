//! Text embedding capability
//!
//! [`FastEmbedder`] runs multilingual-e5-small locally through fastembed and
//! produces 384-dimensional vectors. The model needs exclusive access while
//! embedding, so calls are moved onto the blocking pool.

use async_trait::async_trait;
use fastembed::{EmbeddingModel as FastEmbedModel, InitOptions, TextEmbedding};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::error::{MemoryError, Result};

/// Dimension of the bundled embedding model
pub const EMBEDDING_DIMENSION: usize = 384;

/// Converts text into a dense vector
#[async_trait]
pub trait EmbeddingPort: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Size of every vector this port returns
    fn dimensions(&self) -> usize;

    /// Get the adapter name for logging
    fn name(&self) -> &'static str;
}

/// Local ONNX embedding model
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedder {
    /// Load the model, downloading it on first use
    pub fn new() -> Result<Self> {
        let model = TextEmbedding::try_new(InitOptions::new(FastEmbedModel::MultilingualE5Small))
            .map_err(|e| MemoryError::ModelLoad(e.to_string()))?;
        info!("Loaded embedding model multilingual-e5-small");
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl EmbeddingPort for FastEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = Arc::clone(&self.model);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| MemoryError::Embedding("embedding model lock poisoned".to_string()))?;
            let embeddings = model
                .embed(vec![text], None)
                .map_err(|e| MemoryError::Embedding(e.to_string()))?;
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| MemoryError::Embedding("No embedding returned".to_string()))
        })
        .await
        .map_err(|e| MemoryError::Embedding(format!("embedding task failed: {e}")))?
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIMENSION
    }

    fn name(&self) -> &'static str {
        "fastembed"
    }
}

/// Cosine similarity between two vectors, 0.0 when either has no magnitude
/// or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[cfg(feature = "ml-tests")]
    #[tokio::test]
    async fn test_fastembed_dimension() {
        let embedder = FastEmbedder::new().expect("Failed to load model");
        let v = embedder.embed("Hello, world!").await.expect("Failed to embed");
        assert_eq!(v.len(), EMBEDDING_DIMENSION);
    }

    #[cfg(feature = "ml-tests")]
    #[tokio::test]
    async fn test_fastembed_similar_texts_rank_higher() {
        let embedder = FastEmbedder::new().expect("Failed to load model");
        let a = embedder
            .embed("The quick brown fox jumps over the lazy dog")
            .await
            .unwrap();
        let b = embedder
            .embed("A fast brown fox leaps over a sleepy dog")
            .await
            .unwrap();
        let c = embedder
            .embed("Quantum computing revolutionizes cryptography")
            .await
            .unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }
}
