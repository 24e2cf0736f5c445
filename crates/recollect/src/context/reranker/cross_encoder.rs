//! Cross-encoder scorer backed by fastembed's Jina Reranker v1 Turbo
//!
//! The model is loaded on first use. Concurrent first calls share one load
//! and a failed load is remembered so later calls fall through immediately.

use async_trait::async_trait;
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::{MemoryError, Result};

use super::{RerankBackend, RerankerKind};

type SharedModel = Arc<Mutex<TextRerank>>;

#[derive(Default)]
pub struct CrossEncoderBackend {
    model: OnceCell<std::result::Result<SharedModel, String>>,
}

impl CrossEncoderBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn model(&self) -> Result<SharedModel> {
        let loaded = self
            .model
            .get_or_init(|| async {
                let result = tokio::task::spawn_blocking(|| {
                    TextRerank::try_new(RerankInitOptions::new(
                        RerankerModel::JINARerankerV1TurboEn,
                    ))
                })
                .await;
                match result {
                    Ok(Ok(model)) => {
                        info!("Cross-encoder reranker loaded (Jina Reranker v1 Turbo)");
                        Ok(Arc::new(Mutex::new(model)))
                    }
                    Ok(Err(e)) => {
                        warn!("Cross-encoder unavailable: {}", e);
                        Err(e.to_string())
                    }
                    Err(e) => Err(format!("model load task failed: {e}")),
                }
            })
            .await;
        loaded.clone().map_err(MemoryError::ModelLoad)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[async_trait]
impl RerankBackend for CrossEncoderBackend {
    fn kind(&self) -> RerankerKind {
        RerankerKind::CrossEncoder
    }

    async fn load(&self) -> Result<()> {
        self.model().await.map(|_| ())
    }

    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let model = self.model().await?;
        let query = query.to_string();
        let documents = documents.to_vec();
        let count = documents.len();

        let results = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| MemoryError::ModelLoad("reranker model lock poisoned".to_string()))?;
            let docs: Vec<&str> = documents.iter().map(String::as_str).collect();
            model
                .rerank(query.as_str(), &docs, false, None)
                .map_err(|e| MemoryError::ModelLoad(format!("cross-encoder failed: {e}")))
        })
        .await
        .map_err(|e| MemoryError::ModelLoad(format!("rerank task failed: {e}")))??;

        // Logits come back sorted by score; put them back in input order
        let mut scores = vec![0.0; count];
        for r in results {
            if let Some(slot) = scores.get_mut(r.index) {
                *slot = sigmoid(r.score);
            }
        }
        Ok(scores)
    }
}
