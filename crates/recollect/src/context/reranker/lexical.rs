//! BM25-style term overlap scorer, the last link of the fallback chain

use async_trait::async_trait;
use std::collections::HashMap;

use crate::context::tokens::terms;
use crate::error::Result;

use super::{RerankBackend, RerankerKind};

const K1: f32 = 1.2;
const B: f32 = 0.75;
const AVG_DOC_TERMS: f32 = 100.0;

/// Scores need no model, so this backend never fails to load
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalBackend;

impl LexicalBackend {
    /// BM25 term saturation averaged over query terms, scaled into [0, 1].
    /// Document length is measured in terms, so multibyte text is not penalised.
    pub fn score_one(query: &str, document: &str) -> f32 {
        let query_terms: Vec<String> = terms(query).collect();
        if query_terms.is_empty() {
            return 0.0;
        }

        let mut frequencies: HashMap<String, usize> = HashMap::new();
        let mut doc_len = 0usize;
        for term in terms(document) {
            *frequencies.entry(term).or_default() += 1;
            doc_len += 1;
        }
        if doc_len == 0 {
            return 0.0;
        }

        let length_norm = 1.0 - B + B * (doc_len as f32 / AVG_DOC_TERMS);
        let score: f32 = query_terms
            .iter()
            .filter_map(|term| frequencies.get(term))
            .map(|&tf| {
                let tf = tf as f32;
                tf * (K1 + 1.0) / (tf + K1 * length_norm)
            })
            .sum();

        (score / query_terms.len() as f32 / (K1 + 1.0)).clamp(0.0, 1.0)
    }
}

#[async_trait]
impl RerankBackend for LexicalBackend {
    fn kind(&self) -> RerankerKind {
        RerankerKind::Lexical
    }

    async fn load(&self) -> Result<()> {
        Ok(())
    }

    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        Ok(documents
            .iter()
            .map(|d| Self::score_one(query, d))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_terms_score_higher() {
        let fox = LexicalBackend::score_one("fox", "The quick brown fox");
        let dog = LexicalBackend::score_one("fox", "A lazy dog sleeps");
        assert!(fox > dog);
        assert_eq!(dog, 0.0);
    }

    #[test]
    fn test_scores_are_bounded() {
        let s = LexicalBackend::score_one("rust rust", &"rust ".repeat(200));
        assert!((0.0..=1.0).contains(&s));
    }

    #[test]
    fn test_accented_text_is_not_penalised() {
        let plain = LexicalBackend::score_one("fox", "cafe fox");
        let accented = LexicalBackend::score_one("fox", "café fox");
        assert!(plain > 0.0);
        assert_eq!(plain, accented);
    }

    #[test]
    fn test_whole_terms_only() {
        assert_eq!(LexicalBackend::score_one("fox", "foxglove grows"), 0.0);
        assert!(LexicalBackend::score_one("Fox!", "a FOX, quietly") > 0.0);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(LexicalBackend::score_one("", "doc"), 0.0);
        assert_eq!(LexicalBackend::score_one("q", ""), 0.0);
    }
}
