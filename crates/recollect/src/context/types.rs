//! Candidate values flowing through the context pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::RetrievalStrategy;

/// Which store a candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSource {
    Episodic,
    Semantic,
    Procedural,
}

impl CandidateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateSource::Episodic => "episodic",
            CandidateSource::Semantic => "semantic",
            CandidateSource::Procedural => "procedural",
        }
    }
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One piece of retrievable content with its provenance and scores
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub content: String,
    pub source: CandidateSource,
    pub timestamp: Option<DateTime<Utc>>,
    /// Source-weighted retrieval score
    pub initial_score: f32,
    pub reranked_score: Option<f32>,
    /// Confidence of the underlying fact or rule
    pub confidence: Option<f32>,
}

impl Candidate {
    pub fn new(content: impl Into<String>, source: CandidateSource, initial_score: f32) -> Self {
        Self {
            content: content.into(),
            source,
            timestamp: None,
            initial_score,
            reranked_score: None,
            confidence: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Reranked score when present, otherwise the retrieval score
    pub fn score(&self) -> f32 {
        self.reranked_score.unwrap_or(self.initial_score)
    }
}

/// Output of the retrieve stage
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    /// Deduplicated candidates, best first
    pub candidates: Vec<Candidate>,
    /// Sources that failed and contributed nothing
    pub degraded_sources: Vec<CandidateSource>,
    /// Strategy the candidates were retrieved with
    pub strategy: RetrievalStrategy,
}

impl RetrievalResult {
    pub fn is_degraded(&self) -> bool {
        !self.degraded_sources.is_empty()
    }
}
