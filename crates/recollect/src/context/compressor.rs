//! Candidate compression to a token budget
//!
//! Extractive compression ranks sentences by importance and keeps the best
//! ones; it never calls the generation capability. Generative compression
//! asks for one summary per source so provenance survives. The hybrid
//! strategy prunes redundant and low-importance sentences first and only
//! summarises when that is not enough.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{CompressionConfig, CompressionStrategy};
use crate::error::{MemoryError, Result};
use crate::ports::{GenerationOptions, GenerationPort};

use super::tokens::{estimate_tokens, split_sentences, terms};
use super::types::{Candidate, CandidateSource};

/// Prompt for generative summaries
///
/// Placeholders: {source} - memory kind, {max_words} - length limit, {content} - text
pub const SUMMARY_PROMPT: &str = r#"Summarize the following {source} memory notes for an AI assistant.

Keep names, numbers, dates and preferences exactly as written. Drop greetings, repetition and filler.
Write plain sentences, no lists or headings, in at most {max_words} words.

Notes:
{content}

Summary:"#;

/// Jaccard overlap above which two sentences count as duplicates
const DUPLICATE_OVERLAP: f32 = 0.8;
/// Sentences below this share of the mean importance are pruned by the light pass
const LOW_IMPORTANCE_RATIO: f32 = 0.5;
/// Bonus for the first sentence of a candidate
const LEAD_BONUS: f32 = 0.1;

/// Which pass produced the final content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Already within budget
    None,
    Extractive,
    Generative,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressionResult {
    /// Compressed candidates, provenance preserved
    pub candidates: Vec<Candidate>,
    /// Candidate contents joined by newlines
    pub content: String,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    /// `1 - compressed / original`, 0 when nothing was removed
    pub ratio: f32,
    pub within_budget: bool,
    pub method: CompressionMethod,
}

impl CompressionResult {
    fn build(candidates: Vec<Candidate>, original_tokens: usize, target: usize, method: CompressionMethod) -> Self {
        let content = join_contents(&candidates);
        let compressed_tokens = estimate_tokens(&content);
        let ratio = if original_tokens == 0 {
            0.0
        } else {
            (1.0 - compressed_tokens as f32 / original_tokens as f32).max(0.0)
        };
        Self {
            candidates,
            content,
            original_tokens,
            compressed_tokens,
            ratio,
            within_budget: compressed_tokens <= target,
            method,
        }
    }
}

#[derive(Debug, Clone)]
struct Sentence {
    candidate: usize,
    position: usize,
    text: String,
    importance: f32,
}

pub struct Compressor {
    generator: Option<Arc<dyn GenerationPort>>,
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(generator: Option<Arc<dyn GenerationPort>>, config: CompressionConfig) -> Self {
        Self { generator, config }
    }

    pub fn strategy(&self) -> CompressionStrategy {
        self.config.strategy
    }

    /// Compress `candidates` to at most `target_tokens`.
    ///
    /// Extractive output always fits. Generative output that still exceeds
    /// the target is returned with `within_budget = false`.
    pub async fn compress(&self, candidates: &[Candidate], target_tokens: usize) -> Result<CompressionResult> {
        let original_tokens = estimate_tokens(&join_contents(candidates));
        if original_tokens <= target_tokens {
            return Ok(CompressionResult::build(
                candidates.to_vec(),
                original_tokens,
                target_tokens,
                CompressionMethod::None,
            ));
        }

        let sentences = score_sentences(candidates);
        let result = match self.config.strategy {
            CompressionStrategy::Extractive => {
                let kept = fit_to_budget(&sentences, target_tokens);
                CompressionResult::build(
                    rebuild(candidates, &kept),
                    original_tokens,
                    target_tokens,
                    CompressionMethod::Extractive,
                )
            }
            CompressionStrategy::Generative => {
                self.generative_or_extractive(candidates, &sentences, original_tokens, target_tokens)
                    .await
            }
            CompressionStrategy::Hybrid => {
                let pruned = prune(&sentences);
                let light = rebuild(candidates, &pruned);
                let light_tokens = estimate_tokens(&join_contents(&light));
                if light_tokens <= target_tokens {
                    CompressionResult::build(light, original_tokens, target_tokens, CompressionMethod::Extractive)
                } else {
                    debug!(
                        "Extractive pass left {} tokens for a {} budget, summarising",
                        light_tokens, target_tokens
                    );
                    self.generative_or_extractive(&light, &score_sentences(&light), original_tokens, target_tokens)
                        .await
                }
            }
        };

        debug!(
            "Compressed {} -> {} tokens ({:?}, ratio {:.2})",
            result.original_tokens, result.compressed_tokens, result.method, result.ratio
        );
        Ok(result)
    }

    async fn generative_or_extractive(
        &self,
        candidates: &[Candidate],
        sentences: &[Sentence],
        original_tokens: usize,
        target_tokens: usize,
    ) -> CompressionResult {
        match self.summarize(candidates, target_tokens).await {
            Ok(summaries) => {
                let result = CompressionResult::build(
                    summaries,
                    original_tokens,
                    target_tokens,
                    CompressionMethod::Generative,
                );
                if !result.within_budget {
                    warn!(
                        "Summaries still use {} tokens for a {} budget, assembly will truncate",
                        result.compressed_tokens, target_tokens
                    );
                }
                result
            }
            Err(e) => {
                warn!("Generative compression unavailable, using extractive: {}", e);
                let kept = fit_to_budget(sentences, target_tokens);
                CompressionResult::build(
                    rebuild(candidates, &kept),
                    original_tokens,
                    target_tokens,
                    CompressionMethod::Extractive,
                )
            }
        }
    }

    /// One summary per source, each given a share of the budget
    async fn summarize(&self, candidates: &[Candidate], target_tokens: usize) -> Result<Vec<Candidate>> {
        let generator = self.generator.as_ref().ok_or_else(|| {
            MemoryError::Generation("no generation capability configured".to_string())
        })?;

        let mut groups: BTreeMap<CandidateSource, Vec<&Candidate>> = BTreeMap::new();
        for candidate in candidates {
            groups.entry(candidate.source).or_default().push(candidate);
        }
        let total_tokens = estimate_tokens(&join_contents(candidates)).max(1);

        let mut summaries = Vec::with_capacity(groups.len());
        for (source, group) in groups {
            let text = group
                .iter()
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let share = (target_tokens * estimate_tokens(&text) / total_tokens).max(1);
            let prompt = SUMMARY_PROMPT
                .replace("{source}", source.as_str())
                .replace("{max_words}", &(share * 3 / 4).max(1).to_string())
                .replace("{content}", &text);
            let options = GenerationOptions {
                temperature: self.config.temperature,
                max_tokens: share as u32,
                model: None,
            };

            let summary = generator.generate(&prompt, options).await?;
            let summary = summary.trim();
            if summary.is_empty() {
                continue;
            }

            let best = group.iter().map(|c| c.score()).fold(0.0f32, f32::max);
            let latest: Option<DateTime<Utc>> = group.iter().filter_map(|c| c.timestamp).max();
            let mut merged = Candidate::new(summary, source, best);
            merged.reranked_score = group.iter().filter_map(|c| c.reranked_score).reduce(f32::max);
            merged.timestamp = latest;
            summaries.push(merged);
        }
        Ok(summaries)
    }
}

fn join_contents(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Importance = candidate score x mean corpus weight of the sentence's terms,
/// plus a bonus for lead sentences
fn score_sentences(candidates: &[Candidate]) -> Vec<Sentence> {
    let mut sentences = Vec::new();
    for (ci, candidate) in candidates.iter().enumerate() {
        for (position, text) in split_sentences(&candidate.content).into_iter().enumerate() {
            sentences.push(Sentence {
                candidate: ci,
                position,
                text: text.to_string(),
                importance: 0.0,
            });
        }
    }

    let mut frequency: HashMap<String, usize> = HashMap::new();
    for s in &sentences {
        for term in terms(&s.text) {
            *frequency.entry(term).or_default() += 1;
        }
    }
    let max_frequency = frequency.values().copied().max().unwrap_or(1) as f32;

    for s in &mut sentences {
        let weights: Vec<f32> = terms(&s.text)
            .map(|t| frequency.get(&t).copied().unwrap_or(0) as f32 / max_frequency)
            .collect();
        let centrality = if weights.is_empty() {
            0.0
        } else {
            weights.iter().sum::<f32>() / weights.len() as f32
        };
        let relevance = candidates[s.candidate].score().max(0.05);
        let lead = if s.position == 0 { LEAD_BONUS } else { 0.0 };
        s.importance = relevance * (centrality + lead);
    }
    sentences
}

/// Light pass: drop near-duplicate and low-importance sentences
fn prune(sentences: &[Sentence]) -> Vec<usize> {
    if sentences.is_empty() {
        return Vec::new();
    }
    let mean = sentences.iter().map(|s| s.importance).sum::<f32>() / sentences.len() as f32;
    let floor = mean * LOW_IMPORTANCE_RATIO;

    let mut order: Vec<usize> = (0..sentences.len()).collect();
    order.sort_by(|&a, &b| by_importance(&sentences[a], &sentences[b]));

    let mut kept: Vec<usize> = Vec::new();
    let mut kept_terms: Vec<HashSet<String>> = Vec::new();
    for i in order {
        if sentences[i].importance < floor {
            continue;
        }
        let set: HashSet<String> = terms(&sentences[i].text).collect();
        if kept_terms.iter().any(|k| jaccard(k, &set) > DUPLICATE_OVERLAP) {
            continue;
        }
        kept.push(i);
        kept_terms.push(set);
    }
    kept
}

/// Greedy selection by importance under a character budget of `4 x target`.
/// Rebuilt text joins kept sentences with one separator each, so the
/// estimate of the result never exceeds `target_tokens`.
fn fit_to_budget(sentences: &[Sentence], target_tokens: usize) -> Vec<usize> {
    let budget_chars = target_tokens.saturating_mul(4);
    let mut order: Vec<usize> = (0..sentences.len()).collect();
    order.sort_by(|&a, &b| by_importance(&sentences[a], &sentences[b]));

    let mut used = 0usize;
    let mut kept = Vec::new();
    for i in order {
        let len = sentences[i].text.chars().count();
        let cost = if kept.is_empty() { len } else { len + 1 };
        if used + cost <= budget_chars {
            used += cost;
            kept.push(i);
        }
    }
    kept
}

fn by_importance(a: &Sentence, b: &Sentence) -> std::cmp::Ordering {
    b.importance
        .partial_cmp(&a.importance)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(a.candidate.cmp(&b.candidate))
        .then(a.position.cmp(&b.position))
}

/// Reassemble candidates from kept sentence indices in original order;
/// candidates left with no sentences are dropped
fn rebuild(candidates: &[Candidate], kept: &[usize]) -> Vec<Candidate> {
    let sentences = score_sentences(candidates);
    let mut per_candidate: BTreeMap<usize, Vec<&Sentence>> = BTreeMap::new();
    for &i in kept {
        if let Some(s) = sentences.get(i) {
            per_candidate.entry(s.candidate).or_default().push(s);
        }
    }

    per_candidate
        .into_iter()
        .map(|(ci, mut parts)| {
            parts.sort_by_key(|s| s.position);
            let mut candidate = candidates[ci].clone();
            candidate.content = parts
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            candidate
        })
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedGenerator;

    fn corpus(sentences: usize) -> Vec<Candidate> {
        (0..sentences / 5)
            .map(|c| {
                let text = (0..5)
                    .map(|s| format!("Note {c}-{s} mentions topic{} and detail{} in passing.", s % 3, c * 5 + s))
                    .collect::<Vec<_>>()
                    .join(" ");
                Candidate::new(text, CandidateSource::Episodic, 0.5 + (c % 5) as f32 * 0.1)
            })
            .collect()
    }

    fn compressor(strategy: CompressionStrategy, generator: Option<Arc<dyn GenerationPort>>) -> Compressor {
        Compressor::new(
            generator,
            CompressionConfig {
                strategy,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_within_budget_is_untouched() {
        let candidates = vec![Candidate::new("Short note.", CandidateSource::Semantic, 0.9)];
        let result = compressor(CompressionStrategy::Hybrid, None)
            .compress(&candidates, 100)
            .await
            .unwrap();
        assert_eq!(result.method, CompressionMethod::None);
        assert_eq!(result.candidates, candidates);
        assert_eq!(result.ratio, 0.0);
    }

    #[tokio::test]
    async fn test_extractive_meets_budget_and_reports_ratio() {
        let candidates = corpus(400);
        let result = compressor(CompressionStrategy::Extractive, None)
            .compress(&candidates, 500)
            .await
            .unwrap();
        assert!(result.original_tokens > 2000);
        assert!(result.compressed_tokens <= 500);
        assert!(result.within_budget);
        let expected = 1.0 - result.compressed_tokens as f32 / result.original_tokens as f32;
        assert!((result.ratio - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_extractive_only_keeps_original_sentences() {
        let candidates = corpus(50);
        let result = compressor(CompressionStrategy::Extractive, None)
            .compress(&candidates, 60)
            .await
            .unwrap();
        let originals: Vec<&str> = candidates
            .iter()
            .flat_map(|c| split_sentences(&c.content))
            .collect();
        for candidate in &result.candidates {
            for sentence in split_sentences(&candidate.content) {
                assert!(originals.contains(&sentence));
            }
        }
    }

    #[tokio::test]
    async fn test_hybrid_summarises_when_extractive_is_not_enough() {
        let generator = Arc::new(ScriptedGenerator::new().with_fallback("Topics were discussed."));
        let result = compressor(CompressionStrategy::Hybrid, Some(generator.clone()))
            .compress(&corpus(200), 50)
            .await
            .unwrap();
        assert_eq!(result.method, CompressionMethod::Generative);
        assert_eq!(generator.call_count(), 1);
        assert!(generator.prompts()[0].contains("episodic"));
        assert!(result.compressed_tokens <= 50);
    }

    #[tokio::test]
    async fn test_generation_failure_falls_back_to_extractive() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_error("offline");
        let result = compressor(CompressionStrategy::Generative, Some(generator))
            .compress(&corpus(100), 100)
            .await
            .unwrap();
        assert_eq!(result.method, CompressionMethod::Extractive);
        assert!(result.compressed_tokens <= 100);
    }

    #[tokio::test]
    async fn test_oversized_summary_is_flagged() {
        let long = "word ".repeat(400);
        let generator = Arc::new(ScriptedGenerator::new().with_fallback(long));
        let result = compressor(CompressionStrategy::Generative, Some(generator))
            .compress(&corpus(100), 100)
            .await
            .unwrap();
        assert!(!result.within_budget);
        assert!(result.compressed_tokens > 100);
    }

    #[test]
    fn test_prune_drops_duplicates() {
        let candidates = vec![
            Candidate::new("Rust has ownership rules.", CandidateSource::Episodic, 0.9),
            Candidate::new("Rust has ownership rules!", CandidateSource::Episodic, 0.8),
        ];
        let sentences = score_sentences(&candidates);
        assert_eq!(prune(&sentences).len(), 1);
    }
}
