//! Test utilities for recollect - deterministic doubles for every port
//!
//! These stand in for the ML model, the remote LLM and the wall clock so
//! tests run fast and produce the same result on every run:
//! - [`HashingEmbedder`]: bag-of-words feature hashing
//! - [`FailingEmbedder`]: always errors, for degraded-mode paths
//! - [`ScriptedGenerator`]: replays queued responses and records prompts
//! - [`ManualClock`]: time only moves when a test moves it

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{MemoryError, Result};
use crate::ports::{Clock, EmbeddingPort, GenerationOptions, GenerationPort};

/// Feature-hashing embedder.
///
/// Every lowercase alphanumeric token is hashed into one of `dimensions`
/// buckets with a hashed sign, then the vector is L2-normalised. Identical
/// texts have cosine 1.0 and texts sharing words score above unrelated ones.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Synchronous embedding, handy in assertions
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % self.dimensions as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingPort for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &'static str {
        "hashing"
    }
}

/// Embedder that always fails
#[derive(Debug, Clone)]
pub struct FailingEmbedder {
    dimensions: usize,
}

impl Default for FailingEmbedder {
    fn default() -> Self {
        Self { dimensions: 384 }
    }
}

#[async_trait]
impl EmbeddingPort for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(MemoryError::Embedding("embedding backend offline".to_string()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

enum Scripted {
    Text(String),
    Error(String),
}

/// Generator that replays queued responses in order.
///
/// Once the queue is empty every call returns the fallback response
/// (`"[]"` unless changed). Prompts and options are recorded for inspection.
pub struct ScriptedGenerator {
    queue: Mutex<VecDeque<Scripted>>,
    fallback: String,
    prompts: Mutex<Vec<String>>,
    options: Mutex<Vec<GenerationOptions>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: "[]".to_string(),
            prompts: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Build a generator that answers with `responses` in order
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let generator = Self::new();
        for r in responses {
            generator.push_response(r);
        }
        generator
    }

    /// Response used once the queue is drained
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    /// Sleep before answering, to hold a consolidation pass open
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_response(&self, response: impl Into<String>) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(Scripted::Text(response.into()));
        }
    }

    /// Queue a transport-level failure
    pub fn push_error(&self, message: impl Into<String>) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(Scripted::Error(message.into()));
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn recorded_options(&self) -> Vec<GenerationOptions> {
        self.options.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl GenerationPort for ScriptedGenerator {
    async fn generate(&self, prompt: &str, options: GenerationOptions) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut p) = self.prompts.lock() {
            p.push(prompt.to_string());
        }
        if let Ok(mut o) = self.options.lock() {
            o.push(options.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(Scripted::Text(text)) => Ok(text),
            Some(Scripted::Error(message)) => Err(MemoryError::Generation(message)),
            None => Ok(self.fallback.clone()),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z
        Self::new(Utc.timestamp_opt(1_704_067_200, 0).single().unwrap_or_else(Utc::now))
    }
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = time;
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::cosine_similarity;

    #[test]
    fn hashing_embedding_is_deterministic() {
        let model = HashingEmbedder::default();
        assert_eq!(model.embed_sync("hello world"), model.embed_sync("hello world"));
    }

    #[test]
    fn hashing_embedding_has_correct_dimensions() {
        assert_eq!(HashingEmbedder::default().embed_sync("test").len(), 384);
        assert_eq!(HashingEmbedder::new(16).embed_sync("test").len(), 16);
    }

    #[test]
    fn hashing_embedding_is_normalized() {
        let v = HashingEmbedder::default().embed_sync("Rust has ownership and borrowing");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_embedding_overlap_scores_higher() {
        let model = HashingEmbedder::default();
        let q = model.embed_sync("rust ownership");
        let related = model.embed_sync("Rust has ownership rules");
        let unrelated = model.embed_sync("Paris is the capital of France");
        assert!(cosine_similarity(&q, &related) > cosine_similarity(&q, &unrelated));
    }

    #[test]
    fn hashing_embedding_is_case_insensitive() {
        let model = HashingEmbedder::default();
        let a = model.embed_sync("Rust");
        let b = model.embed_sync("rust");
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn failing_embedder_errors() {
        assert!(FailingEmbedder::default().embed("x").await.is_err());
    }

    #[tokio::test]
    async fn scripted_generator_replays_in_order() {
        let generator = ScriptedGenerator::with_responses(["one", "two"]).with_fallback("done");
        generator.push_error("boom");
        let opts = GenerationOptions::default();

        assert_eq!(generator.generate("a", opts.clone()).await.unwrap(), "one");
        assert_eq!(generator.generate("b", opts.clone()).await.unwrap(), "two");
        assert!(generator.generate("c", opts.clone()).await.is_err());
        assert_eq!(generator.generate("d", opts).await.unwrap(), "done");
        assert_eq!(generator.call_count(), 4);
        assert_eq!(generator.prompts(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::default();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.advance(ChronoDuration::days(2));
        assert_eq!(clock.now() - t0, ChronoDuration::days(2));
        clock.set(t0);
        assert_eq!(clock.now(), t0);
    }
}
