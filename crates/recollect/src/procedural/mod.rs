//! Procedural memory: learned condition -> action rules
//!
//! Rules are matched by the similarity between a context string and each
//! rule's condition. When either side has no embedding the match falls back
//! to token overlap. Every match reinforces the rule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ProceduralConfig;
use crate::error::{MemoryError, Result};
use crate::ports::{Clock, EmbeddingPort, StatePersistencePort, cosine_similarity};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProceduralRule {
    pub rule_id: String,
    pub condition: String,
    pub action: String,
    pub confidence: f32,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

impl ProceduralRule {
    pub fn new(
        rule_id: impl Into<String>,
        condition: impl Into<String>,
        action: impl Into<String>,
        confidence: f32,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            condition: condition.into(),
            action: action.into(),
            confidence,
            usage_count: 0,
            last_used: None,
        }
    }

    /// Rendering used in assembled context
    pub fn describe(&self) -> String {
        format!("When {}: {}", self.condition, self.action)
    }
}

/// A matched rule and how closely its condition fit the context
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule: ProceduralRule,
    pub similarity: f32,
}

#[derive(Serialize, Deserialize)]
struct StoredRule {
    rule: ProceduralRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    embedding: Option<Vec<f32>>,
}

pub struct ProceduralStore {
    rules: RwLock<HashMap<String, StoredRule>>,
    embedder: Arc<dyn EmbeddingPort>,
    clock: Arc<dyn Clock>,
    config: ProceduralConfig,
}

impl ProceduralStore {
    pub fn new(
        embedder: Arc<dyn EmbeddingPort>,
        clock: Arc<dyn Clock>,
        config: ProceduralConfig,
    ) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            embedder,
            clock,
            config,
        }
    }

    /// Add a rule. Rule ids are unique.
    pub async fn add_rule(&self, rule: ProceduralRule) -> Result<()> {
        if rule.rule_id.trim().is_empty() {
            return Err(MemoryError::Validation("rule_id must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&rule.confidence) {
            return Err(MemoryError::Validation(format!(
                "confidence must be within [0, 1], got {}",
                rule.confidence
            )));
        }
        if self.rules.read().await.contains_key(&rule.rule_id) {
            return Err(MemoryError::Validation(format!(
                "rule {} already exists",
                rule.rule_id
            )));
        }

        let embedding = match self.embedder.embed(&rule.condition).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(
                    "Embedding failed for rule {}, matching lexically: {}",
                    rule.rule_id, e
                );
                None
            }
        };

        let mut rules = self.rules.write().await;
        // Re-check under the write lock; the embed call ran unlocked
        if rules.contains_key(&rule.rule_id) {
            return Err(MemoryError::Validation(format!(
                "rule {} already exists",
                rule.rule_id
            )));
        }
        debug!("Added procedural rule {}", rule.rule_id);
        rules.insert(rule.rule_id.clone(), StoredRule { rule, embedding });
        Ok(())
    }

    /// Rules whose condition fits `context`, best first.
    ///
    /// Only rules with `confidence >= min_confidence` are considered.
    /// Returned rules reflect the reinforcement applied by this match.
    pub async fn match_rules(
        &self,
        context: &str,
        min_confidence: f32,
        limit: usize,
    ) -> Result<Vec<RuleMatch>> {
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(MemoryError::Validation(format!(
                "min_confidence must be within [0, 1], got {min_confidence}"
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let query = match self.embedder.embed(context).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Context embedding failed, matching rules lexically: {}", e);
                None
            }
        };

        let mut rules = self.rules.write().await;
        let mut scored: Vec<(String, f32, f32)> = rules
            .values()
            .filter(|s| s.rule.confidence >= min_confidence)
            .map(|s| {
                let similarity = match (&query, &s.embedding) {
                    (Some(q), Some(c)) => cosine_similarity(q, c).max(0.0),
                    _ => token_overlap(context, &s.rule.condition),
                };
                (s.rule.rule_id.clone(), similarity, s.rule.confidence)
            })
            .filter(|(_, sim, _)| *sim >= self.config.min_similarity)
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(limit);

        let now = self.clock.now();
        let mut out = Vec::with_capacity(scored.len());
        for (id, similarity, _) in scored {
            if let Some(stored) = rules.get_mut(&id) {
                stored.rule.usage_count += 1;
                stored.rule.last_used = Some(now);
                stored.rule.confidence = (stored.rule.confidence + self.config.reinforcement).min(1.0);
                out.push(RuleMatch {
                    rule: stored.rule.clone(),
                    similarity,
                });
            }
        }
        Ok(out)
    }

    pub async fn remove_rule(&self, rule_id: &str) -> bool {
        self.rules.write().await.remove(rule_id).is_some()
    }

    pub async fn get_rule(&self, rule_id: &str) -> Option<ProceduralRule> {
        self.rules.read().await.get(rule_id).map(|s| s.rule.clone())
    }

    /// All rules ordered by id
    pub async fn list_rules(&self) -> Vec<ProceduralRule> {
        let mut rules: Vec<ProceduralRule> = self
            .rules
            .read()
            .await
            .values()
            .map(|s| s.rule.clone())
            .collect();
        rules.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        rules
    }

    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    /// Write every rule with its condition embedding as JSON under `key`
    pub async fn snapshot(&self, persistence: &dyn StatePersistencePort, key: &str) -> Result<()> {
        let bytes = {
            let rules = self.rules.read().await;
            let mut stored: Vec<&StoredRule> = rules.values().collect();
            stored.sort_by(|a, b| a.rule.rule_id.cmp(&b.rule.rule_id));
            serde_json::to_vec(&stored)?
        };
        persistence.set(key, &bytes).await?;
        info!("Saved procedural snapshot ({} bytes) under '{}'", bytes.len(), key);
        Ok(())
    }

    /// Replace all rules with the snapshot under `key`.
    /// Returns false when no snapshot exists.
    pub async fn restore(&self, persistence: &dyn StatePersistencePort, key: &str) -> Result<bool> {
        let Some(bytes) = persistence.get(key).await? else {
            return Ok(false);
        };
        let stored: Vec<StoredRule> = serde_json::from_slice(&bytes)?;

        let mut restored = HashMap::with_capacity(stored.len());
        for mut entry in stored {
            if entry
                .embedding
                .as_ref()
                .is_some_and(|v| v.len() != self.embedder.dimensions())
            {
                entry.embedding = self.embedder.embed(&entry.rule.condition).await.ok();
            }
            restored.insert(entry.rule.rule_id.clone(), entry);
        }
        info!("Restored {} procedural rules from '{}'", restored.len(), key);
        *self.rules.write().await = restored;
        Ok(true)
    }

    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard overlap of lowercase word sets
fn token_overlap(a: &str, b: &str) -> f32 {
    let (a, b) = (tokens(a), tokens(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count() as f32;
    shared / a.union(&b).count() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingEmbedder, HashingEmbedder, ManualClock};

    fn store(embedder: Arc<dyn EmbeddingPort>) -> ProceduralStore {
        ProceduralStore::new(
            embedder,
            Arc::new(ManualClock::default()),
            ProceduralConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_duplicate_rule_rejected() {
        let store = store(Arc::new(HashingEmbedder::default()));
        let rule = ProceduralRule::new("r1", "user asks for code", "answer in Rust", 0.8);
        store.add_rule(rule.clone()).await.unwrap();
        assert!(matches!(
            store.add_rule(rule).await,
            Err(MemoryError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_match_reinforces_rule() {
        let store = store(Arc::new(HashingEmbedder::default()));
        store
            .add_rule(ProceduralRule::new("r1", "user asks for code examples", "answer in Rust", 0.8))
            .await
            .unwrap();
        store
            .add_rule(ProceduralRule::new("r2", "weather in Paris", "mention umbrellas", 0.9))
            .await
            .unwrap();

        let matches = store.match_rules("user asks for code", 0.5, 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule.rule_id, "r1");
        assert_eq!(matches[0].rule.usage_count, 1);
        assert!(matches[0].rule.last_used.is_some());
        assert!(matches[0].rule.confidence > 0.8);

        let untouched = store.get_rule("r2").await.unwrap();
        assert_eq!(untouched.usage_count, 0);
    }

    #[tokio::test]
    async fn test_min_confidence_filters_rules() {
        let store = store(Arc::new(HashingEmbedder::default()));
        store
            .add_rule(ProceduralRule::new("weak", "deploy to production", "ask first", 0.2))
            .await
            .unwrap();
        assert!(store.match_rules("deploy to production", 0.5, 5).await.unwrap().is_empty());
        assert!(store.match_rules("x", 2.0, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_lexical_fallback_without_embeddings() {
        let store = store(Arc::new(FailingEmbedder::default()));
        store
            .add_rule(ProceduralRule::new("r1", "deploy to production", "ask first", 0.9))
            .await
            .unwrap();
        let matches = store.match_rules("deploy production", 0.0, 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert!((matches[0].similarity - 2.0 / 3.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_remove_rule() {
        let store = store(Arc::new(HashingEmbedder::default()));
        store
            .add_rule(ProceduralRule::new("r1", "a", "b", 0.5))
            .await
            .unwrap();
        assert!(store.remove_rule("r1").await);
        assert!(!store.remove_rule("r1").await);
        assert!(store.is_empty().await);
    }
}
