//! Semantic memory: the bi-temporal knowledge graph
//!
//! One read-write guard covers the whole graph. Queries and traversals take
//! the read side and run concurrently; every mutation takes the write side,
//! validates first and only then touches the arena, so a rejected write
//! leaves the graph unchanged.

pub mod extraction;
pub mod graph;
pub mod types;

pub use extraction::{ExtractedEntity, ExtractedRelationship, RegexExtractor};
pub use graph::{GraphSnapshot, KnowledgeGraph};
pub use types::{Entity, FactPath, FactQuery, FactUpdate, SemanticFact, TraversalQuery};

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::ports::{Clock, StatePersistencePort};

/// Concurrent front for the [`KnowledgeGraph`]
pub struct SemanticGraphStore {
    graph: RwLock<KnowledgeGraph>,
    clock: Arc<dyn Clock>,
}

impl SemanticGraphStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            graph: RwLock::new(KnowledgeGraph::new()),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Insert an entity or merge its properties into an existing one.
    /// Returns the canonical id.
    pub async fn add_entity(&self, entity: Entity) -> Result<String> {
        if entity.id.trim().is_empty() {
            return Err(MemoryError::Validation(
                "entity id must not be empty".to_string(),
            ));
        }
        Ok(self.graph.write().await.upsert_entity(entity))
    }

    /// Resolve `name`, creating an entity of `entity_type` when absent
    pub async fn ensure_entity(&self, name: &str, entity_type: &str) -> Result<String> {
        if let Some(entity) = self.graph.read().await.entity(name) {
            return Ok(entity.id.clone());
        }
        self.add_entity(Entity::new(name, entity_type, self.clock.now()))
            .await
    }

    pub async fn get_entity(&self, name: &str) -> Option<Entity> {
        self.graph.read().await.entity(name).cloned()
    }

    pub async fn entity_count(&self) -> usize {
        self.graph.read().await.entity_count()
    }

    pub async fn fact_count(&self) -> usize {
        self.graph.read().await.fact_count()
    }

    /// Add a fact; fails with `EntityNotFound` when either endpoint is
    /// missing. `ingestion_time` is stamped here.
    pub async fn add_fact(&self, mut fact: SemanticFact) -> Result<Uuid> {
        fact.ingestion_time = self.clock.now();
        let id = self.graph.write().await.insert_fact(fact)?;
        debug!("Added fact {}", id);
        Ok(id)
    }

    /// Convenience for an open-ended fact starting now
    pub async fn assert_fact(
        &self,
        subject: &str,
        relationship: &str,
        object: &str,
        confidence: f32,
    ) -> Result<Uuid> {
        let fact = SemanticFact::new(subject, relationship, object, confidence, self.clock.now());
        self.add_fact(fact).await
    }

    pub async fn get_fact(&self, id: &Uuid) -> Option<SemanticFact> {
        self.graph.read().await.fact(id).cloned()
    }

    pub async fn query_facts(&self, query: &FactQuery) -> Vec<SemanticFact> {
        self.graph.read().await.query(query, self.clock.now())
    }

    /// Facts whose validity interval contains `as_of`
    pub async fn query_at_time(
        &self,
        entity: Option<&str>,
        relationship: Option<&str>,
        as_of: DateTime<Utc>,
    ) -> Vec<SemanticFact> {
        let query = FactQuery {
            entity: entity.map(str::to_string),
            relationship: relationship.map(str::to_string),
            as_of: Some(as_of),
            ..Default::default()
        };
        self.query_facts(&query).await
    }

    pub async fn query_current(
        &self,
        entity: Option<&str>,
        relationship: Option<&str>,
    ) -> Vec<SemanticFact> {
        self.query_at_time(entity, relationship, self.clock.now())
            .await
    }

    /// Current facts for a (subject, relationship) pair
    pub async fn current_for(&self, subject: &str, relationship: &str) -> Vec<SemanticFact> {
        self.graph
            .read()
            .await
            .current_for(subject, relationship)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Most recently learned current facts
    pub async fn recent_facts(&self, limit: usize) -> Vec<SemanticFact> {
        self.graph.read().await.recent_current(limit)
    }

    pub async fn traverse(&self, query: &TraversalQuery) -> Result<Vec<FactPath>> {
        self.graph.read().await.traverse(query, self.clock.now())
    }

    /// Logical update: close the current version and open a new one.
    /// Returns the id of the new version.
    pub async fn update_fact(&self, id: &Uuid, update: FactUpdate) -> Result<Uuid> {
        let now = self.clock.now();
        let effective = update.effective_at.unwrap_or(now);
        let mut graph = self.graph.write().await;

        let old = graph
            .fact(id)
            .cloned()
            .ok_or_else(|| MemoryError::Validation(format!("fact {id} does not exist")))?;
        if !old.is_current() {
            return Err(MemoryError::Validation(format!(
                "fact {id} is no longer current"
            )));
        }
        if effective <= old.event_time_start {
            return Err(MemoryError::Validation(
                "update must take effect after the current version started".to_string(),
            ));
        }

        let mut next = SemanticFact::new(
            old.subject.clone(),
            old.relationship_type.clone(),
            update.object.unwrap_or_else(|| old.object.clone()),
            update.confidence.unwrap_or(old.confidence),
            effective,
        );
        next.metadata = old.metadata.clone();
        next.metadata
            .insert("supersedes".to_string(), serde_json::json!(old.id));
        next.ingestion_time = now;

        // Validate the replacement before closing anything
        graph.check_fact(&next)?;
        graph.close_fact(id, effective)?;
        let new_id = graph.insert_fact(next)?;
        debug!("Fact {} superseded by {}", id, new_id);
        Ok(new_id)
    }

    /// Logical delete: close the validity interval, keeping history.
    /// Returns false when the fact was already closed.
    pub async fn delete_fact(&self, id: &Uuid, at: Option<DateTime<Utc>>) -> Result<bool> {
        let at = at.unwrap_or_else(|| self.clock.now());
        self.graph.write().await.close_fact(id, at)
    }

    /// Known entities mentioned in `text`.
    ///
    /// Capitalised mentions picked up by the [`RegexExtractor`] come first, in
    /// order of appearance; any other entity whose name occurs as a whole word
    /// follows in graph order.
    pub async fn find_mentioned_entities(&self, text: &str) -> Vec<String> {
        let haystack = text.to_lowercase();
        let graph = self.graph.read().await;
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        if let Some(extractor) = RegexExtractor::shared() {
            for mention in extractor.extract_entities(text) {
                let whole = graph.resolve(&mention.name);
                let words = mention.name.split_whitespace().filter_map(|w| graph.resolve(w));
                for idx in whole.into_iter().chain(words) {
                    if seen.insert(idx) {
                        found.push(graph.entities()[idx].id.clone());
                    }
                }
            }
        }

        for (idx, entity) in graph.entities().iter().enumerate() {
            if !seen.contains(&idx) && mentions(&haystack, &entity.id.to_lowercase()) {
                seen.insert(idx);
                found.push(entity.id.clone());
            }
        }
        found
    }

    /// Write the graph as JSON under `key`
    pub async fn snapshot(&self, persistence: &dyn StatePersistencePort, key: &str) -> Result<()> {
        let bytes = {
            let graph = self.graph.read().await;
            serde_json::to_vec(&graph.snapshot())?
        };
        persistence.set(key, &bytes).await?;
        info!("Saved graph snapshot ({} bytes) under '{}'", bytes.len(), key);
        Ok(())
    }

    /// Replace the graph with the snapshot stored under `key`.
    /// Returns false when no snapshot exists.
    pub async fn restore(&self, persistence: &dyn StatePersistencePort, key: &str) -> Result<bool> {
        let Some(bytes) = persistence.get(key).await? else {
            return Ok(false);
        };
        let snapshot: GraphSnapshot = serde_json::from_slice(&bytes)?;
        let restored = KnowledgeGraph::from_snapshot(snapshot)?;
        info!(
            "Restored graph snapshot: {} entities, {} facts",
            restored.entity_count(),
            restored.fact_count()
        );
        *self.graph.write().await = restored;
        Ok(true)
    }
}

fn mentions(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(start, _)| {
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        before_ok && after_ok
    })
}
