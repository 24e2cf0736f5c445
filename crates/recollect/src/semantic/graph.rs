//! Arena-backed knowledge graph
//!
//! Entities and facts live in flat vectors and refer to each other by index.
//! Facts are never removed, so indices stay valid for the lifetime of the
//! graph; logical deletion only closes a fact's validity interval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

use crate::error::{MemoryError, Result};

use super::types::{Entity, FactPath, FactQuery, SemanticFact, TraversalQuery};

/// Upper bound on emitted traversal paths
const MAX_PATHS: usize = 10_000;

/// Serialized form used for snapshots
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub entities: Vec<Entity>,
    pub facts: Vec<SemanticFact>,
}

#[derive(Debug, Default)]
pub struct KnowledgeGraph {
    entities: Vec<Entity>,
    by_id: HashMap<String, usize>,
    by_folded: HashMap<String, usize>,
    facts: Vec<SemanticFact>,
    fact_index: HashMap<Uuid, usize>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    /// Resolve a name to its arena index: exact id first, then case-insensitive
    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.by_id
            .get(name)
            .or_else(|| self.by_folded.get(&name.to_lowercase()))
            .copied()
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.resolve(name).map(|i| &self.entities[i])
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn fact(&self, id: &Uuid) -> Option<&SemanticFact> {
        self.fact_index.get(id).map(|&i| &self.facts[i])
    }

    /// Insert an entity, or merge properties into the existing one.
    /// Returns the canonical id.
    pub fn upsert_entity(&mut self, entity: Entity) -> String {
        if let Some(idx) = self.resolve(&entity.id) {
            let existing = &mut self.entities[idx];
            existing.properties.extend(entity.properties);
            return existing.id.clone();
        }
        let idx = self.entities.len();
        self.by_id.insert(entity.id.clone(), idx);
        self.by_folded.entry(entity.id.to_lowercase()).or_insert(idx);
        let id = entity.id.clone();
        self.entities.push(entity);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        id
    }

    /// Check a fact's shape and endpoints without mutating anything.
    /// Returns the canonical (subject, object) ids.
    pub fn check_fact(&self, fact: &SemanticFact) -> Result<(String, String)> {
        if !(0.0..=1.0).contains(&fact.confidence) {
            return Err(MemoryError::Validation(format!(
                "confidence must be within [0, 1], got {}",
                fact.confidence
            )));
        }
        if fact.relationship_type.trim().is_empty() {
            return Err(MemoryError::Validation(
                "relationship_type must not be empty".to_string(),
            ));
        }
        if let Some(end) = fact.event_time_end {
            if end <= fact.event_time_start {
                return Err(MemoryError::Validation(
                    "event_time_end must be after event_time_start".to_string(),
                ));
            }
        }
        if self.fact_index.contains_key(&fact.id) {
            return Err(MemoryError::Validation(format!(
                "fact {} already exists",
                fact.id
            )));
        }
        let subject = self
            .resolve(&fact.subject)
            .ok_or_else(|| MemoryError::EntityNotFound(fact.subject.clone()))?;
        let object = self
            .resolve(&fact.object)
            .ok_or_else(|| MemoryError::EntityNotFound(fact.object.clone()))?;
        Ok((
            self.entities[subject].id.clone(),
            self.entities[object].id.clone(),
        ))
    }

    /// Add a fact after [`Self::check_fact`] succeeds
    pub fn insert_fact(&mut self, mut fact: SemanticFact) -> Result<Uuid> {
        let (subject, object) = self.check_fact(&fact)?;
        fact.subject = subject;
        fact.object = object;
        let s = self.by_id[&fact.subject];
        let o = self.by_id[&fact.object];
        let idx = self.facts.len();
        let id = fact.id;
        self.fact_index.insert(id, idx);
        self.facts.push(fact);
        self.outgoing[s].push(idx);
        self.incoming[o].push(idx);
        Ok(id)
    }

    /// Close a fact's validity interval. Closing an already closed fact is a no-op.
    pub fn close_fact(&mut self, id: &Uuid, at: DateTime<Utc>) -> Result<bool> {
        let idx = *self
            .fact_index
            .get(id)
            .ok_or_else(|| MemoryError::Validation(format!("fact {id} does not exist")))?;
        let fact = &mut self.facts[idx];
        if fact.event_time_end.is_some() {
            return Ok(false);
        }
        if at <= fact.event_time_start {
            return Err(MemoryError::Validation(format!(
                "cannot close fact {id} at or before its start"
            )));
        }
        fact.event_time_end = Some(at);
        Ok(true)
    }

    /// Facts matching `query`, ordered by event start then ingestion time
    pub fn query(&self, query: &FactQuery, now: DateTime<Utc>) -> Vec<SemanticFact> {
        let as_of = query.as_of.unwrap_or(now);

        let candidates: Box<dyn Iterator<Item = &SemanticFact> + '_> = match &query.entity {
            Some(name) => match self.resolve(name) {
                Some(idx) => Box::new(
                    self.outgoing[idx]
                        .iter()
                        .chain(self.incoming[idx].iter())
                        .map(|&f| &self.facts[f]),
                ),
                None => return Vec::new(),
            },
            None => Box::new(self.facts.iter()),
        };

        let mut out: Vec<SemanticFact> = candidates
            .filter(|f| {
                query
                    .relationship
                    .as_deref()
                    .is_none_or(|r| f.relationship_type.eq_ignore_ascii_case(r))
            })
            .filter(|f| query.include_history || f.is_valid_at(as_of))
            .filter(|f| query.known_at.is_none_or(|k| f.ingestion_time <= k))
            .cloned()
            .collect();

        // A self-loop appears in both adjacency lists
        out.sort_by(|a, b| {
            a.event_time_start
                .cmp(&b.event_time_start)
                .then(a.ingestion_time.cmp(&b.ingestion_time))
                .then(a.id.cmp(&b.id))
        });
        out.dedup_by_key(|f| f.id);
        out
    }

    /// Current facts with the given subject and relationship
    pub fn current_for(&self, subject: &str, relationship: &str) -> Vec<&SemanticFact> {
        let Some(idx) = self.resolve(subject) else {
            return Vec::new();
        };
        self.outgoing[idx]
            .iter()
            .map(|&f| &self.facts[f])
            .filter(|f| f.is_current() && f.relationship_type.eq_ignore_ascii_case(relationship))
            .collect()
    }

    /// Most recently learned current facts
    pub fn recent_current(&self, limit: usize) -> Vec<SemanticFact> {
        let mut current: Vec<&SemanticFact> = self.facts.iter().filter(|f| f.is_current()).collect();
        current.sort_by(|a, b| b.ingestion_time.cmp(&a.ingestion_time));
        current.into_iter().take(limit).cloned().collect()
    }

    /// Depth-first enumeration of outgoing paths from `query.start`.
    ///
    /// A node is marked visited only while it is on the current branch and
    /// released on backtrack, so disjoint branches may pass through the same
    /// node while cycles are still cut.
    pub fn traverse(&self, query: &TraversalQuery, now: DateTime<Utc>) -> Result<Vec<FactPath>> {
        if query.max_hops == 0 {
            return Err(MemoryError::Validation(
                "max_hops must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&query.min_confidence) {
            return Err(MemoryError::Validation(format!(
                "min_confidence must be within [0, 1], got {}",
                query.min_confidence
            )));
        }
        let start = self
            .resolve(&query.start)
            .ok_or_else(|| MemoryError::EntityNotFound(query.start.clone()))?;

        let walk = Walk {
            graph: self,
            query,
            as_of: query.as_of.unwrap_or(now),
        };
        let mut on_path = vec![false; self.entities.len()];
        let mut path: Vec<usize> = Vec::new();
        let mut out: Vec<FactPath> = Vec::new();
        on_path[start] = true;
        walk.visit(start, &mut on_path, &mut path, &mut out);

        if out.len() >= MAX_PATHS {
            warn!(
                "Traversal from {} hit the {} path limit; results truncated",
                query.start, MAX_PATHS
            );
        }
        Ok(out)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            entities: self.entities.clone(),
            facts: self.facts.clone(),
        }
    }

    /// Rebuild a graph from a snapshot, re-checking referential integrity
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        let mut graph = Self::new();
        for entity in snapshot.entities {
            graph.upsert_entity(entity);
        }
        for fact in snapshot.facts {
            let end = fact.event_time_end;
            let mut open = fact;
            open.event_time_end = None;
            let id = graph.insert_fact(open)?;
            if let Some(end) = end {
                let idx = graph.fact_index[&id];
                graph.facts[idx].event_time_end = Some(end);
            }
        }
        Ok(graph)
    }
}

struct Walk<'a> {
    graph: &'a KnowledgeGraph,
    query: &'a TraversalQuery,
    as_of: DateTime<Utc>,
}

impl Walk<'_> {
    fn allowed(&self, fact: &SemanticFact) -> bool {
        fact.confidence >= self.query.min_confidence
            && fact.is_valid_at(self.as_of)
            && self.query.relationship_types.as_ref().is_none_or(|types| {
                types
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(&fact.relationship_type))
            })
    }

    fn visit(
        &self,
        node: usize,
        on_path: &mut [bool],
        path: &mut Vec<usize>,
        out: &mut Vec<FactPath>,
    ) {
        for &fact_idx in &self.graph.outgoing[node] {
            if out.len() >= MAX_PATHS {
                return;
            }
            let fact = &self.graph.facts[fact_idx];
            if !self.allowed(fact) {
                continue;
            }
            let next = self.graph.by_id[&fact.object];
            if on_path[next] {
                continue;
            }

            path.push(fact_idx);
            out.push(path.iter().map(|&i| self.graph.facts[i].clone()).collect());
            if path.len() < self.query.max_hops {
                on_path[next] = true;
                self.visit(next, on_path, path, out);
                on_path[next] = false;
            }
            path.pop();
        }
    }
}
