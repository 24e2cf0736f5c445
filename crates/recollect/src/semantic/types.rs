//! Semantic memory types: entities, bi-temporal facts and query shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A node in the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Canonical name, e.g. "Rust" or "Paris"
    pub id: String,
    pub entity_type: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    pub valid_from: DateTime<Utc>,
    #[serde(default)]
    pub valid_to: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>, valid_from: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            properties: HashMap::new(),
            valid_from,
            valid_to: None,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// A directed, bi-temporal edge: `subject --relationship_type--> object`.
///
/// Event time (`event_time_start..event_time_end`) records when the fact was
/// true; `ingestion_time` records when it was learned and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticFact {
    pub id: Uuid,
    pub subject: String,
    pub object: String,
    pub relationship_type: String,
    pub confidence: f32,
    pub event_time_start: DateTime<Utc>,
    #[serde(default)]
    pub event_time_end: Option<DateTime<Utc>>,
    pub ingestion_time: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SemanticFact {
    /// New open-ended fact. `ingestion_time` is overwritten by the store.
    pub fn new(
        subject: impl Into<String>,
        relationship_type: impl Into<String>,
        object: impl Into<String>,
        confidence: f32,
        event_time_start: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            object: object.into(),
            relationship_type: relationship_type.into(),
            confidence,
            event_time_start,
            event_time_end: None,
            ingestion_time: event_time_start,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// `event_time_start <= t < event_time_end`
    pub fn is_valid_at(&self, t: DateTime<Utc>) -> bool {
        self.event_time_start <= t && self.event_time_end.is_none_or(|end| t < end)
    }

    pub fn is_current(&self) -> bool {
        self.event_time_end.is_none()
    }

    /// One-line rendering used in prompts and assembled context
    pub fn describe(&self) -> String {
        format!("{} {} {}", self.subject, self.relationship_type, self.object)
    }
}

/// Filters for [`super::SemanticGraphStore::query_facts`]
#[derive(Debug, Clone, Default)]
pub struct FactQuery {
    /// Match facts where this entity is subject or object
    pub entity: Option<String>,
    pub relationship: Option<String>,
    /// Point in event time; defaults to now
    pub as_of: Option<DateTime<Utc>>,
    /// Return every version regardless of validity
    pub include_history: bool,
    /// Only facts ingested at or before this instant
    pub known_at: Option<DateTime<Utc>>,
}

impl FactQuery {
    pub fn entity(entity: impl Into<String>) -> Self {
        Self {
            entity: Some(entity.into()),
            ..Default::default()
        }
    }

    pub fn relationship(mut self, relationship: impl Into<String>) -> Self {
        self.relationship = Some(relationship.into());
        self
    }

    pub fn as_of(mut self, t: DateTime<Utc>) -> Self {
        self.as_of = Some(t);
        self
    }

    pub fn with_history(mut self) -> Self {
        self.include_history = true;
        self
    }

    pub fn known_at(mut self, t: DateTime<Utc>) -> Self {
        self.known_at = Some(t);
        self
    }
}

/// Depth-first traversal request
#[derive(Debug, Clone)]
pub struct TraversalQuery {
    pub start: String,
    /// Allowed relationship types; `None` follows every edge
    pub relationship_types: Option<Vec<String>>,
    pub max_hops: usize,
    pub min_confidence: f32,
    /// Point in event time; defaults to now
    pub as_of: Option<DateTime<Utc>>,
}

impl TraversalQuery {
    pub fn new(start: impl Into<String>, max_hops: usize) -> Self {
        Self {
            start: start.into(),
            relationship_types: None,
            max_hops,
            min_confidence: 0.0,
            as_of: None,
        }
    }

    pub fn relationships<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relationship_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn min_confidence(mut self, min: f32) -> Self {
        self.min_confidence = min;
        self
    }

    pub fn as_of(mut self, t: DateTime<Utc>) -> Self {
        self.as_of = Some(t);
        self
    }
}

/// A sequence of facts where each object is the next subject
pub type FactPath = Vec<SemanticFact>;

/// Changes applied by a logical update
#[derive(Debug, Clone, Default)]
pub struct FactUpdate {
    pub object: Option<String>,
    pub confidence: Option<f32>,
    /// When the new version takes effect; defaults to now
    pub effective_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_validity_interval_is_half_open() {
        let t0 = Utc::now();
        let mut fact = SemanticFact::new("User", "likes", "tea", 0.9, t0);
        assert!(fact.is_valid_at(t0));
        assert!(!fact.is_valid_at(t0 - Duration::seconds(1)));

        fact.event_time_end = Some(t0 + Duration::days(1));
        assert!(fact.is_valid_at(t0 + Duration::hours(23)));
        assert!(!fact.is_valid_at(t0 + Duration::days(1)));
    }

    #[test]
    fn test_fact_serde_roundtrip_keeps_times() {
        let fact = SemanticFact::new("Rust", "is_a", "language", 0.8, Utc::now());
        let json = serde_json::to_string(&fact).unwrap();
        let back: SemanticFact = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fact);
    }
}
