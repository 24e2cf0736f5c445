//! Episodic memory types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Who produced an interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

/// One recorded interaction.
///
/// Immutable once stored except for `consolidated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicEntry {
    pub id: Uuid,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub consolidated: bool,
}

impl EpisodicEntry {
    /// Create an entry with a fresh id. The timestamp is normally overwritten
    /// by the store's clock on insert.
    pub fn new(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            role,
            content: content.into(),
            embedding: None,
            metadata: HashMap::new(),
            consolidated: false,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Search request against the episodic store
#[derive(Debug, Clone, Default)]
pub struct EpisodicQuery {
    /// Semantic query text; `None` lists entries in time order
    pub text: Option<String>,
    /// Restrict to one session
    pub session_id: Option<String>,
    /// Maximum number of hits; `None` uses the configured default
    pub limit: Option<usize>,
    /// Minimum raw relevance, checked before boosting
    pub min_relevance: Option<f32>,
    /// Apply recency/frequency boosting
    pub temporal_boost: bool,
}

impl EpisodicQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn min_relevance(mut self, min: f32) -> Self {
        self.min_relevance = Some(min);
        self
    }

    pub fn boosted(mut self) -> Self {
        self.temporal_boost = true;
        self
    }
}

/// A scored search result
#[derive(Debug, Clone)]
pub struct EpisodicHit {
    pub entry: EpisodicEntry,
    /// Raw similarity in [0, 1]
    pub relevance: f32,
    /// Temporal multiplier applied (1.0 when boosting is off)
    pub temporal: f32,
    pub final_score: f32,
}
