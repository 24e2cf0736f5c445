//! Consolidation operations, states and reports

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One graph mutation proposed by the generation capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ConsolidationOperation {
    Add {
        subject: String,
        relationship: String,
        object: String,
        confidence: f32,
        reason: String,
    },
    /// Re-state `subject --relationship--> object` with a new confidence
    Update {
        subject: String,
        relationship: String,
        object: String,
        new_confidence: f32,
        reason: String,
    },
    Delete {
        subject: String,
        relationship: String,
        object: String,
        reason: String,
    },
    Noop {
        reason: String,
    },
}

impl ConsolidationOperation {
    pub fn noop(reason: impl Into<String>) -> Self {
        ConsolidationOperation::Noop {
            reason: reason.into(),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, ConsolidationOperation::Noop { .. })
    }

    /// Case-folded (subject, relationship, object) key, `None` for Noop
    pub fn key(&self) -> Option<(String, String, String)> {
        match self {
            ConsolidationOperation::Add {
                subject,
                relationship,
                object,
                ..
            }
            | ConsolidationOperation::Update {
                subject,
                relationship,
                object,
                ..
            }
            | ConsolidationOperation::Delete {
                subject,
                relationship,
                object,
                ..
            } => Some((
                subject.to_lowercase(),
                relationship.to_lowercase(),
                object.to_lowercase(),
            )),
            ConsolidationOperation::Noop { .. } => None,
        }
    }

    /// Confidence carried by the operation; Delete and Noop carry none
    pub fn confidence(&self) -> Option<f32> {
        match self {
            ConsolidationOperation::Add { confidence, .. } => Some(*confidence),
            ConsolidationOperation::Update { new_confidence, .. } => Some(*new_confidence),
            _ => None,
        }
    }

    /// Build an operation from loosely shaped model output.
    ///
    /// Accepts `op`, `operation`, `type` or `action` as the tag in any case,
    /// `relationship`/`relationship_type`/`predicate` for the edge label and
    /// `confidence`/`new_confidence` for the score.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let tag = ["op", "operation", "type", "action"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))?
            .to_lowercase();

        let text = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let number = |keys: &[&str]| -> Option<f32> {
            keys.iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_f64))
                .map(|f| f as f32)
        };
        let reason = text(&["reason", "rationale"]).unwrap_or_default();

        match tag.as_str() {
            "noop" | "none" => Some(ConsolidationOperation::Noop { reason }),
            "add" | "update" | "delete" => {
                let subject = text(&["subject", "source"])?;
                let relationship = text(&["relationship", "relationship_type", "predicate"])?;
                let object = text(&["object", "target"])?;
                match tag.as_str() {
                    "add" => Some(ConsolidationOperation::Add {
                        subject,
                        relationship,
                        object,
                        confidence: number(&["confidence"])?,
                        reason,
                    }),
                    "update" => Some(ConsolidationOperation::Update {
                        subject,
                        relationship,
                        object,
                        new_confidence: number(&["new_confidence", "confidence"])?,
                        reason,
                    }),
                    _ => Some(ConsolidationOperation::Delete {
                        subject,
                        relationship,
                        object,
                        reason,
                    }),
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for ConsolidationOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsolidationOperation::Add {
                subject,
                relationship,
                object,
                confidence,
                ..
            } => write!(f, "ADD {subject} {relationship} {object} ({confidence:.2})"),
            ConsolidationOperation::Update {
                subject,
                relationship,
                object,
                new_confidence,
                ..
            } => write!(f, "UPDATE {subject} {relationship} {object} ({new_confidence:.2})"),
            ConsolidationOperation::Delete {
                subject,
                relationship,
                object,
                ..
            } => write!(f, "DELETE {subject} {relationship} {object}"),
            ConsolidationOperation::Noop { reason } => write!(f, "NOOP {reason}"),
        }
    }
}

/// How a consolidation pass was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationMode {
    /// Drain every pending entry now, queueing behind a running pass
    Immediate,
    /// Run only when a full batch is pending; skip if a pass is running
    Background,
    /// Process one batch, queueing behind a running pass
    Manual,
}

/// Per-session engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationState {
    Idle,
    Analyzing,
    Applying,
}

/// Counts of what `apply` did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub noops: usize,
    /// Operations dropped by validation or collapsed as duplicates
    pub skipped: usize,
}

impl ApplyStats {
    pub fn merge(&mut self, other: ApplyStats) {
        self.added += other.added;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.noops += other.noops;
        self.skipped += other.skipped;
    }

    /// Operations that changed the graph
    pub fn mutations(&self) -> usize {
        self.added + self.updated + self.deleted
    }
}

/// Outcome of one `consolidate` call
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationReport {
    pub session_id: String,
    pub mode: ConsolidationMode,
    pub batches: usize,
    pub entries_processed: usize,
    /// Normalised operations in application order
    pub operations: Vec<ConsolidationOperation>,
    pub stats: ApplyStats,
    /// Set when the pass did not run (below threshold, session busy)
    pub skipped_reason: Option<String>,
    pub duration_ms: u64,
}

impl ConsolidationReport {
    pub fn new(session_id: &str, mode: ConsolidationMode) -> Self {
        Self {
            session_id: session_id.to_string(),
            mode,
            batches: 0,
            entries_processed: 0,
            operations: Vec::new(),
            stats: ApplyStats::default(),
            skipped_reason: None,
            duration_ms: 0,
        }
    }

    pub fn skipped(session_id: &str, mode: ConsolidationMode, reason: impl Into<String>) -> Self {
        let mut report = Self::new(session_id, mode);
        report.skipped_reason = Some(reason.into());
        report
    }

    /// True when every operation is a Noop
    pub fn all_noop(&self) -> bool {
        self.operations.iter().all(ConsolidationOperation::is_noop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_accepts_aliases() {
        let op = ConsolidationOperation::from_value(&json!({
            "operation": "ADD",
            "subject": "Rust",
            "predicate": "is_a",
            "object": "systems language",
            "confidence": 0.9
        }))
        .unwrap();
        assert_eq!(
            op,
            ConsolidationOperation::Add {
                subject: "Rust".into(),
                relationship: "is_a".into(),
                object: "systems language".into(),
                confidence: 0.9,
                reason: String::new(),
            }
        );
    }

    #[test]
    fn test_from_value_rejects_incomplete() {
        assert!(ConsolidationOperation::from_value(&json!({"op": "add", "subject": "x"})).is_none());
        assert!(ConsolidationOperation::from_value(&json!({"op": "merge"})).is_none());
        assert!(ConsolidationOperation::from_value(&json!("add")).is_none());
    }

    #[test]
    fn test_update_falls_back_to_confidence_field() {
        let op = ConsolidationOperation::from_value(&json!({
            "op": "update", "subject": "a", "relationship": "r", "object": "b", "confidence": 0.4
        }))
        .unwrap();
        assert_eq!(op.confidence(), Some(0.4));
    }

    #[test]
    fn test_serde_tagging() {
        let op = ConsolidationOperation::noop("nothing new");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json, json!({"op": "noop", "reason": "nothing new"}));
    }
}
