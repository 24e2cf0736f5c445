//! Pattern-based entity and relationship extraction
//!
//! A cheap, model-free reader for text that needs no generation capability.
//! Recognised relationship shapes:
//!
//! - "X is a Y" -> (X, `is_a`, Y)
//! - "X has Y" -> (X, `has_feature`, Y)
//! - "X in Y" -> (X, `located_in`, Y)
//! - "y of X" -> (y, `part_of`, X)
//!
//! Entities are capitalised words or phrases. Precision is favoured over
//! recall: anything starting with a stopword is discarded.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::error::{MemoryError, Result};

const IS_A: &str = r"\b([A-Z][a-zA-Z0-9]+(?:\s+[A-Z][a-zA-Z0-9]+)*)\s+is\s+an?\s+((?:[a-z]+[\s-]+)*?(?:language|system|tool|framework|library|platform|service|application|database|protocol))\b";
const HAS: &str = r"\b([A-Z][a-zA-Z0-9]+(?:\s+[A-Z][a-zA-Z0-9]+)*)\s+has\s+((?:[a-z]+[\s-]+)*?(?:safety|feature|features|capability|support|property|typing|abstractions|performance|concurrency|ownership))\b";
const IN: &str = r"\b([A-Z][a-zA-Z0-9]+(?:\s+[A-Z][a-zA-Z0-9]+)*)\s+in\s+([A-Z][a-zA-Z0-9]+(?:\s+[A-Z][a-zA-Z0-9]+)*)\b";
const OF: &str = r"\b([a-z]+)\s+of\s+([A-Z][a-zA-Z0-9]+(?:\s+[A-Z][a-zA-Z0-9]+)*)\b";
const ENTITY: &str = r"\b([A-Z][a-zA-Z0-9]*(?:\s+[A-Z][a-zA-Z0-9]*)*)\b";

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "because",
    "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has", "have", "he",
    "her", "here", "his", "how", "however", "i", "if", "in", "is", "it", "its", "just", "me", "my",
    "no", "not", "noted", "of", "ok", "okay", "on", "or", "our", "she", "so", "sure", "than",
    "thanks", "that", "the", "their", "them", "then", "there", "these", "they", "this", "those",
    "to", "too", "us", "was", "we", "well", "were", "what", "when", "where", "which", "who", "why",
    "will", "with", "would", "yes", "you", "your",
];

/// An entity mention found in text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
}

/// A (subject, relationship, object) triple found in text
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtractedRelationship {
    pub subject: String,
    pub relationship: String,
    pub object: String,
}

pub struct RegexExtractor {
    entity: Regex,
    relationships: Vec<(&'static str, Regex)>,
    min_entity_len: usize,
}

static SHARED: LazyLock<Option<RegexExtractor>> = LazyLock::new(|| match RegexExtractor::new() {
    Ok(extractor) => Some(extractor),
    Err(e) => {
        warn!("Pattern extraction disabled: {}", e);
        None
    }
});

impl RegexExtractor {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| MemoryError::Config(format!("invalid extraction pattern: {e}")))
        };
        Ok(Self {
            entity: compile(ENTITY)?,
            relationships: vec![
                ("is_a", compile(IS_A)?),
                ("has_feature", compile(HAS)?),
                ("located_in", compile(IN)?),
                ("part_of", compile(OF)?),
            ],
            min_entity_len: 2,
        })
    }

    /// Process-wide instance, compiled on first use
    pub fn shared() -> Option<&'static RegexExtractor> {
        SHARED.as_ref()
    }

    /// Capitalised mentions, deduplicated in order of appearance
    pub fn extract_entities(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for cap in self.entity.captures_iter(text) {
            let name = cap[1].trim();
            if !self.keep_entity(name) || !seen.insert(name.to_string()) {
                continue;
            }
            out.push(ExtractedEntity {
                name: name.to_string(),
                entity_type: infer_entity_type(text, name).to_string(),
            });
        }
        debug!("Extracted {} entities from {} chars", out.len(), text.chars().count());
        out
    }

    /// Relationship triples in pattern order, deduplicated
    pub fn extract_relationships(&self, text: &str) -> Vec<ExtractedRelationship> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (relationship, pattern) in &self.relationships {
            for cap in pattern.captures_iter(text) {
                let subject = cap[1].trim();
                let object = cap[2].trim();
                if is_stopword(first_word(subject)) || is_stopword(first_word(object)) {
                    continue;
                }
                let triple = ExtractedRelationship {
                    subject: subject.to_string(),
                    relationship: (*relationship).to_string(),
                    object: object.to_string(),
                };
                if seen.insert(triple.clone()) {
                    out.push(triple);
                }
            }
        }
        debug!("Extracted {} relationships", out.len());
        out
    }

    fn keep_entity(&self, name: &str) -> bool {
        name.chars().count() >= self.min_entity_len
            && !is_stopword(name)
            && !is_stopword(first_word(name))
            && !(name.chars().all(char::is_uppercase) && name.chars().count() < 3)
    }
}

fn first_word(text: &str) -> &str {
    text.split_whitespace().next().unwrap_or(text)
}

fn is_stopword(word: &str) -> bool {
    let lower = word.to_lowercase();
    STOPWORDS.binary_search(&lower.as_str()).is_ok()
}

fn infer_entity_type(text: &str, name: &str) -> &'static str {
    let context = text.to_lowercase();
    let name = name.to_lowercase();
    for kind in ["language", "system", "tool", "framework", "library", "database"] {
        if context.contains(&format!("{name} is a {kind}"))
            || context.contains(&format!("{name} {kind}"))
            || (context.contains(&format!("{name} is a")) && context.contains(&format!(" {kind}")))
        {
            return kind;
        }
    }
    "entity"
}
