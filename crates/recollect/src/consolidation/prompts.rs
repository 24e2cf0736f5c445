//! Consolidation prompt and response parsing

use serde_json::Value;
use tracing::warn;

use crate::episodic::EpisodicEntry;
use crate::error::{MemoryError, Result};
use crate::semantic::SemanticFact;

use super::types::ConsolidationOperation;

/// Prompt asking the model to turn recent interactions into graph operations
///
/// Placeholders: {entries} - numbered episodic entries, {facts} - current facts
pub const CONSOLIDATION_PROMPT: &str = r#"You maintain a knowledge graph of durable facts learned from conversations.

Read the recent conversation entries and the facts already known, then decide how the graph should change.

Recent conversation entries:
{entries}

Facts currently known:
{facts}

For every durable fact the entries state or imply, emit exactly one operation:
- "add": a new fact that is not already known
- "update": a known fact whose object or confidence has changed
- "delete": a known fact the entries contradict or retract
- "noop": nothing new to record

Guidelines:
- Use short snake_case relationship names such as "is_a", "has_feature", "located_in", "prefers".
- Use canonical entity names ("Rust", not "the Rust language").
- Confidence is a number from 0.0 to 1.0 reflecting how clearly the entries support the fact.
- Do not repeat facts that are already known unless they changed.
- Ignore greetings, small talk and transient details.

Respond with a JSON array in this exact format:
[
  {"op": "add", "subject": "Rust", "relationship": "is_a", "object": "systems language", "confidence": 0.9, "reason": "stated directly"},
  {"op": "update", "subject": "User", "relationship": "favorite_color", "object": "green", "new_confidence": 0.8, "reason": "user changed preference"},
  {"op": "delete", "subject": "User", "relationship": "lives_in", "object": "Berlin", "reason": "user moved"},
  {"op": "noop", "reason": "nothing durable"}
]

Only include the JSON array, no other text."#;

/// Render the consolidation prompt for a batch
pub fn build_prompt(entries: &[EpisodicEntry], facts: &[SemanticFact]) -> String {
    let entries_text = entries
        .iter()
        .enumerate()
        .map(|(i, e)| {
            format!(
                "{}. [{}] {}: {}",
                i + 1,
                e.timestamp.format("%Y-%m-%d %H:%M"),
                e.role,
                e.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let facts_text = if facts.is_empty() {
        "(none)".to_string()
    } else {
        facts
            .iter()
            .map(|f| format!("- {} (confidence {:.2})", f.describe(), f.confidence))
            .collect::<Vec<_>>()
            .join("\n")
    };

    CONSOLIDATION_PROMPT
        .replace("{entries}", &entries_text)
        .replace("{facts}", &facts_text)
}

/// Cut a JSON payload out of a model response: fenced block, bare array, or object
fn extract_json_from_response(content: &str) -> &str {
    let mut trimmed = content.trim();

    if let Some(fence) = trimmed.find("```") {
        let after = &trimmed[fence + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            trimmed = body[..end].trim();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            let array = &trimmed[start..=end];
            // An object wrapping an array keeps its braces
            let object_first = trimmed.find('{').is_some_and(|b| b < start);
            if !object_first {
                return array;
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }

    trimmed
}

/// Parse a model response into operations.
///
/// Individually malformed operations are skipped; a response without any
/// parseable array is a `GenerationParse` error.
pub fn parse_operations(response: &str) -> Result<Vec<ConsolidationOperation>> {
    let payload = extract_json_from_response(response);
    let value: Value = serde_json::from_str(payload).map_err(|e| {
        MemoryError::GenerationParse(format!("consolidation response is not JSON: {e}"))
    })?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("operations") {
            Some(Value::Array(items)) => items,
            // A lone operation object
            _ => {
                let single = Value::Object(obj);
                return ConsolidationOperation::from_value(&single)
                    .map(|op| vec![op])
                    .ok_or_else(|| {
                        MemoryError::GenerationParse(
                            "consolidation response has no operations array".to_string(),
                        )
                    });
            }
        },
        _ => {
            return Err(MemoryError::GenerationParse(
                "consolidation response is not an array".to_string(),
            ));
        }
    };

    let mut operations = Vec::with_capacity(items.len());
    for item in &items {
        match ConsolidationOperation::from_value(item) {
            Some(op) => operations.push(op),
            None => warn!("Skipping malformed consolidation operation: {}", item),
        }
    }
    Ok(operations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episodic::Role;

    #[test]
    fn test_parse_clean_array() {
        let ops = parse_operations(
            r#"[{"op":"add","subject":"Rust","relationship":"is_a","object":"language","confidence":0.9,"reason":"r"},{"op":"noop","reason":"x"}]"#,
        )
        .unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops[1].is_noop());
    }

    #[test]
    fn test_parse_fenced_with_prose() {
        let response = "Here you go:\n```json\n[{\"op\":\"noop\",\"reason\":\"nothing\"}]\n```\nThanks!";
        let ops = parse_operations(response).unwrap();
        assert_eq!(ops, vec![ConsolidationOperation::noop("nothing")]);
    }

    #[test]
    fn test_parse_operations_object() {
        let response = r#"{"operations": [{"op":"delete","subject":"a","relationship":"r","object":"b"}]}"#;
        let ops = parse_operations(response).unwrap();
        assert!(matches!(ops[0], ConsolidationOperation::Delete { .. }));
    }

    #[test]
    fn test_parse_skips_malformed_items() {
        let response = r#"[{"op":"add","subject":"a"},{"op":"noop"},42]"#;
        let ops = parse_operations(response).unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_operations("I could not find any facts.").unwrap_err();
        assert!(matches!(err, MemoryError::GenerationParse(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_parse_empty_array() {
        assert!(parse_operations("[]").unwrap().is_empty());
    }

    #[test]
    fn test_build_prompt_fills_placeholders() {
        let entry = EpisodicEntry::new("s1", Role::User, "Rust has ownership");
        let prompt = build_prompt(&[entry], &[]);
        assert!(prompt.contains("1. ["));
        assert!(prompt.contains("user: Rust has ownership"));
        assert!(prompt.contains("(none)"));
        assert!(!prompt.contains("{entries}"));
        assert!(!prompt.contains("{facts}"));
    }
}
