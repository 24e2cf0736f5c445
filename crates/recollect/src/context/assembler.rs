//! Final context formatting under a hard token budget
//!
//! Output groups candidates by provenance with the query last:
//!
//! ```text
//! <context>
//! <episodic>
//! [2024-01-15 10:30] User prefers dark mode
//! </episodic>
//! <semantic>
//! - User prefers dark_mode (confidence=0.90)
//! </semantic>
//! <procedural>
//! - When asked about themes: mention dark mode (confidence=0.80)
//! </procedural>
//! <query>
//! what theme should I use?
//! </query>
//! </context>
//! ```

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{MemoryError, Result};

use super::tokens::{estimate_tokens, truncate_to_tokens};
use super::types::{Candidate, CandidateSource};

/// Smallest budget `assemble` accepts
pub const MIN_TOKEN_BUDGET: usize = 100;

/// A candidate is only clipped into the leftover room if at least this many
/// characters of it fit
const MIN_PARTIAL_CHARS: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssembledContext {
    pub context: String,
    pub tokens: usize,
    /// Candidates that made it into the context
    pub items: usize,
    /// Candidates dropped to meet the budget
    pub dropped: usize,
    /// The last included candidate was cut to fill the remaining budget
    pub clipped: bool,
    /// The query had to be cut
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Assembler;

impl Assembler {
    pub fn new() -> Self {
        Self
    }

    /// Tokens used by the markers and the query alone
    pub fn overhead_tokens(&self, query: &str) -> usize {
        estimate_tokens(&render(&[], query, false))
    }

    /// Format `candidates` and `query`, guaranteeing `tokens <= token_budget`.
    ///
    /// Least relevant candidates are dropped first. The most relevant of the
    /// dropped ones is then clipped to fill whatever room is left. If the
    /// query alone does not fit it is cut.
    pub fn assemble(
        &self,
        candidates: &[Candidate],
        query: &str,
        include_confidence: bool,
        token_budget: usize,
    ) -> Result<AssembledContext> {
        if token_budget < MIN_TOKEN_BUDGET {
            return Err(MemoryError::Validation(format!(
                "token budget must be at least {MIN_TOKEN_BUDGET}, got {token_budget}"
            )));
        }

        // Most relevant first, so dropping from the tail removes the least relevant
        let mut ranked: Vec<&Candidate> = candidates.iter().collect();
        ranked.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut kept = ranked.len();
        let mut context = render(&ranked, query, include_confidence);
        while estimate_tokens(&context) > token_budget && kept > 0 {
            kept -= 1;
            context = render(&ranked[..kept], query, include_confidence);
        }

        let mut items = kept;
        let mut clipped = false;
        if kept < ranked.len() && estimate_tokens(&context) <= token_budget {
            if let Some(filled) =
                fill_remaining(&ranked[..kept], ranked[kept], query, include_confidence, token_budget)
            {
                debug!("Clipped candidate {} to fill the remaining budget", kept);
                context = filled;
                items += 1;
                clipped = true;
            }
        }

        let mut truncated = false;
        if estimate_tokens(&context) > token_budget {
            let overhead = estimate_tokens(&render(&[], "", include_confidence));
            let room = token_budget.saturating_sub(overhead + 1);
            let cut = truncate_to_tokens(query, room);
            warn!(
                "Query alone exceeds the {} token budget, truncating it to {} tokens",
                token_budget, room
            );
            context = render(&[], cut, include_confidence);
            truncated = true;
        }

        let dropped = candidates.len() - items;
        if dropped > 0 {
            debug!("Dropped {} least relevant candidates to fit {} tokens", dropped, token_budget);
        }

        Ok(AssembledContext {
            tokens: estimate_tokens(&context),
            context,
            items,
            dropped,
            clipped,
            truncated,
        })
    }
}

/// Render `kept` plus the longest prefix of `next` that stays within budget
fn fill_remaining(
    kept: &[&Candidate],
    next: &Candidate,
    query: &str,
    include_confidence: bool,
    token_budget: usize,
) -> Option<String> {
    let total = next.content.chars().count();
    if total <= MIN_PARTIAL_CHARS {
        return None;
    }
    let attempt = |chars: usize| {
        let mut partial = next.clone();
        partial.content = clip_chars(&next.content, chars);
        let mut items = kept.to_vec();
        items.push(&partial);
        let out = render(&items, query, include_confidence);
        (estimate_tokens(&out) <= token_budget).then_some(out)
    };

    let (mut lo, mut hi) = (MIN_PARTIAL_CHARS, total - 1);
    let mut best = attempt(lo)?;
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        match attempt(mid) {
            Some(out) => {
                best = out;
                lo = mid;
            }
            None => hi = mid - 1,
        }
    }
    Some(best)
}

/// First `chars` characters of `text` followed by an ellipsis
fn clip_chars(text: &str, chars: usize) -> String {
    match text.char_indices().nth(chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

fn render(candidates: &[&Candidate], query: &str, include_confidence: bool) -> String {
    let mut out = String::from("<context>\n");

    let mut episodic: Vec<&Candidate> = candidates
        .iter()
        .copied()
        .filter(|c| c.source == CandidateSource::Episodic)
        .collect();
    // Narrative order, oldest first
    episodic.sort_by_key(|c| c.timestamp);
    push_section(&mut out, CandidateSource::Episodic, &episodic, include_confidence);

    for source in [CandidateSource::Semantic, CandidateSource::Procedural] {
        let items: Vec<&Candidate> = candidates
            .iter()
            .copied()
            .filter(|c| c.source == source)
            .collect();
        push_section(&mut out, source, &items, include_confidence);
    }

    out.push_str("<query>\n");
    out.push_str(query);
    out.push_str("\n</query>\n</context>");
    out
}

fn push_section(out: &mut String, source: CandidateSource, items: &[&Candidate], include_confidence: bool) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("<{source}>\n"));
    for item in items {
        let line = match (source, item.timestamp) {
            (CandidateSource::Episodic, Some(ts)) => {
                format!("[{}] {}", ts.format("%Y-%m-%d %H:%M"), item.content)
            }
            (CandidateSource::Episodic, None) => item.content.clone(),
            _ => format!("- {}", item.content),
        };
        out.push_str(&line);
        if include_confidence {
            if let Some(confidence) = item.confidence {
                out.push_str(&format!(" (confidence={confidence:.2})"));
            }
        }
        out.push('\n');
    }
    out.push_str(&format!("</{source}>\n"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn episodic(content: &str, hour: u32, score: f32) -> Candidate {
        Candidate::new(content, CandidateSource::Episodic, score)
            .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 15, hour, 0, 0).unwrap())
    }

    #[test]
    fn test_sections_and_order() {
        let candidates = vec![
            episodic("later message", 12, 0.9),
            episodic("earlier message", 9, 0.4),
            Candidate::new("User likes tea", CandidateSource::Semantic, 0.8).with_confidence(0.9),
            Candidate::new("When greeting: be brief", CandidateSource::Procedural, 0.7),
        ];
        let out = Assembler::new()
            .assemble(&candidates, "what do I like?", true, 1000)
            .unwrap();

        let ctx = &out.context;
        let earlier = ctx.find("earlier message").unwrap();
        let later = ctx.find("later message").unwrap();
        assert!(earlier < later);
        assert!(ctx.find("<episodic>").unwrap() < ctx.find("<semantic>").unwrap());
        assert!(ctx.find("<semantic>").unwrap() < ctx.find("<procedural>").unwrap());
        assert!(ctx.contains("- User likes tea (confidence=0.90)"));
        assert!(ctx.trim_end().ends_with("what do I like?\n</query>\n</context>"));
        assert_eq!(out.items, 4);
        assert_eq!(out.tokens, estimate_tokens(ctx));
    }

    #[test]
    fn test_confidence_can_be_omitted() {
        let candidates =
            vec![Candidate::new("User likes tea", CandidateSource::Semantic, 0.8).with_confidence(0.9)];
        let out = Assembler::new().assemble(&candidates, "q", false, 200).unwrap();
        assert!(!out.context.contains("confidence"));
    }

    #[test]
    fn test_drops_least_relevant_to_fit() {
        let filler = "x".repeat(200);
        let candidates: Vec<Candidate> = (0..20)
            .map(|i| Candidate::new(format!("{i} {filler}"), CandidateSource::Semantic, i as f32 / 20.0))
            .collect();
        let out = Assembler::new().assemble(&candidates, "q", false, 300).unwrap();
        assert!(out.tokens <= 300);
        assert!(out.dropped > 0);
        // The most relevant candidate survives
        assert!(out.context.contains(&format!("19 {filler}")));
        assert!(!out.context.contains(&format!("- 0 {filler}")));
    }

    #[test]
    fn test_oversized_candidate_is_clipped_into_budget() {
        let long = "é".repeat(800) + &"z".repeat(2400);
        let candidates = vec![Candidate::new(long.clone(), CandidateSource::Semantic, 0.9)];
        let out = Assembler::new().assemble(&candidates, "q", false, 200).unwrap();

        assert_eq!(out.items, 1);
        assert_eq!(out.dropped, 0);
        assert!(out.clipped);
        assert!(out.tokens <= 200);
        assert!(out.context.contains(&format!("- {}", "é".repeat(MIN_PARTIAL_CHARS))));
        assert!(out.context.contains("..."));
        // Clipping leaves little room unused
        assert!(out.tokens >= 195, "only {} tokens used", out.tokens);
    }

    #[test]
    fn test_short_leftover_is_not_clipped() {
        let candidates = vec![
            Candidate::new("a".repeat(724), CandidateSource::Semantic, 0.9),
            Candidate::new("tiny ".repeat(4), CandidateSource::Semantic, 0.1),
        ];
        let out = Assembler::new().assemble(&candidates, "q", false, 200).unwrap();
        assert!(out.tokens <= 200);
        assert_eq!((out.items, out.clipped), (1, false));
        assert!(!out.context.contains("tiny"));
    }

    #[test]
    fn test_budget_holds_for_any_budget_above_floor() {
        let candidates: Vec<Candidate> = (0..30)
            .map(|i| episodic(&"word ".repeat(10 + i * 7), (i % 24) as u32, 0.5))
            .collect();
        let long_query = "why ".repeat(300);
        for budget in [100, 101, 150, 257, 400, 1000, 5000] {
            for query in ["short", long_query.as_str()] {
                let out = Assembler::new().assemble(&candidates, query, true, budget).unwrap();
                assert!(out.tokens <= budget, "budget {budget}: {} tokens", out.tokens);
            }
        }
    }

    #[test]
    fn test_rejects_budget_below_floor() {
        let err = Assembler::new().assemble(&[], "q", true, 99).unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }
}
