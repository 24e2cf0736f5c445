//! Token estimation and text splitting helpers
//!
//! Token counts use the characters/4 approximation, rounded up so that an
//! estimate never undercounts a non-empty text.

/// Approximate tokens in `text`
#[inline]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Largest prefix of `text` whose estimate fits in `max_tokens`
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> &str {
    let max_chars = max_tokens.saturating_mul(4);
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Split text into trimmed sentences on `.`, `!`, `?` followed by
/// whitespace, and on line breaks.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '\n' => Some(i),
            '.' | '!' | '?' => match chars.peek() {
                Some((_, next)) if next.is_whitespace() => Some(i + c.len_utf8()),
                None => Some(i + c.len_utf8()),
                _ => None,
            },
            _ => None,
        };
        if let Some(end) = boundary {
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Lowercase alphanumeric terms
pub fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("Hi"), 1);
        assert_eq!(estimate_tokens("Hello World!"), 3);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_estimate_counts_chars_not_bytes() {
        assert_eq!(estimate_tokens("ééééé"), 2);
    }

    #[test]
    fn test_truncate_to_tokens() {
        let text = "a".repeat(100);
        let cut = truncate_to_tokens(&text, 10);
        assert_eq!(cut.len(), 40);
        assert!(estimate_tokens(cut) <= 10);
        assert_eq!(truncate_to_tokens("short", 10), "short");
        assert_eq!(truncate_to_tokens("short", 0), "");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "日本語のテキスト".repeat(10);
        let cut = truncate_to_tokens(&text, 3);
        assert_eq!(cut.chars().count(), 12);
    }

    #[test]
    fn test_split_sentences() {
        let sentences = split_sentences("Rust is fast. It has ownership!  Version 1.85 shipped?\nNew line");
        assert_eq!(
            sentences,
            vec!["Rust is fast.", "It has ownership!", "Version 1.85 shipped?", "New line"]
        );
    }

    #[test]
    fn test_split_sentences_empty() {
        assert!(split_sentences("   \n  ").is_empty());
    }
}
