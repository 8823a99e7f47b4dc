//! Tokenization and highlight extraction.
//!
//! Tokens are lowercase runs of word characters (Unicode alphanumerics and
//! `_`). There is no stemming and no stop-word removal: the token index is a
//! plain set-membership index, not a relevance-tuned full-text engine.

use std::collections::BTreeSet;

/// Maximum characters kept per highlight before an ellipsis is appended.
pub const HIGHLIGHT_MAX_CHARS: usize = 200;

/// Maximum number of highlights returned per result.
pub const MAX_HIGHLIGHTS: usize = 3;

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Split `text` into its distinct lowercase word tokens.
///
/// ```rust
/// use grounded_core::text::tokenize;
///
/// let tokens = tokenize("How many vacation days? Vacation!");
/// assert_eq!(tokens.len(), 4);
/// assert!(tokens.contains("vacation"));
/// ```
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !is_word_char(c))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Truncate to at most `max_chars` characters, appending `...` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Sentences of `content` that share at least one token with the query.
///
/// Sentences are delimited by runs of `.`, `!` and `?`. Matches are trimmed,
/// truncated to [`HIGHLIGHT_MAX_CHARS`] and capped at [`MAX_HIGHLIGHTS`],
/// in the order they appear in the content.
pub fn highlights(content: &str, query_tokens: &BTreeSet<String>) -> Vec<String> {
    if query_tokens.is_empty() {
        return Vec::new();
    }

    content
        .split(['.', '!', '?'])
        .filter(|sentence| {
            tokenize(sentence)
                .iter()
                .any(|token| query_tokens.contains(token))
        })
        .map(|sentence| truncate_chars(sentence.trim(), HIGHLIGHT_MAX_CHARS))
        .take(MAX_HIGHLIGHTS)
        .collect()
}
