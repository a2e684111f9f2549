//! Token accounting with the `cl100k_base` BPE.
//!
//! Budgets (summary ceilings, retrieval context windows) are enforced in
//! real tokenizer units so text without spaces, such as CJK, is bounded the
//! same way as English prose.

use std::sync::OnceLock;
use tiktoken_rs::{CoreBPE, cl100k_base};
use tracing::warn;

static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn bpe() -> Option<&'static CoreBPE> {
    BPE.get_or_init(|| match cl100k_base() {
        Ok(bpe) => Some(bpe),
        Err(e) => {
            warn!(error = %e, "failed to load cl100k_base, using character estimate");
            None
        }
    })
    .as_ref()
}

/// Count the tokens of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    match bpe() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        // Roughly four ASCII bytes per token, one token per other character.
        None => {
            let ascii = text.bytes().filter(u8::is_ascii).count();
            ascii.div_ceil(4) + text.chars().filter(|c| !c.is_ascii()).count()
        }
    }
}

/// Truncate `text` so that it fits in `max_tokens`.
///
/// Cuts on a word boundary when the limit falls inside a word, and on a
/// character boundary for text without spaces. Returns the input unchanged
/// when it already fits.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> &str {
    if max_tokens == 0 {
        return "";
    }
    if estimate_tokens(text) <= max_tokens {
        return text;
    }

    // Largest char-boundary prefix that fits: `lo` always fits, `hi` never does.
    let boundaries: Vec<usize> = text.char_indices().map(|(idx, _)| idx).collect();
    let (mut lo, mut hi) = (0, boundaries.len());
    while lo + 1 < hi {
        let mid = (lo + hi) / 2;
        if estimate_tokens(&text[..boundaries[mid]]) <= max_tokens {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let cut = &text[..boundaries[lo]];
    let mid_word = !cut.ends_with(char::is_whitespace)
        && !text[cut.len()..].starts_with(char::is_whitespace);
    match cut.rfind(char::is_whitespace) {
        Some(space) if mid_word && space >= cut.len() / 2 => cut[..space].trim_end(),
        _ => cut.trim_end(),
    }
}

/// Split text into sentences, keeping terminal punctuation.
pub fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    for (idx, ch) in text.char_indices() {
        if matches!(ch, '.' | '!' | '?' | '\n') {
            let next = idx + ch.len_utf8();
            let at_boundary =
                ch == '\n' || next >= bytes.len() || bytes[next].is_ascii_whitespace();
            if at_boundary {
                let sentence = text[start..next].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = next;
            }
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cjk_paragraph() -> String {
        "知识库把文档组织成树状结构，每个节点都有摘要。".repeat(200)
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("one two three four five six seven eight"), 8);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_text_without_spaces_is_counted() {
        let text = cjk_paragraph();
        assert!(text.chars().count() >= 4800);
        assert!(estimate_tokens(&text) > 1000);
    }

    #[test]
    fn test_truncate_keeps_short_text() {
        assert_eq!(truncate_to_tokens("a b c", 100), "a b c");
    }

    #[test]
    fn test_truncate_on_word_boundary() {
        let truncated = truncate_to_tokens("the cat sat on the mat", 3);
        assert_eq!(truncated, "the cat sat");
    }

    #[test]
    fn test_truncate_text_without_spaces() {
        let text = cjk_paragraph();
        let truncated = truncate_to_tokens(&text, 50);
        assert!(!truncated.is_empty());
        assert!(estimate_tokens(truncated) <= 50);
        assert!(text.starts_with(truncated));
    }

    #[test]
    fn test_truncate_zero_budget() {
        assert_eq!(truncate_to_tokens("alpha beta", 0), "");
    }

    #[test]
    fn test_sentences() {
        let parts = sentences("Cats purr. Dogs bark! Do fish sleep? e.g.3 stays");
        assert_eq!(parts, vec!["Cats purr.", "Dogs bark!", "Do fish sleep?", "e.g.3 stays"]);
    }

    #[test]
    fn test_sentences_split_on_lines() {
        let parts = sentences("# Heading\nBody text here");
        assert_eq!(parts, vec!["# Heading", "Body text here"]);
    }
}
