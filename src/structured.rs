//! Structured-output handling for LLM responses.
//!
//! Every place the engine needs shaped output from the model follows the same
//! ladder: strict parse, one reformat-and-retry, then a deterministic
//! fallback. [`Resolution`] records which rung produced the value so callers
//! can tell them apart.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which rung of the parse ladder produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMethod {
    Structured,
    Reformatted,
    Fallback,
}

impl fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionMethod::Structured => "structured",
            ResolutionMethod::Reformatted => "reformatted",
            ResolutionMethod::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

/// A value tagged with how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    /// Parsed from the first response.
    Structured(T),
    /// Parsed after the reformat retry.
    Reformatted(T),
    /// Computed deterministically without the model.
    Fallback(T),
}

impl<T> Resolution<T> {
    pub fn method(&self) -> ResolutionMethod {
        match self {
            Resolution::Structured(_) => ResolutionMethod::Structured,
            Resolution::Reformatted(_) => ResolutionMethod::Reformatted,
            Resolution::Fallback(_) => ResolutionMethod::Fallback,
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Resolution::Structured(v) | Resolution::Reformatted(v) | Resolution::Fallback(v) => v,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Resolution::Structured(v) | Resolution::Reformatted(v) | Resolution::Fallback(v) => v,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolution<U> {
        match self {
            Resolution::Structured(v) => Resolution::Structured(f(v)),
            Resolution::Reformatted(v) => Resolution::Reformatted(f(v)),
            Resolution::Fallback(v) => Resolution::Fallback(f(v)),
        }
    }
}

/// Extract JSON from a potentially markdown-wrapped response.
pub fn extract_json(response: &str) -> String {
    let response = response.trim();

    // ```json fenced block
    if response.starts_with("```json") {
        if let Some(end) = response.rfind("```") {
            let start = "```json".len();
            if end > start {
                return response[start..end].trim().to_string();
            }
        }
    }

    // bare ``` fence
    if response.starts_with("```") {
        if let Some(end) = response.rfind("```") {
            let start = response.find('\n').map(|n| n + 1).unwrap_or(3);
            if end > start {
                return response[start..end].trim().to_string();
            }
        }
    }

    // Whichever bracket opens first wins, so `{"nodes": [...]}` stays an object.
    let object = response.find('{');
    let array = response.find('[');
    let (open, close) = match (object, array) {
        (Some(o), Some(a)) if a < o => ('[', ']'),
        (Some(_), _) => ('{', '}'),
        (None, Some(_)) => ('[', ']'),
        (None, None) => return response.to_string(),
    };

    if let (Some(start), Some(end)) = (response.find(open), response.rfind(close)) {
        if end > start {
            return response[start..=end].to_string();
        }
    }

    response.to_string()
}

/// Clean free-text model output, returning `None` if it is not usable prose.
///
/// Strips wrapping quotes and a leading `Summary:` label; rejects empty
/// output, JSON-looking output and text with too few letters to be prose.
pub fn clean_prose(response: &str) -> Option<String> {
    let mut text = response.trim();
    for label in ["Summary:", "summary:", "SUMMARY:"] {
        if let Some(rest) = text.strip_prefix(label) {
            text = rest.trim();
        }
    }
    let text = text.trim_matches(|c| c == '"' || c == '\'' || c == '`').trim();

    if text.starts_with('{') || text.starts_with('[') || text.starts_with("```") {
        return None;
    }
    let letters = text.chars().filter(|c| c.is_alphabetic()).count();
    if letters < 8 {
        return None;
    }
    Some(text.split_whitespace().collect::<Vec<_>>().join(" "))
}
