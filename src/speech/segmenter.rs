//! Text segmentation for incremental speech
//!
//! Splits accumulating response text into a speakable prefix and a remainder
//! that stays buffered until more text arrives.

use std::sync::LazyLock;

use regex::Regex;

/// Text longer than this (in characters) may be split on clause punctuation
pub const CLAUSE_SPLIT_MIN_CHARS: usize = 50;

/// Number of words released when no punctuation boundary is available
pub const WORD_CHUNK: usize = 8;

static SENTENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]+").expect("valid regex"));

static CLAUSE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^,;]+[,;]+").expect("valid regex"));

static WORD_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\S+").expect("valid regex"));

/// Result of one segmentation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segmented {
    /// Text that can be spoken now (may be empty)
    pub ready_text: String,
    /// Text to keep buffering
    pub remaining_text: String,
}

impl Segmented {
    /// Whether this pass produced anything speakable
    #[must_use]
    pub fn has_ready(&self) -> bool {
        !self.ready_text.is_empty()
    }
}

/// Split `text` into a speakable prefix and a remainder
///
/// Boundaries are tried in order: complete sentences, clause punctuation (only
/// for text longer than [`CLAUSE_SPLIT_MIN_CHARS`]), then the first
/// [`WORD_CHUNK`] words. Without any boundary the text is returned unchanged as
/// the remainder.
#[must_use]
pub fn segment(text: &str) -> Segmented {
    if text.trim().is_empty() {
        return Segmented::default();
    }

    if let Some(found) = split_on(&SENTENCE_REGEX, text) {
        return found;
    }

    if text.chars().count() > CLAUSE_SPLIT_MIN_CHARS {
        if let Some(found) = split_on(&CLAUSE_REGEX, text) {
            return found;
        }
    }

    if let Some(last) = WORD_REGEX.find_iter(text).nth(WORD_CHUNK - 1) {
        let ready = WORD_REGEX
            .find_iter(&text[..last.end()])
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        return Segmented {
            ready_text: ready,
            remaining_text: text[last.end()..].trim_start().to_string(),
        };
    }

    Segmented {
        ready_text: String::new(),
        remaining_text: text.to_string(),
    }
}

/// Join every match of `pattern`, keeping whatever follows the last one
fn split_on(pattern: &Regex, text: &str) -> Option<Segmented> {
    let mut parts = Vec::new();
    let mut end = 0;

    for m in pattern.find_iter(text) {
        let part = m.as_str().trim();
        if !part.is_empty() {
            parts.push(part);
        }
        end = m.end();
    }

    if parts.is_empty() {
        return None;
    }

    Some(Segmented {
        ready_text: parts.join(" "),
        remaining_text: text[end..].trim_start().to_string(),
    })
}

struct Rule {
    pattern: Regex,
    replacement: &'static str,
}

static MARKDOWN_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    [
        (r"(?s)```.*?```", " code block "),
        (r"`([^`]+)`", "$1"),
        (r"(?m)^#{1,6}\s+", ""),
        (r"\*\*([^*]+)\*\*", "$1"),
        (r"\*([^*]+)\*", "$1"),
        (r"__([^_]+)__", "$1"),
        (r"\b_([^_\n]+)_\b", "$1"),
        (r"\[([^\]]+)\]\([^)]+\)", "$1"),
        (r"https?://\S+", "link"),
        (r"(?m)^\s*-{3,}\s*$", ""),
        (r"(?m)^\s*[-*+]\s+", ""),
        (r"(?m)^\s*\d+\.\s+", ""),
        (r"(?m)^\s*>\s?", ""),
        (r"\|", " "),
        (r"\s+", " "),
    ]
    .into_iter()
    .map(|(pattern, replacement)| Rule {
        pattern: Regex::new(pattern).expect("valid regex"),
        replacement,
    })
    .collect()
});

/// Strip markdown formatting so only speakable prose remains
///
/// Code fences become "code block", links keep their label, bare URLs become
/// "link", and list, quote, header and table syntax is removed.
#[must_use]
pub fn clean_for_speech(text: &str) -> String {
    let cleaned = MARKDOWN_RULES.iter().fold(text.to_string(), |acc, rule| {
        rule.pattern.replace_all(&acc, rule.replacement).into_owned()
    });
    cleaned.trim().to_string()
}
