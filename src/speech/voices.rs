//! Voice selection policy
//!
//! The avatar has a female persona, so automatic selection favours voices that
//! read as female and skips voices whose names mark them as male.

use serde::{Deserialize, Serialize};

/// Names tried in order when no voice is requested
const PRIORITY_NAMES: [&str; 14] = [
    "alloy", "nova", "shimmer", "samantha", "emma", "aria", "jenny", "zira", "susan", "hazel",
    "female", "woman", "girl", "feminine",
];

/// Secondary female markers
const FALLBACK_NAMES: [&str; 9] = [
    "female", "woman", "girl", "karen", "linda", "helena", "catherine", "fiona", "serena",
];

/// Name tokens that mark a voice as male
const MALE_TOKENS: [&str; 7] = ["male", "man", "boy", "david", "mark", "daniel", "george"];

/// A voice offered by the speech engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    /// Engine-specific identifier
    pub id: String,
    /// Human readable name
    pub name: String,
    /// BCP 47 language tag (e.g. "en-US")
    pub lang: String,
}

impl Voice {
    pub fn new(id: impl Into<String>, name: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            lang: lang.into(),
        }
    }

    /// Whether this voice speaks the primary language of `language`
    ///
    /// Only the first two characters are compared, so "en-GB" matches "en-US".
    #[must_use]
    pub fn speaks(&self, language: &str) -> bool {
        let prefix: String = language.chars().take(2).collect::<String>().to_lowercase();
        self.lang.to_lowercase().starts_with(&prefix)
    }

    /// Whether any whole word of the name marks the voice as male
    #[must_use]
    pub fn is_male(&self) -> bool {
        self.name
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .any(|token| MALE_TOKENS.contains(&token))
    }

    fn name_contains(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle)
    }

    fn looks_female(&self) -> bool {
        PRIORITY_NAMES
            .iter()
            .chain(FALLBACK_NAMES.iter())
            .any(|name| self.name_contains(name))
    }
}

/// Pick the voice for an utterance
///
/// In order: an explicitly requested voice (by id or name), the user's
/// preferred voice unless it is male, the first priority female name, a
/// secondary female marker, then any voice that is not male. All automatic
/// choices must speak `language`. Returns `None` to let the engine use its
/// default.
#[must_use]
pub fn select_voice<'a>(
    voices: &'a [Voice],
    requested: Option<&str>,
    preferred: Option<&str>,
    language: &str,
) -> Option<&'a Voice> {
    if let Some(requested) = requested.filter(|r| !r.trim().is_empty()) {
        let wanted = requested.to_lowercase();
        if let Some(voice) = voices
            .iter()
            .find(|v| v.id.to_lowercase() == wanted || v.name.to_lowercase() == wanted)
        {
            return Some(voice);
        }
        tracing::debug!(requested, "requested voice not available");
    }

    let candidates = || voices.iter().filter(|v| v.speaks(language));

    if let Some(preferred) = preferred.filter(|p| !p.trim().is_empty()) {
        let wanted = preferred.to_lowercase();
        if let Some(voice) = candidates()
            .filter(|v| !v.is_male())
            .find(|v| v.id.to_lowercase() == wanted || v.name_contains(&wanted))
        {
            return Some(voice);
        }
    }

    PRIORITY_NAMES
        .iter()
        .find_map(|name| candidates().find(|v| v.name_contains(name)))
        .or_else(|| candidates().find(|v| FALLBACK_NAMES.iter().any(|n| v.name_contains(n))))
        .or_else(|| candidates().find(|v| !v.is_male()))
}

/// Voices for `language`, female-sounding ones first
///
/// Used to present a voice picker. Order within each group is preserved.
#[must_use]
pub fn voices_for_display(voices: &[Voice], language: &str) -> Vec<Voice> {
    let (female, other): (Vec<&Voice>, Vec<&Voice>) = voices
        .iter()
        .filter(|v| v.speaks(language))
        .partition(|v| v.looks_female() || !v.is_male());
    female.into_iter().chain(other).cloned().collect()
}
