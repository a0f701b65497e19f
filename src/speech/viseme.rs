//! Phoneme to viseme mapping
//!
//! Turns text into a timed sequence of mouth shapes. The mapping works on
//! spelling rather than pronunciation, which is close enough for lip-sync.

use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Vowel frame length at speech rate 1.0
const VOWEL_MS: f32 = 140.0;

/// Consonant frame length at speech rate 1.0
const CONSONANT_MS: f32 = 90.0;

/// Inter-word pause at speech rate 1.0 (70ms scaled by 0.6)
const WORD_GAP_MS: f32 = 70.0 * 0.6;

/// Shortest frame emitted after jitter
const MIN_FRAME_MS: f32 = 50.0;

/// Default peak-to-peak jitter as a fraction of frame length
pub const DEFAULT_JITTER: f32 = 0.08;

/// Two-letter spellings checked before single characters
const DIGRAPHS: [&str; 6] = ["sh", "zh", "ng", "ch", "th", "dh"];

/// Consonants that dominate a word without vowels, in priority order
const PROMINENT: [&str; 8] = ["p", "b", "m", "f", "v", "th", "ch", "sh"];

/// Mouth shape targets understood by the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Viseme {
    /// Neutral, mouth closed
    #[default]
    #[serde(rename = "viseme_sil")]
    Sil,
    #[serde(rename = "viseme_PP")]
    PP,
    #[serde(rename = "viseme_FF")]
    FF,
    #[serde(rename = "viseme_TH")]
    TH,
    #[serde(rename = "viseme_DD")]
    DD,
    #[serde(rename = "viseme_kk")]
    KK,
    #[serde(rename = "viseme_CH")]
    CH,
    #[serde(rename = "viseme_SS")]
    SS,
    #[serde(rename = "viseme_nn")]
    NN,
    #[serde(rename = "viseme_RR")]
    RR,
    #[serde(rename = "viseme_aa")]
    AA,
    #[serde(rename = "viseme_E")]
    E,
    #[serde(rename = "viseme_I")]
    I,
    #[serde(rename = "viseme_O")]
    O,
    #[serde(rename = "viseme_U")]
    U,
}

impl Viseme {
    /// Morph target name as used by the avatar rig
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sil => "viseme_sil",
            Self::PP => "viseme_PP",
            Self::FF => "viseme_FF",
            Self::TH => "viseme_TH",
            Self::DD => "viseme_DD",
            Self::KK => "viseme_kk",
            Self::CH => "viseme_CH",
            Self::SS => "viseme_SS",
            Self::NN => "viseme_nn",
            Self::RR => "viseme_RR",
            Self::AA => "viseme_aa",
            Self::E => "viseme_E",
            Self::I => "viseme_I",
            Self::O => "viseme_O",
            Self::U => "viseme_U",
        }
    }

    /// Look up the viseme for a phoneme spelling (single letter or digraph)
    #[must_use]
    pub fn for_phoneme(phoneme: &str) -> Option<Self> {
        let viseme = match phoneme {
            "a" => Self::AA,
            "e" => Self::E,
            "i" | "y" => Self::I,
            "o" => Self::O,
            "u" | "w" => Self::U,
            "p" | "b" | "m" => Self::PP,
            "f" | "v" => Self::FF,
            "t" | "d" | "n" | "l" => Self::DD,
            "s" | "z" | "sh" | "zh" => Self::SS,
            "k" | "g" | "ng" => Self::KK,
            "ch" | "j" => Self::CH,
            "th" | "dh" => Self::TH,
            "r" => Self::RR,
            "h" => Self::Sil,
            _ => return None,
        };
        Some(viseme)
    }
}

impl fmt::Display for Viseme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mouth shape held for a duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisemeFrame {
    pub viseme: Viseme,
    pub duration: Duration,
}

/// Ordered frames for one utterance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisemeTimeline {
    frames: Vec<VisemeFrame>,
}

impl VisemeTimeline {
    /// Build a timeline from precomputed frames
    #[must_use]
    pub const fn new(frames: Vec<VisemeFrame>) -> Self {
        Self { frames }
    }

    /// All frames in playback order
    #[must_use]
    pub fn frames(&self) -> &[VisemeFrame] {
        &self.frames
    }

    /// Number of frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the timeline has no frames
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Sum of all frame durations
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.frames.iter().map(|f| f.duration).sum()
    }

    /// Viseme active `elapsed` after playback started
    ///
    /// Returns [`Viseme::Sil`] once the timeline has run out.
    #[must_use]
    pub fn viseme_at(&self, elapsed: Duration) -> Viseme {
        let mut start = Duration::ZERO;
        for frame in &self.frames {
            let end = start + frame.duration;
            if elapsed >= start && elapsed < end {
                return frame.viseme;
            }
            start = end;
        }
        Viseme::Sil
    }
}

impl<'a> IntoIterator for &'a VisemeTimeline {
    type Item = &'a VisemeFrame;
    type IntoIter = std::slice::Iter<'a, VisemeFrame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}

/// Computes viseme timelines from text
pub struct VisemeMapper {
    rng: StdRng,
    jitter: f32,
}

impl Default for VisemeMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl VisemeMapper {
    /// Create a mapper with entropy-seeded jitter
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            jitter: DEFAULT_JITTER,
        }
    }

    /// Create a mapper whose jitter sequence is reproducible
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            jitter: DEFAULT_JITTER,
        }
    }

    /// Set the peak-to-peak jitter fraction (0 disables jitter)
    #[must_use]
    pub fn jitter(mut self, jitter: f32) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    /// Compute the timeline for `text` spoken at `speech_rate`
    ///
    /// Frame lengths scale with `1 / speech_rate`. A short silence separates
    /// words; unknown characters map to silence at consonant length.
    pub fn analyze(&mut self, text: &str, speech_rate: f32) -> VisemeTimeline {
        let rate = if speech_rate.is_finite() && speech_rate > 0.0 {
            speech_rate
        } else {
            1.0
        };
        let scale = 1.0 / rate;
        let lowered = text.to_lowercase();
        let mut frames = Vec::new();

        for (index, word) in lowered.split_whitespace().enumerate() {
            if index > 0 {
                frames.push(self.frame(Viseme::Sil, WORD_GAP_MS * scale));
            }

            let chars: Vec<char> = word.chars().collect();
            let mut i = 0;
            while i < chars.len() {
                let c = chars[i];
                let digraph = chars.get(i + 1).map(|next| {
                    let mut pair = String::with_capacity(2);
                    pair.push(c);
                    pair.push(*next);
                    pair
                });

                let (viseme, base) = match digraph.filter(|d| DIGRAPHS.contains(&d.as_str())) {
                    Some(pair) => {
                        i += 1;
                        (Viseme::for_phoneme(&pair).unwrap_or_default(), CONSONANT_MS)
                    }
                    None => {
                        let mut buf = [0u8; 4];
                        let single = c.encode_utf8(&mut buf);
                        match Viseme::for_phoneme(single) {
                            Some(v) if is_vowel(c) => (v, VOWEL_MS),
                            Some(v) => (v, CONSONANT_MS),
                            None => (Viseme::Sil, CONSONANT_MS),
                        }
                    }
                };

                frames.push(self.frame(viseme, base * scale));
                i += 1;
            }
        }

        tracing::trace!(frames = frames.len(), rate, "viseme timeline computed");
        VisemeTimeline::new(frames)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn frame(&mut self, viseme: Viseme, millis: f32) -> VisemeFrame {
        let jittered = if self.jitter > 0.0 {
            millis + self.rng.gen_range(-0.5f32..0.5) * millis * self.jitter
        } else {
            millis
        };
        let micros = (jittered.max(MIN_FRAME_MS) * 1000.0).round() as u64;
        VisemeFrame {
            viseme,
            duration: Duration::from_micros(micros),
        }
    }
}

const fn is_vowel(c: char) -> bool {
    matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y')
}

/// Most visually prominent phoneme of a word
///
/// First vowel wins, then the first bilabial/labiodental/fricative spelling,
/// then the first consonant. Non-letters are ignored; a word without letters
/// yields `"sil"`.
#[must_use]
pub fn dominant_phoneme(word: &str) -> String {
    let letters: String = word
        .to_lowercase()
        .chars()
        .filter(char::is_ascii_lowercase)
        .collect();

    if let Some(vowel) = letters.chars().find(|c| "aeiou".contains(*c)) {
        return vowel.to_string();
    }

    if let Some(prominent) = PROMINENT.iter().find(|p| letters.contains(*p)) {
        return (*prominent).to_string();
    }

    letters
        .chars()
        .next()
        .map_or_else(|| "sil".to_string(), |c| c.to_string())
}

/// Viseme used to snap the mouth at a spoken word boundary
#[must_use]
pub fn word_viseme(word: &str) -> Viseme {
    Viseme::for_phoneme(&dominant_phoneme(word)).unwrap_or_default()
}
