//! Platform speech output contract
//!
//! The engine turns an utterance into audio and reports progress through a
//! per-utterance event channel. Implementations must deliver
//! [`EngineFailure::Interrupted`] to every utterance removed by [`SpeechEngine::cancel`].

use tokio::sync::mpsc;

use super::voices::Voice;

/// Everything the engine needs to voice one utterance
#[derive(Debug, Clone, PartialEq)]
pub struct UtteranceRequest {
    pub text: String,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
    /// Selected voice, `None` for the engine default
    pub voice: Option<Voice>,
    pub language: String,
}

/// Why an utterance failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineFailure {
    /// Removed by `cancel` or replaced by newer speech
    Interrupted,
    /// Any other synthesis failure
    Other(String),
}

/// Progress of a single utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Audio started playing
    Started,
    /// A word starts at this byte offset of the utterance text
    WordBoundary { char_index: usize },
    /// Audio finished normally
    Ended,
    /// Playback stopped early
    Failed(EngineFailure),
}

/// Speech output engine
pub trait SpeechEngine: Send + Sync {
    /// Voices the engine can use
    fn voices(&self) -> Vec<Voice>;

    /// Start voicing `request`
    ///
    /// Returns the utterance's event channel. The channel closes after a
    /// terminal event (`Ended` or `Failed`).
    fn speak(&self, request: UtteranceRequest) -> mpsc::UnboundedReceiver<EngineEvent>;

    /// Stop current audio and drop anything pending
    fn cancel(&self);

    /// Whether audio is playing or pending
    fn is_speaking(&self) -> bool;
}
