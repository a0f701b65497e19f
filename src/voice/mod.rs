//! Voice input
//!
//! Microphone activity detection, the recognizer contract, and wake-word
//! gating of recognized transcripts.

#[cfg(feature = "microphone")]
mod capture;
mod recognizer;
mod spectrum;
mod vad;
mod wake_word;

#[cfg(feature = "microphone")]
pub use capture::{ANALYSIS_WINDOW, CpalLevelMeter, CpalMicrophone};
pub use recognizer::{RecognizerEvent, ScriptedRecognizer, SpeechRecognizer, recognizer_error_message};
pub use spectrum::{DEFAULT_SMOOTHING, FFT_SIZE, SpectrumAnalyzer, normalized_level};
pub use vad::{
    ActivityTracker, LevelMeter, Microphone, SilentMicrophone, VadConfig, VadSession, VoiceActivity, VoiceActivityDetector,
};
pub use wake_word::{GateDecision, GateEvent, WakeConfig, WakeState, WakeWordGate};
