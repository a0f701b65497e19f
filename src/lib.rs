//! Lotus Avatar - real-time speech and turn-taking core for a talking avatar
//!
//! This library provides:
//! - Streaming segmentation of response text into speakable chunks
//! - Viseme timelines for lip-sync
//! - A single-channel speech driver and sequential speech queue
//! - Voice activity detection and wake-word gating
//! - Conversation mode with barge-in and emergency stop
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │            Recognizer  │  Microphone (VAD)            │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ transcripts / activity edges
//! ┌────────────────────▼─────────────────────────────────┐
//! │   WakeWordGate  →  ConversationOrchestrator           │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ queries → CompletionClient
//! ┌────────────────────▼─────────────────────────────────┐
//! │ StreamingSpeaker → Segmenter → SpeechQueue → Driver   │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ viseme + activity
//! ┌────────────────────▼─────────────────────────────────┐
//! │                 Renderer (AvatarSignal)               │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod avatar;
pub mod completion;
pub mod config;
pub mod conversation;
pub mod error;
pub mod prefs;
pub mod speech;
pub mod voice;

pub use avatar::{Avatar, AvatarBuilder};
pub use completion::{ChatMessage, CompletionClient, DeltaStream, OpenAiClient, StreamDelta};
pub use config::Config;
pub use conversation::{ConversationEvent, ConversationOrchestrator, ConversationSession, ConversationState};
pub use error::{Error, Result};
pub use prefs::{FilePreferenceStore, MemoryPreferenceStore, PreferenceStore, VoicePreferences};
pub use speech::{
    Activity, AvatarSignal, SimulatedEngine, SpeakOptions, Speaker, SpeechDriver, SpeechEngine, SpeechQueue,
    StreamingSpeaker, Viseme, VisemeMapper, VisemeTimeline, Voice,
};
pub use voice::{ScriptedRecognizer, SpeechRecognizer, VoiceActivityDetector, WakeState, WakeWordGate};
