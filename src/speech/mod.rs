//! Speech output and lip-sync
//!
//! Text flows from the streaming speaker through the segmenter into the
//! queue, which feeds the driver one utterance at a time. The driver plays
//! audio through a [`SpeechEngine`] and animates the [`AvatarSignal`].

mod driver;
mod engine;
mod queue;
pub mod segmenter;
mod signal;
mod simulated;
mod streaming;
pub mod viseme;
pub mod voices;

use std::time::Duration;

pub use driver::{SpeakOptions, Speaker, SpeechDriver};
pub use engine::{EngineEvent, EngineFailure, SpeechEngine, UtteranceRequest};
pub use queue::{QueueStatus, SpeechQueue, SpeechTicket};
pub use segmenter::{Segmented, clean_for_speech, segment};
pub use signal::{Activity, AvatarSignal};
pub use simulated::SimulatedEngine;
pub use streaming::{SpeechCompletion, StreamEvent, StreamOutcome, StreamStatus, StreamingSpeaker};
pub use viseme::{Viseme, VisemeFrame, VisemeMapper, VisemeTimeline};
pub use voices::Voice;

/// Pacing constants for speech output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechTiming {
    /// Wait after cancelling previous audio before starting new audio
    pub settle_delay: Duration,
    /// Viseme update interval while speaking
    pub frame_interval: Duration,
    /// Pause between queued chunks when more are waiting
    pub inter_chunk_pause: Duration,
}

impl Default for SpeechTiming {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(50),
            frame_interval: Duration::from_millis(16),
            inter_chunk_pause: Duration::from_millis(150),
        }
    }
}
