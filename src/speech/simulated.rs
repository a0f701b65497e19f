//! Timer-driven speech engine
//!
//! Emits the same event sequence a platform engine would, pacing words with
//! tokio timers instead of producing audio. Used by the CLI and the tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::engine::{EngineEvent, EngineFailure, SpeechEngine, UtteranceRequest};
use super::voices::Voice;

/// Time per word at speech rate 1.0
const DEFAULT_WORD_DURATION: Duration = Duration::from_millis(250);

/// Delay between `speak` and the start event
const DEFAULT_START_LATENCY: Duration = Duration::from_millis(10);

struct Playing {
    id: u64,
    token: CancellationToken,
    events: mpsc::UnboundedSender<EngineEvent>,
    started: bool,
}

#[derive(Default)]
struct EngineState {
    next_id: u64,
    active: Vec<Playing>,
    spoken: Vec<String>,
    max_concurrent: usize,
    cancels: usize,
    scripted_failures: VecDeque<String>,
}

struct EngineInner {
    voices: Vec<Voice>,
    word_duration: Duration,
    start_latency: Duration,
    state: Mutex<EngineState>,
}

/// Speech engine that plays silence on a timer
#[derive(Clone)]
pub struct SimulatedEngine {
    inner: Arc<EngineInner>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEngine {
    /// Create an engine with a small built-in voice catalog
    #[must_use]
    pub fn new() -> Self {
        Self::with_timing(DEFAULT_WORD_DURATION, DEFAULT_START_LATENCY)
    }

    /// Create an engine with custom pacing
    #[must_use]
    pub fn with_timing(word_duration: Duration, start_latency: Duration) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                voices: default_voices(),
                word_duration,
                start_latency,
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    /// Replace the voice catalog
    #[must_use]
    pub fn with_voices(self, voices: Vec<Voice>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                voices,
                word_duration: self.inner.word_duration,
                start_latency: self.inner.start_latency,
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    /// Texts that reached the start event, in order
    #[must_use]
    pub fn spoken(&self) -> Vec<String> {
        self.inner.state.lock().spoken.clone()
    }

    /// Highest number of utterances that were playing at once
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.inner.state.lock().max_concurrent
    }

    /// Number of utterances removed by `cancel`
    #[must_use]
    pub fn cancel_count(&self) -> usize {
        self.inner.state.lock().cancels
    }

    /// Make the next utterance fail right after it starts
    pub fn fail_next(&self, message: impl Into<String>) {
        self.inner
            .state
            .lock()
            .scripted_failures
            .push_back(message.into());
    }
}

impl SpeechEngine for SimulatedEngine {
    fn voices(&self) -> Vec<Voice> {
        self.inner.voices.clone()
    }

    fn speak(&self, request: UtteranceRequest) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let (id, failure) = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let failure = state.scripted_failures.pop_front();
            state.active.push(Playing {
                id,
                token: token.clone(),
                events: tx.clone(),
                started: false,
            });
            (id, failure)
        };

        tracing::trace!(id, text = %request.text, "simulated utterance queued");
        tokio::spawn(Arc::clone(&self.inner).play(id, request, token, tx, failure));
        rx
    }

    fn cancel(&self) {
        let removed: Vec<Playing> = {
            let mut state = self.inner.state.lock();
            state.cancels += state.active.len();
            state.active.drain(..).collect()
        };

        for playing in removed {
            playing.token.cancel();
            let _ = playing
                .events
                .send(EngineEvent::Failed(EngineFailure::Interrupted));
        }
    }

    fn is_speaking(&self) -> bool {
        !self.inner.state.lock().active.is_empty()
    }
}

impl EngineInner {
    async fn play(
        self: Arc<Self>,
        id: u64,
        request: UtteranceRequest,
        token: CancellationToken,
        events: mpsc::UnboundedSender<EngineEvent>,
        failure: Option<String>,
    ) {
        if pause(&token, self.start_latency).await {
            return;
        }

        {
            let mut state = self.state.lock();
            let Some(playing) = state.active.iter_mut().find(|p| p.id == id) else {
                return;
            };
            playing.started = true;
            let concurrent = state.active.iter().filter(|p| p.started).count();
            state.max_concurrent = state.max_concurrent.max(concurrent);
            state.spoken.push(request.text.clone());
        }
        let _ = events.send(EngineEvent::Started);

        if let Some(message) = failure {
            if self.finish(id) {
                let _ = events.send(EngineEvent::Failed(EngineFailure::Other(message)));
            }
            return;
        }

        let per_word = self.word_duration.div_f32(request.rate.max(0.1));
        for char_index in word_starts(&request.text) {
            let _ = events.send(EngineEvent::WordBoundary { char_index });
            if pause(&token, per_word).await {
                return;
            }
        }

        if self.finish(id) {
            let _ = events.send(EngineEvent::Ended);
        }
    }

    /// Remove a naturally finished utterance; false if `cancel` got there first
    fn finish(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.active.len();
        state.active.retain(|p| p.id != id);
        state.active.len() != before
    }
}

/// Sleep for `duration`; true if cancelled first
async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        () = token.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}

/// Byte offsets where words begin
fn word_starts(text: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut in_word = false;
    for (index, c) in text.char_indices() {
        if c.is_whitespace() {
            in_word = false;
        } else if !in_word {
            in_word = true;
            starts.push(index);
        }
    }
    starts
}

fn default_voices() -> Vec<Voice> {
    vec![
        Voice::new("samantha", "Samantha", "en-US"),
        Voice::new("uk-female", "Google UK English Female", "en-GB"),
        Voice::new("uk-male", "Google UK English Male", "en-GB"),
        Voice::new("daniel", "Daniel", "en-GB"),
        Voice::new("amelie", "Amelie", "fr-CA"),
    ]
}
