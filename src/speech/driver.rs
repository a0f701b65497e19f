//! Speech synthesis driver
//!
//! Owns the single speech output channel. Every utterance cancels whatever is
//! playing, waits for the engine to settle, then plays while a frame task
//! walks the utterance's viseme timeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::SpeechTiming;
use super::engine::{EngineEvent, EngineFailure, SpeechEngine, UtteranceRequest};
use super::signal::{Activity, AvatarSignal};
use super::viseme::{VisemeMapper, VisemeTimeline, word_viseme};
use super::voices::{Voice, select_voice, voices_for_display};
use crate::prefs::VoicePreferences;
use crate::{Error, Result};

/// Per-call overrides for one utterance
#[derive(Debug, Clone, Default)]
pub struct SpeakOptions {
    /// Speech rate, defaults to the preferred rate
    pub rate: Option<f32>,
    /// Pitch, defaults to the preferred pitch
    pub pitch: Option<f32>,
    /// Volume, defaults to the preferred volume
    pub volume: Option<f32>,
    /// Voice id or name, defaults to automatic selection
    pub voice: Option<String>,
    /// Cancels this utterance when triggered
    pub cancel: Option<CancellationToken>,
    /// Part of a streamed response: aborts and interruptions resolve `Ok`
    pub streaming: bool,
}

impl SpeakOptions {
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn with_rate(mut self, rate: f32) -> Self {
        self.rate = Some(rate);
        self
    }

    #[must_use]
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    /// Mark as part of a streamed response
    #[must_use]
    pub fn as_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Whether the cancellation token has already fired
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Outcome for a cancelled utterance
    pub(crate) fn aborted(&self) -> Result<()> {
        if self.streaming {
            Ok(())
        } else {
            Err(Error::Aborted)
        }
    }

    /// Outcome for an utterance pre-empted by newer speech
    pub(crate) fn interrupted(&self) -> Result<()> {
        if self.streaming {
            Ok(())
        } else {
            Err(Error::Interrupted)
        }
    }
}

/// Something that can voice text
///
/// Implemented by [`SpeechDriver`] and by decorators around it.
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Speak `text`, resolving when playback ends
    ///
    /// # Errors
    ///
    /// Returns `Error::Aborted` when cancelled and `Error::Interrupted` when
    /// pre-empted (both `Ok` for streaming requests), or `Error::Engine` when
    /// synthesis fails
    async fn speak(&self, text: &str, options: SpeakOptions) -> Result<()>;

    /// Abort current speech immediately
    fn stop(&self);

    /// Whether audio is playing or pending
    fn is_speaking(&self) -> bool;
}

struct DriverState {
    /// Bumped by every speak and stop; only the newest utterance owns the signal
    generation: u64,
    stop: CancellationToken,
    animation: Option<CancellationToken>,
}

/// Drives the speech engine and the avatar's mouth
pub struct SpeechDriver {
    engine: Arc<dyn SpeechEngine>,
    signal: AvatarSignal,
    mapper: Mutex<VisemeMapper>,
    prefs: watch::Sender<VoicePreferences>,
    timing: SpeechTiming,
    state: Mutex<DriverState>,
}

impl SpeechDriver {
    /// Create a driver over `engine` writing to `signal`
    #[must_use]
    pub fn new(
        engine: Arc<dyn SpeechEngine>,
        signal: AvatarSignal,
        prefs: VoicePreferences,
        timing: SpeechTiming,
    ) -> Self {
        let (prefs, _) = watch::channel(prefs);
        Self {
            engine,
            signal,
            mapper: Mutex::new(VisemeMapper::new()),
            prefs,
            timing,
            state: Mutex::new(DriverState {
                generation: 0,
                stop: CancellationToken::new(),
                animation: None,
            }),
        }
    }

    /// Replace the viseme mapper (e.g. a seeded one)
    #[must_use]
    pub fn with_mapper(mut self, mapper: VisemeMapper) -> Self {
        self.mapper = Mutex::new(mapper);
        self
    }

    #[must_use]
    pub const fn signal(&self) -> &AvatarSignal {
        &self.signal
    }

    /// Current voice preferences
    #[must_use]
    pub fn preferences(&self) -> VoicePreferences {
        self.prefs.borrow().clone()
    }

    /// Apply new voice preferences to subsequent utterances
    pub fn set_preferences(&self, prefs: VoicePreferences) {
        tracing::debug!(voice = ?prefs.voice, rate = prefs.rate, "voice preferences updated");
        self.prefs.send_replace(prefs);
    }

    /// Watch preference changes
    #[must_use]
    pub fn subscribe_preferences(&self) -> watch::Receiver<VoicePreferences> {
        self.prefs.subscribe()
    }

    /// Engine voices for the preferred language, female-sounding first
    #[must_use]
    pub fn voices(&self) -> Vec<Voice> {
        let language = self.prefs.borrow().language.clone();
        voices_for_display(&self.engine.voices(), &language)
    }

    /// Start a new utterance, pre-empting the current one
    fn begin(&self) -> (u64, CancellationToken) {
        let mut state = self.state.lock();
        state.generation += 1;
        if let Some(animation) = state.animation.take() {
            animation.cancel();
        }
        (state.generation, state.stop.clone())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    fn build_request(&self, text: &str, options: &SpeakOptions) -> UtteranceRequest {
        let prefs = self.prefs.borrow().clone();
        let voices = self.engine.voices();
        let voice = select_voice(
            &voices,
            options.voice.as_deref(),
            prefs.voice.as_deref(),
            &prefs.language,
        )
        .cloned();

        UtteranceRequest {
            text: text.to_string(),
            rate: options.rate.unwrap_or(prefs.rate),
            pitch: options.pitch.unwrap_or(prefs.pitch),
            volume: options.volume.unwrap_or(prefs.volume),
            voice,
            language: prefs.language,
        }
    }

    /// Hand `request` to the engine unless a newer utterance has begun
    fn start_engine(
        &self,
        generation: u64,
        request: UtteranceRequest,
    ) -> Option<tokio::sync::mpsc::UnboundedReceiver<EngineEvent>> {
        let state = self.state.lock();
        (state.generation == generation).then(|| self.engine.speak(request))
    }

    fn start_animation(&self, generation: u64, text: &str, rate: f32) {
        let timeline = self.mapper.lock().analyze(text, rate);
        let token = CancellationToken::new();

        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            if let Some(previous) = state.animation.replace(token.clone()) {
                previous.cancel();
            }
            self.signal.set_activity(Activity::Speaking);
        }

        tracing::trace!(frames = timeline.len(), "viseme animation started");
        tokio::spawn(animate(
            self.signal.clone(),
            timeline,
            self.timing.frame_interval,
            token,
        ));
    }

    fn nudge(&self, generation: u64, text: &str, char_index: usize) {
        let Some(word) = text
            .get(char_index..)
            .and_then(|rest| rest.split_whitespace().next())
        else {
            return;
        };
        if self.is_current(generation) {
            self.signal.set_viseme(word_viseme(word));
        }
    }
}

#[async_trait]
impl Speaker for SpeechDriver {
    async fn speak(&self, text: &str, options: SpeakOptions) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let cancel = options.cancel.clone().unwrap_or_default();
        if cancel.is_cancelled() {
            tracing::debug!("speech aborted before starting");
            return options.aborted();
        }

        let (generation, stop) = self.begin();
        let mut playback = Playback {
            driver: self,
            generation,
            finished: false,
        };

        if self.engine.is_speaking() {
            self.engine.cancel();
            tokio::select! {
                biased;
                () = cancel.cancelled() => return options.aborted(),
                () = stop.cancelled() => return options.aborted(),
                () = tokio::time::sleep(self.timing.settle_delay) => {}
            }
        }

        let request = self.build_request(text, &options);
        let rate = request.rate;
        let Some(mut events) = self.start_engine(generation, request) else {
            tracing::debug!("speech superseded while settling");
            return options.interrupted();
        };

        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!("speech aborted during playback");
                    return options.aborted();
                }
                () = stop.cancelled() => return options.aborted(),
                event = events.recv() => event,
            };

            match event {
                Some(EngineEvent::Started) => self.start_animation(generation, text, rate),
                Some(EngineEvent::WordBoundary { char_index }) => {
                    self.nudge(generation, text, char_index);
                }
                Some(EngineEvent::Ended) => {
                    playback.finished = true;
                    return Ok(());
                }
                Some(EngineEvent::Failed(EngineFailure::Interrupted)) | None => {
                    playback.finished = true;
                    tracing::debug!("speech interrupted by newer speech");
                    return options.interrupted();
                }
                Some(EngineEvent::Failed(EngineFailure::Other(message))) => {
                    playback.finished = true;
                    tracing::warn!(error = %message, "speech synthesis failed");
                    return Err(Error::Engine(message));
                }
            }
        }
    }

    fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.generation += 1;
            state.stop.cancel();
            state.stop = CancellationToken::new();
            if let Some(animation) = state.animation.take() {
                animation.cancel();
            }
        }
        self.engine.cancel();
        self.signal.reset();
        tracing::debug!("speech driver stopped");
    }

    fn is_speaking(&self) -> bool {
        self.engine.is_speaking()
    }
}

/// Restores the resting pose when the current utterance ends in any way
struct Playback<'a> {
    driver: &'a SpeechDriver,
    generation: u64,
    finished: bool,
}

impl Drop for Playback<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.driver.state.lock();
            if state.generation != self.generation {
                return;
            }
            if let Some(animation) = state.animation.take() {
                animation.cancel();
            }
        }
        if !self.finished {
            self.driver.engine.cancel();
        }
        self.driver.signal.reset();
    }
}

async fn animate(
    signal: AvatarSignal,
    timeline: VisemeTimeline,
    frame: Duration,
    token: CancellationToken,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(frame);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                if token.is_cancelled() {
                    break;
                }
                signal.set_viseme(timeline.viseme_at(started.elapsed()));
            }
        }
    }
}
