//! Conversation orchestration
//!
//! Conversation mode keeps the microphone open and hands the floor back and
//! forth: the recognizer is paused while the avatar speaks, resumed shortly
//! after it stops, and the user talking over the avatar stops all speech at
//! once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::speech::{SpeakOptions, Speaker, StreamingSpeaker};
use crate::voice::{
    GateDecision, Microphone, RecognizerEvent, SpeechRecognizer, VadConfig, VadSession, VoiceActivity,
    VoiceActivityDetector, WakeWordGate,
};

/// Channel capacity for conversation events
const CHANNEL_CAPACITY: usize = 64;

/// Default wait after the avatar stops speaking before listening again
pub const DEFAULT_RESUME_DELAY: Duration = Duration::from_millis(500);

/// Recognizer codes that are routine and not surfaced as errors
const QUIET_RECOGNIZER_CODES: &[&str] = &["no-speech", "aborted"];

/// Published turn-taking state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConversationState {
    pub is_conversation_mode: bool,
    pub is_listening: bool,
    pub is_speaking: bool,
}

/// Events published by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    ModeChanged { enabled: bool },
    UserSpeechStarted,
    UserSpeechEnded,
    /// Avatar speech was cut off because the user started talking
    Interrupted,
    /// Partial transcript, only while the wake gate is active
    Interim { text: String },
    /// A query for the assistant
    UserQuery { text: String },
    Error { message: String },
}

#[derive(Default)]
struct SpeakingCount {
    active: usize,
    /// Bumped by emergency stops; speech begun earlier no longer counts
    epoch: u64,
}

/// Tracks who holds the floor
///
/// Shared by the orchestrator and the [`NotifyingSpeaker`] so that speech
/// start and end are observed no matter who initiated the speech.
pub struct SpeechActivity {
    recognizer: Arc<dyn SpeechRecognizer>,
    state: watch::Sender<ConversationState>,
    events: broadcast::Sender<ConversationEvent>,
    speaking: Mutex<SpeakingCount>,
    user_speaking: Mutex<bool>,
    resume: Mutex<Option<CancellationToken>>,
    resume_delay: Duration,
}

impl SpeechActivity {
    #[must_use]
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>, resume_delay: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(ConversationState::default());
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            recognizer,
            state,
            events,
            speaking: Mutex::new(SpeakingCount::default()),
            user_speaking: Mutex::new(false),
            resume: Mutex::new(None),
            resume_delay,
        })
    }

    #[must_use]
    pub fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    /// Whether any speech is in progress
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speaking.lock().active > 0
    }

    /// Record speech start, returning the epoch it belongs to
    fn speech_started(&self) -> u64 {
        self.cancel_resume();
        let epoch = {
            let mut speaking = self.speaking.lock();
            speaking.active += 1;
            speaking.epoch
        };

        if self.recognizer.is_listening() {
            tracing::debug!("pausing recognizer while speaking");
            self.recognizer.stop();
        }
        self.state.send_modify(|s| {
            s.is_speaking = true;
            s.is_listening = false;
        });
        epoch
    }

    fn speech_ended(self: &Arc<Self>, epoch: u64) {
        {
            let mut speaking = self.speaking.lock();
            if speaking.epoch != epoch {
                return;
            }
            speaking.active = speaking.active.saturating_sub(1);
            if speaking.active > 0 {
                return;
            }
        }

        self.state.send_modify(|s| s.is_speaking = false);
        self.schedule_resume();
    }

    /// Forget all speech in progress and any pending resume
    fn reset_speaking(&self) {
        self.cancel_resume();
        {
            let mut speaking = self.speaking.lock();
            speaking.active = 0;
            speaking.epoch += 1;
        }
        self.state.send_modify(|s| s.is_speaking = false);
    }

    fn set_user_speaking(&self, speaking: bool) {
        *self.user_speaking.lock() = speaking;
    }

    fn set_mode(&self, enabled: bool) {
        self.state.send_modify(|s| s.is_conversation_mode = enabled);
    }

    fn sync_listening(&self) {
        let listening = self.recognizer.is_listening();
        self.state.send_if_modified(|s| {
            let changed = s.is_listening != listening;
            s.is_listening = listening;
            changed
        });
    }

    fn schedule_resume(self: &Arc<Self>) {
        if !self.state().is_conversation_mode {
            return;
        }
        let token = CancellationToken::new();
        if let Some(previous) = self.resume.lock().replace(token.clone()) {
            previous.cancel();
        }

        let activity = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(activity.resume_delay) => {
                    if activity.should_resume(&token) {
                        tracing::debug!("resuming recognizer after speech");
                        activity.start_recognizer().await;
                    }
                }
            }
        });
    }

    fn should_resume(&self, token: &CancellationToken) -> bool {
        !token.is_cancelled()
            && self.state().is_conversation_mode
            && !self.is_speaking()
            && !*self.user_speaking.lock()
    }

    fn cancel_resume(&self) {
        if let Some(token) = self.resume.lock().take() {
            token.cancel();
        }
    }

    /// Start the recognizer, publishing failures
    async fn start_recognizer(&self) {
        if let Err(e) = self.try_start_recognizer().await {
            tracing::warn!(error = %e, "failed to start recognizer");
            self.publish(ConversationEvent::Error {
                message: e.to_string(),
            });
        }
    }

    async fn try_start_recognizer(&self) -> Result<()> {
        if !self.recognizer.is_listening() {
            self.recognizer.start().await?;
        }
        self.sync_listening();
        Ok(())
    }

    fn publish(&self, event: ConversationEvent) {
        let _ = self.events.send(event);
    }
}

/// Speaker decorator that reports speech start and end
pub struct NotifyingSpeaker {
    inner: Arc<dyn Speaker>,
    activity: Arc<SpeechActivity>,
}

impl NotifyingSpeaker {
    #[must_use]
    pub fn new(inner: Arc<dyn Speaker>, activity: Arc<SpeechActivity>) -> Self {
        Self { inner, activity }
    }
}

/// Reports the end of speech even if the speak future is dropped
struct SpeakingGuard<'a> {
    activity: &'a Arc<SpeechActivity>,
    epoch: u64,
}

impl Drop for SpeakingGuard<'_> {
    fn drop(&mut self) {
        self.activity.speech_ended(self.epoch);
    }
}

#[async_trait]
impl Speaker for NotifyingSpeaker {
    async fn speak(&self, text: &str, options: SpeakOptions) -> Result<()> {
        if text.trim().is_empty() || options.is_cancelled() {
            return self.inner.speak(text, options).await;
        }
        let _guard = SpeakingGuard {
            epoch: self.activity.speech_started(),
            activity: &self.activity,
        };
        self.inner.speak(text, options).await
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn is_speaking(&self) -> bool {
        self.activity.is_speaking() || self.inner.is_speaking()
    }
}

struct ModeSession {
    vad: VadSession,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Composes recognizer, voice activity detection and speech output
pub struct ConversationOrchestrator {
    activity: Arc<SpeechActivity>,
    speaker: Arc<dyn Speaker>,
    streaming: StreamingSpeaker,
    gate: WakeWordGate,
    microphone: Arc<dyn Microphone>,
    vad: VoiceActivityDetector,
    session: tokio::sync::Mutex<Option<ModeSession>>,
}

impl ConversationOrchestrator {
    /// `speaker` should be the [`NotifyingSpeaker`] sharing `activity`
    #[must_use]
    pub fn new(
        activity: Arc<SpeechActivity>,
        speaker: Arc<dyn Speaker>,
        streaming: StreamingSpeaker,
        gate: WakeWordGate,
        microphone: Arc<dyn Microphone>,
        vad: VadConfig,
    ) -> Self {
        Self {
            activity,
            speaker,
            streaming,
            gate,
            microphone,
            vad: VoiceActivityDetector::new(vad),
            session: tokio::sync::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConversationState {
        self.activity.state()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConversationState> {
        self.activity.state.subscribe()
    }

    /// Subscribe to conversation events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.activity.events.subscribe()
    }

    #[must_use]
    pub const fn gate(&self) -> &WakeWordGate {
        &self.gate
    }

    /// Turn on hands-free conversation
    ///
    /// A no-op if already on. On failure everything started so far is torn
    /// down and the error is also published as [`ConversationEvent::Error`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if the microphone or recognizer is refused
    pub async fn start_conversation_mode(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        tracing::info!("starting conversation mode");
        self.activity.set_mode(true);

        let vad_events = self.vad.subscribe();
        let recognizer_events = self.activity.recognizer.subscribe();
        let vad = match self.vad.start(self.microphone.as_ref()).await {
            Ok(vad) => vad,
            Err(e) => return Err(self.fail_start(e)),
        };

        if !self.activity.is_speaking() {
            if let Err(e) = self.activity.try_start_recognizer().await {
                vad.stop().await;
                return Err(self.fail_start(e));
            }
        }

        // Receivers were subscribed first, so the loop still sees the
        // recognizer's start event
        let cancel = CancellationToken::new();
        let (transcripts, pending) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(event_loop(
                Arc::clone(&self.activity),
                Arc::clone(&self.speaker),
                self.streaming.clone(),
                self.gate.clone(),
                vad_events,
                recognizer_events,
                transcripts,
                cancel.clone(),
            )),
            tokio::spawn(transcript_worker(
                Arc::clone(&self.activity),
                self.gate.clone(),
                pending,
                cancel.clone(),
            )),
        ];

        self.gate.start();
        *session = Some(ModeSession { vad, cancel, tasks });
        self.activity
            .publish(ConversationEvent::ModeChanged { enabled: true });
        Ok(())
    }

    fn fail_start(&self, error: crate::Error) -> crate::Error {
        tracing::warn!(error = %error, "conversation mode failed to start");
        self.activity.recognizer.stop();
        self.activity.set_mode(false);
        self.activity.sync_listening();
        self.activity.publish(ConversationEvent::Error {
            message: error.to_string(),
        });
        error
    }

    /// Turn off hands-free conversation and silence the avatar
    pub async fn stop_conversation_mode(&self) {
        let session = self.session.lock().await.take();
        tracing::info!("stopping conversation mode");

        self.activity.set_mode(false);
        self.activity.recognizer.stop();
        self.emergency_stop();
        self.gate.dispose();

        if let Some(session) = session {
            session.cancel.cancel();
            for task in session.tasks {
                task.abort();
            }
            session.vad.stop().await;
        }

        self.activity.set_user_speaking(false);
        self.activity.sync_listening();
        self.activity
            .publish(ConversationEvent::ModeChanged { enabled: false });
    }

    /// Stop all speech immediately
    ///
    /// Safe from any state. Aborts the response stream, empties the queue,
    /// silences the driver and cancels any pending recognizer resume and the
    /// wake gate's inactivity timer. The next transcript re-arms the timer.
    pub fn emergency_stop(&self) {
        emergency_stop(&self.activity, self.speaker.as_ref(), &self.streaming);
        self.gate.dispose();
    }
}

fn emergency_stop(activity: &SpeechActivity, speaker: &dyn Speaker, streaming: &StreamingSpeaker) {
    tracing::debug!("emergency stop");
    streaming.abort();
    streaming.queue().clear_all();
    speaker.stop();
    activity.reset_speaking();
}

#[allow(clippy::too_many_arguments)]
async fn event_loop(
    activity: Arc<SpeechActivity>,
    speaker: Arc<dyn Speaker>,
    streaming: StreamingSpeaker,
    gate: WakeWordGate,
    mut vad_events: broadcast::Receiver<VoiceActivity>,
    mut recognizer_events: broadcast::Receiver<RecognizerEvent>,
    transcripts: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            edge = vad_events.recv() => match edge {
                Ok(VoiceActivity::SpeechStarted) => {
                    activity.set_user_speaking(true);
                    activity.publish(ConversationEvent::UserSpeechStarted);
                    if activity.is_speaking() || speaker.is_speaking() {
                        tracing::info!("user interrupted, stopping speech");
                        emergency_stop(&activity, speaker.as_ref(), &streaming);
                        activity.publish(ConversationEvent::Interrupted);
                    }
                    if !activity.recognizer.is_listening() {
                        activity.start_recognizer().await;
                    }
                }
                Ok(VoiceActivity::SpeechEnded) => {
                    activity.set_user_speaking(false);
                    activity.publish(ConversationEvent::UserSpeechEnded);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "voice activity events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = recognizer_events.recv() => match event {
                Ok(RecognizerEvent::Started | RecognizerEvent::Ended) => activity.sync_listening(),
                Ok(RecognizerEvent::Error { code, message }) => {
                    activity.sync_listening();
                    if QUIET_RECOGNIZER_CODES.contains(&code.as_str()) {
                        tracing::debug!(%code, "recognizer notice");
                    } else {
                        tracing::warn!(%code, %message, "recognizer error");
                        activity.publish(ConversationEvent::Error { message });
                    }
                }
                Ok(RecognizerEvent::Result { final_text, interim_text }) => {
                    if !final_text.trim().is_empty() {
                        let _ = transcripts.send(final_text);
                    }
                    if let Some(text) = gate.handle_interim(&interim_text) {
                        activity.publish(ConversationEvent::Interim { text });
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "recognizer events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("conversation event loop stopped");
}

/// Feeds final transcripts through the gate one at a time
async fn transcript_worker(
    activity: Arc<SpeechActivity>,
    gate: WakeWordGate,
    mut pending: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let text = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            text = pending.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };

        if let GateDecision::Forwarded(query) = gate.handle_transcript(&text).await {
            tracing::info!(query = %query, "user query");
            activity.publish(ConversationEvent::UserQuery { text: query });
        }
    }
}
