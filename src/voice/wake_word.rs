//! Wake word gating
//!
//! Decides which recognized transcripts reach the assistant. Nothing is
//! forwarded until the activation phrase is heard; the deactivation phrase
//! returns to passive listening. A long quiet spell while listening prompts
//! the user once and parks the gate in `Inactive`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::speech::{SpeakOptions, Speaker};

/// Channel capacity for gate events
const CHANNEL_CAPACITY: usize = 64;

/// Phrases, acknowledgements and timing for the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeConfig {
    pub activation_phrase: String,
    pub deactivation_phrase: String,
    /// Spoken after activation
    pub activation_ack: String,
    /// Spoken after deactivation
    pub deactivation_ack: String,
    /// Spoken when the inactivity timer fires
    pub inactivity_prompt: String,
    pub inactivity_timeout: Duration,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            activation_phrase: "hi lotus".to_string(),
            deactivation_phrase: "thanks lotus".to_string(),
            activation_ack: "Hi Dear".to_string(),
            deactivation_ack: "Okay, Dear".to_string(),
            inactivity_prompt: "If you are curious about anything, just say, Hi, Lotus!".to_string(),
            inactivity_timeout: Duration::from_secs(30),
        }
    }
}

/// Gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeState {
    /// Waiting for the activation phrase
    Listening,
    /// Forwarding queries
    Active,
    /// Prompted after inactivity, waiting for the activation phrase
    Inactive,
}

/// Events published by the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "state", rename_all = "snake_case")]
pub enum GateEvent {
    WakeWordDetected,
    DeactivationDetected,
    InactivityTimeout,
    StateChanged(WakeState),
}

/// What the gate did with a transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Query for the assistant
    Forwarded(String),
    Activated,
    Deactivated,
    /// Contained a phrase that does not apply in the current state
    Suppressed,
    /// Not active, or empty
    Ignored,
}

impl GateDecision {
    /// The forwarded query, if any
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        match self {
            Self::Forwarded(text) => Some(text),
            _ => None,
        }
    }
}

struct GateInner {
    config: WakeConfig,
    activation: String,
    deactivation: String,
    speaker: Arc<dyn Speaker>,
    state: Mutex<WakeState>,
    timer: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<GateEvent>,
}

/// Wake-word state machine with inactivity timer
#[derive(Clone)]
pub struct WakeWordGate {
    inner: Arc<GateInner>,
}

impl WakeWordGate {
    /// Create a gate that speaks acknowledgements through `speaker`
    #[must_use]
    pub fn new(config: WakeConfig, speaker: Arc<dyn Speaker>) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let activation = normalize(&config.activation_phrase);
        let deactivation = normalize(&config.deactivation_phrase);
        Self {
            inner: Arc::new(GateInner {
                config,
                activation,
                deactivation,
                speaker,
                state: Mutex::new(WakeState::Listening),
                timer: Mutex::new(None),
                events,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &WakeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> WakeState {
        *self.inner.state.lock()
    }

    /// Subscribe to gate events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.inner.events.subscribe()
    }

    /// Enter `Listening` and arm the inactivity timer
    pub fn start(&self) {
        self.set_state(WakeState::Listening);
    }

    /// Force a state; the timer is re-armed only for `Listening`
    pub fn set_state(&self, state: WakeState) {
        self.cancel_timer();
        if self.transition(state) {
            let _ = self.inner.events.send(GateEvent::StateChanged(state));
        }
        self.arm_timer();
    }

    /// Cancel the inactivity timer
    pub fn dispose(&self) {
        self.cancel_timer();
    }

    /// Whether the inactivity timer is pending
    #[must_use]
    pub fn timer_armed(&self) -> bool {
        self.inner
            .timer
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Handle a final transcript
    ///
    /// Acknowledgements are awaited before the corresponding events are
    /// published.
    pub async fn handle_transcript(&self, text: &str) -> GateDecision {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return GateDecision::Ignored;
        }
        self.cancel_timer();

        if normalized.contains(&self.inner.activation) {
            let decision = self.activate().await;
            self.arm_timer();
            return decision;
        }

        if normalized.contains(&self.inner.deactivation) {
            let decision = self.deactivate().await;
            if decision != GateDecision::Deactivated {
                self.arm_timer();
            }
            return decision;
        }

        let decision = if self.state() == WakeState::Active {
            tracing::debug!(query = text.trim(), "forwarding query");
            GateDecision::Forwarded(text.trim().to_string())
        } else {
            tracing::trace!(transcript = text.trim(), "not active, ignoring transcript");
            GateDecision::Ignored
        };
        self.arm_timer();
        decision
    }

    /// Interim text to show, only while active
    #[must_use]
    pub fn handle_interim(&self, text: &str) -> Option<String> {
        let normalized = normalize(text);
        if normalized.is_empty()
            || self.state() != WakeState::Active
            || normalized.contains(&self.inner.activation)
            || normalized.contains(&self.inner.deactivation)
        {
            return None;
        }
        Some(text.trim().to_string())
    }

    async fn activate(&self) -> GateDecision {
        if !self.transition(WakeState::Active) {
            tracing::debug!("activation phrase while already active");
            return GateDecision::Suppressed;
        }
        tracing::info!(phrase = %self.inner.activation, "wake word detected");
        self.acknowledge(&self.inner.config.activation_ack).await;
        let _ = self.inner.events.send(GateEvent::WakeWordDetected);
        let _ = self
            .inner
            .events
            .send(GateEvent::StateChanged(WakeState::Active));
        GateDecision::Activated
    }

    async fn deactivate(&self) -> GateDecision {
        {
            let mut state = self.inner.state.lock();
            if *state != WakeState::Active {
                return GateDecision::Suppressed;
            }
            *state = WakeState::Listening;
        }
        tracing::info!(phrase = %self.inner.deactivation, "deactivation phrase detected");
        self.acknowledge(&self.inner.config.deactivation_ack).await;
        self.arm_timer();
        let _ = self.inner.events.send(GateEvent::DeactivationDetected);
        let _ = self
            .inner
            .events
            .send(GateEvent::StateChanged(WakeState::Listening));
        GateDecision::Deactivated
    }

    async fn acknowledge(&self, text: &str) {
        match self.inner.speaker.speak(text, SpeakOptions::default()).await {
            Err(e) if !e.is_cancellation() => tracing::warn!(error = %e, text, "acknowledgement failed"),
            Err(e) => tracing::debug!(reason = %e, text, "acknowledgement cut short"),
            Ok(()) => {}
        }
    }

    /// Set the state, returning whether it changed
    fn transition(&self, next: WakeState) -> bool {
        let mut state = self.inner.state.lock();
        if *state == next {
            return false;
        }
        tracing::debug!(from = ?*state, to = ?next, "wake state changed");
        *state = next;
        true
    }

    fn cancel_timer(&self) {
        if let Some(token) = self.inner.timer.lock().take() {
            token.cancel();
        }
    }

    fn arm_timer(&self) {
        if self.state() != WakeState::Listening {
            return;
        }
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.timer.lock().replace(token.clone()) {
            previous.cancel();
        }

        let gate = self.clone();
        let timeout = self.inner.config.inactivity_timeout;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(timeout) => gate.on_inactivity(&token).await,
            }
        });
    }

    async fn on_inactivity(&self, token: &CancellationToken) {
        {
            let mut timer = self.inner.timer.lock();
            if token.is_cancelled() {
                return;
            }
            let mut state = self.inner.state.lock();
            if *state != WakeState::Listening {
                return;
            }
            *state = WakeState::Inactive;
            *timer = None;
        }

        tracing::info!(timeout_secs = self.inner.config.inactivity_timeout.as_secs(), "inactivity timeout");
        self.acknowledge(&self.inner.config.inactivity_prompt).await;
        let _ = self.inner.events.send(GateEvent::InactivityTimeout);
        let _ = self
            .inner
            .events
            .send(GateEvent::StateChanged(WakeState::Inactive));
    }
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}
