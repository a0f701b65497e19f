//! Voice activity detection
//!
//! Samples microphone loudness every frame. Speech starts the moment the
//! level crosses the threshold and ends only after it has stayed quiet for the
//! whole silence timeout, so short pauses between words do not end a turn.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Channel capacity for activity edges
const CHANNEL_CAPACITY: usize = 16;

/// Detection thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// Normalized level (0-1) above which the user is speaking
    pub threshold: f32,
    /// Continuous quiet needed before speech counts as ended
    pub silence_timeout: Duration,
    /// Sampling interval
    pub frame_interval: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            silence_timeout: Duration::from_millis(2000),
            frame_interval: Duration::from_millis(16),
        }
    }
}

/// Speaking/silent transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceActivity {
    SpeechStarted,
    SpeechEnded,
}

/// Hysteresis state machine over level samples
#[derive(Debug)]
pub struct ActivityTracker {
    threshold: f32,
    silence_timeout: Duration,
    active: bool,
    silence_deadline: Option<Instant>,
}

impl ActivityTracker {
    #[must_use]
    pub const fn new(config: &VadConfig) -> Self {
        Self {
            threshold: config.threshold,
            silence_timeout: config.silence_timeout,
            active: false,
            silence_deadline: None,
        }
    }

    /// Whether the user is currently considered to be speaking
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Feed one level sample taken at `now`
    ///
    /// Returns an edge when the speaking state changes.
    pub fn observe(&mut self, level: f32, now: Instant) -> Option<VoiceActivity> {
        if level > self.threshold {
            self.silence_deadline = None;
            if self.active {
                return None;
            }
            self.active = true;
            return Some(VoiceActivity::SpeechStarted);
        }

        if !self.active {
            return None;
        }

        let deadline = *self
            .silence_deadline
            .get_or_insert_with(|| now + self.silence_timeout);
        if now >= deadline {
            self.active = false;
            self.silence_deadline = None;
            return Some(VoiceActivity::SpeechEnded);
        }
        None
    }

    /// Forget any speech in progress
    pub const fn reset(&mut self) {
        self.active = false;
        self.silence_deadline = None;
    }
}

/// An open microphone reporting loudness
pub trait LevelMeter: Send {
    /// Current normalized level (0-1)
    fn level(&mut self) -> f32;

    /// Stop the underlying stream
    fn close(&mut self);
}

/// Source of level meters
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Open the microphone
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if access is denied, or `Error::Audio` if
    /// no usable device exists
    async fn open(&self) -> Result<Box<dyn LevelMeter>>;
}

/// Microphone that never hears anything
///
/// Used when no capture device is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentMicrophone;

struct SilentMeter;

impl LevelMeter for SilentMeter {
    fn level(&mut self) -> f32 {
        0.0
    }

    fn close(&mut self) {}
}

#[async_trait]
impl Microphone for SilentMicrophone {
    async fn open(&self) -> Result<Box<dyn LevelMeter>> {
        Ok(Box::new(SilentMeter))
    }
}

/// Emits speaking/silent edges from microphone levels
pub struct VoiceActivityDetector {
    config: VadConfig,
    events: broadcast::Sender<VoiceActivity>,
}

impl VoiceActivityDetector {
    #[must_use]
    pub fn new(config: VadConfig) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { config, events }
    }

    #[must_use]
    pub const fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Change thresholds for sessions started afterwards
    pub fn set_config(&mut self, config: VadConfig) {
        tracing::debug!(threshold = config.threshold, silence_timeout = ?config.silence_timeout, "VAD settings updated");
        self.config = config;
    }

    /// Subscribe to activity edges
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceActivity> {
        self.events.subscribe()
    }

    /// Open the microphone and start sampling
    ///
    /// # Errors
    ///
    /// Returns error if the microphone cannot be opened
    pub async fn start(&self, microphone: &dyn Microphone) -> Result<VadSession> {
        let meter = microphone.open().await?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sample(
            meter,
            ActivityTracker::new(&self.config),
            self.config.frame_interval,
            self.events.clone(),
            cancel.clone(),
        ));

        tracing::debug!(threshold = self.config.threshold, "voice activity detection started");
        Ok(VadSession {
            cancel,
            task: Some(task),
        })
    }
}

/// A running detection loop; dropping it stops sampling
pub struct VadSession {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl VadSession {
    /// Stop sampling and wait for the microphone to close
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for VadSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sample(
    mut meter: Box<dyn LevelMeter>,
    mut tracker: ActivityTracker,
    frame: Duration,
    events: broadcast::Sender<VoiceActivity>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(frame);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let level = meter.level();
                if let Some(edge) = tracker.observe(level, Instant::now()) {
                    tracing::debug!(?edge, level, "voice activity changed");
                    let _ = events.send(edge);
                }
            }
        }
    }

    meter.close();
    tracing::debug!("voice activity detection stopped");
}
