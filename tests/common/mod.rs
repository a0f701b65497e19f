//! Shared test utilities
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use lotus_avatar::completion::{ChatMessage, CompletionClient, DeltaStream, StreamDelta};
use lotus_avatar::voice::{LevelMeter, Microphone};
use lotus_avatar::{Avatar, Config, Error, Result, ScriptedRecognizer, SimulatedEngine};

/// Simulated engine with short, predictable timing (100 ms per word)
#[must_use]
pub fn fast_engine() -> SimulatedEngine {
    SimulatedEngine::with_timing(Duration::from_millis(100), Duration::from_millis(5))
}

/// Microphone whose level the test controls
#[derive(Clone, Default)]
pub struct ScriptedMicrophone {
    level: Arc<Mutex<f32>>,
    denied: Arc<AtomicBool>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl ScriptedMicrophone {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_level(&self, level: f32) {
        *self.level.lock() = level;
    }

    pub fn deny_permission(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedMeter {
    mic: ScriptedMicrophone,
}

impl LevelMeter for ScriptedMeter {
    fn level(&mut self) -> f32 {
        *self.mic.level.lock()
    }

    fn close(&mut self) {
        self.mic.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Microphone for ScriptedMicrophone {
    async fn open(&self) -> Result<Box<dyn LevelMeter>> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(Error::Permission("microphone access denied".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedMeter { mic: self.clone() }))
    }
}

/// Completion client replaying a fixed list of cumulative deltas
#[derive(Clone, Default)]
pub struct ScriptedCompletion {
    deltas: Arc<Mutex<Vec<Result<StreamDelta>>>>,
    fail_request: Arc<AtomicBool>,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    delay: Duration,
}

impl ScriptedCompletion {
    /// Reply with `chunks`, each appended to the text so far
    #[must_use]
    pub fn replying(chunks: &[&str]) -> Self {
        let client = Self::default();
        let mut full = String::new();
        let mut deltas = Vec::new();
        for chunk in chunks {
            full.push_str(chunk);
            deltas.push(Ok(StreamDelta::new(*chunk, full.clone())));
        }
        *client.deltas.lock() = deltas;
        client
    }

    /// Wait `delay` before each delta
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// End the stream with an error after the scripted deltas
    #[must_use]
    pub fn failing_midway(self) -> Self {
        self.deltas
            .lock()
            .push(Err(Error::Completion("connection reset".to_string())));
        self
    }

    /// Reject the request before streaming
    pub fn fail_requests(&self) {
        self.fail_request.store(true, Ordering::SeqCst);
    }

    /// Messages of every request made so far
    #[must_use]
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().clone()
    }

    fn script(&self) -> Vec<Result<StreamDelta>> {
        self.deltas
            .lock()
            .iter()
            .map(|d| match d {
                Ok(delta) => Ok(delta.clone()),
                Err(e) => Err(Error::Completion(e.to_string())),
            })
            .collect()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        self.requests.lock().push(messages.to_vec());
        self.script()
            .into_iter()
            .rev()
            .find_map(std::result::Result::ok)
            .map(|d| d.full_text)
            .ok_or_else(|| Error::Completion("empty completion".to_string()))
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<DeltaStream> {
        self.requests.lock().push(messages.to_vec());
        if self.fail_request.load(Ordering::SeqCst) {
            return Err(Error::Completion("service unavailable".to_string()));
        }
        let delay = self.delay;
        Ok(futures::stream::iter(self.script())
            .then(move |delta| async move {
                tokio::time::sleep(delay).await;
                delta
            })
            .boxed())
    }
}

/// Everything a conversation test needs to drive the avatar
pub struct Harness {
    pub avatar: Avatar,
    pub engine: SimulatedEngine,
    pub recognizer: ScriptedRecognizer,
    pub microphone: ScriptedMicrophone,
}

/// Avatar over a fast engine, scripted recognizer and scripted microphone
#[must_use]
pub fn harness() -> Harness {
    let engine = fast_engine();
    let recognizer = ScriptedRecognizer::new();
    let microphone = ScriptedMicrophone::new();
    let avatar = Avatar::builder(Config::default())
        .engine(Arc::new(engine.clone()))
        .recognizer(Arc::new(recognizer.clone()))
        .microphone(Arc::new(microphone.clone()))
        .build()
        .expect("default config builds");

    Harness {
        avatar,
        engine,
        recognizer,
        microphone,
    }
}

/// Let spawned tasks catch up
///
/// With a paused clock the runtime only advances time once every task is
/// idle, so a short sleep drains all pending work.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
