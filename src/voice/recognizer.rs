//! Speech recognizer contract
//!
//! The platform recognizer is a collaborator: the core only starts and stops
//! it and consumes its events. [`ScriptedRecognizer`] stands in for it in
//! tests and in the text-driven CLI.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{Error, Result};

/// Channel capacity for recognizer events
const CHANNEL_CAPACITY: usize = 64;

/// Event from a speech recognizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecognizerEvent {
    Started,
    Ended,
    Error { code: String, message: String },
    Result {
        /// Finalized transcript, empty if only interim text changed
        final_text: String,
        interim_text: String,
    },
}

/// Continuous speech-to-text
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Begin listening
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if microphone access is denied, or
    /// `Error::Recognizer` if recognition cannot start
    async fn start(&self) -> Result<()>;

    /// Stop listening; a no-op when idle
    fn stop(&self);

    fn is_listening(&self) -> bool;

    /// Subscribe to recognizer events
    fn subscribe(&self) -> broadcast::Receiver<RecognizerEvent>;
}

/// User-facing text for a platform recognizer error code
#[must_use]
pub fn recognizer_error_message(code: &str) -> &'static str {
    match code {
        "no-speech" => "No speech detected. Please try again.",
        "audio-capture" => "Microphone is not accessible. Please check your audio settings.",
        "not-allowed" => "Microphone permission denied. Please allow microphone access.",
        "network" => "Network error occurred. Please check your connection.",
        "service-not-allowed" => "Speech recognition service is not allowed.",
        _ => "Speech recognition error occurred.",
    }
}

struct ScriptedInner {
    listening: AtomicBool,
    denied: AtomicBool,
    starts: AtomicUsize,
    events: broadcast::Sender<RecognizerEvent>,
}

/// Recognizer driven by injected transcripts
#[derive(Clone)]
pub struct ScriptedRecognizer {
    inner: Arc<ScriptedInner>,
}

impl Default for ScriptedRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRecognizer {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ScriptedInner {
                listening: AtomicBool::new(false),
                denied: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
                events,
            }),
        }
    }

    /// Make every later `start` fail as if permission were refused
    pub fn deny_permission(&self) {
        self.inner.denied.store(true, Ordering::SeqCst);
    }

    /// Number of successful starts
    #[must_use]
    pub fn start_count(&self) -> usize {
        self.inner.starts.load(Ordering::SeqCst)
    }

    /// Deliver a final transcript
    ///
    /// Returns `false` (and delivers nothing) when not listening.
    pub fn inject_final(&self, text: &str) -> bool {
        self.deliver(RecognizerEvent::Result {
            final_text: text.to_string(),
            interim_text: String::new(),
        })
    }

    /// Deliver an interim transcript
    pub fn inject_interim(&self, text: &str) -> bool {
        self.deliver(RecognizerEvent::Result {
            final_text: String::new(),
            interim_text: text.to_string(),
        })
    }

    /// Deliver a platform error code
    pub fn inject_error(&self, code: &str) -> bool {
        self.deliver(RecognizerEvent::Error {
            code: code.to_string(),
            message: recognizer_error_message(code).to_string(),
        })
    }

    fn deliver(&self, event: RecognizerEvent) -> bool {
        if !self.is_listening() {
            tracing::trace!(?event, "recognizer not listening, dropping event");
            return false;
        }
        let _ = self.inner.events.send(event);
        true
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn start(&self) -> Result<()> {
        if self.inner.denied.load(Ordering::SeqCst) {
            let message = recognizer_error_message("not-allowed");
            let _ = self.inner.events.send(RecognizerEvent::Error {
                code: "not-allowed".to_string(),
                message: message.to_string(),
            });
            return Err(Error::Permission(message.to_string()));
        }
        if !self.inner.listening.swap(true, Ordering::SeqCst) {
            self.inner.starts.fetch_add(1, Ordering::SeqCst);
            let _ = self.inner.events.send(RecognizerEvent::Started);
        }
        Ok(())
    }

    fn stop(&self) {
        if self.inner.listening.swap(false, Ordering::SeqCst) {
            let _ = self.inner.events.send(RecognizerEvent::Ended);
        }
    }

    fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<RecognizerEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            recognizer_error_message("no-speech"),
            "No speech detected. Please try again."
        );
        assert!(recognizer_error_message("not-allowed").contains("permission denied"));
        assert_eq!(
            recognizer_error_message("bogus"),
            "Speech recognition error occurred."
        );
    }

    #[tokio::test]
    async fn test_scripted_lifecycle() {
        let recognizer = ScriptedRecognizer::new();
        let mut events = recognizer.subscribe();

        assert!(!recognizer.inject_final("ignored"));
        recognizer.start().await.unwrap();
        recognizer.start().await.unwrap();
        assert_eq!(recognizer.start_count(), 1);
        assert!(recognizer.inject_final("hello"));
        recognizer.stop();
        recognizer.stop();

        assert_eq!(events.recv().await.unwrap(), RecognizerEvent::Started);
        assert_eq!(
            events.recv().await.unwrap(),
            RecognizerEvent::Result {
                final_text: "hello".to_string(),
                interim_text: String::new(),
            }
        );
        assert_eq!(events.recv().await.unwrap(), RecognizerEvent::Ended);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_denied_permission() {
        let recognizer = ScriptedRecognizer::new();
        recognizer.deny_permission();

        let err = recognizer.start().await.unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
        assert!(!recognizer.is_listening());
    }
}
