//! Streaming response speaker
//!
//! Consumes a response as it is generated, releasing speakable chunks to the
//! queue as soon as the segmenter finds a boundary.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::driver::SpeakOptions;
use super::queue::{QueueStatus, SpeechQueue, SpeechTicket};
use super::segmenter::{clean_for_speech, segment};
use crate::Result;
use crate::completion::StreamDelta;

/// Channel capacity for stream events
const CHANNEL_CAPACITY: usize = 64;

/// Chunks shorter than this (after cleaning) are not worth speaking
const MIN_CHUNK_CHARS: usize = 2;

/// Lifecycle of a streamed response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Started { stream_id: u64 },
    ChunkQueued { stream_id: u64, text: String },
    Finished { stream_id: u64, chunks: usize },
    Aborted { stream_id: u64 },
}

/// Snapshot of the streaming speaker for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub is_streaming: bool,
    pub buffer_length: usize,
    pub queued_chunks: usize,
    pub queue: QueueStatus,
}

/// Outstanding speech for a finished stream
#[must_use = "await `wait` to know when speech has finished"]
#[derive(Default)]
pub struct SpeechCompletion {
    tickets: Vec<SpeechTicket>,
}

impl SpeechCompletion {
    /// Number of chunks handed to the queue
    #[must_use]
    pub fn chunks(&self) -> usize {
        self.tickets.len()
    }

    /// Wait until every chunk has been spoken or dropped
    ///
    /// # Errors
    ///
    /// Returns the first chunk failure that was not a cancellation
    pub async fn wait(self) -> Result<()> {
        for result in join_all(self.tickets).await {
            match result {
                Err(e) if !e.is_cancellation() => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Result of speaking a whole response stream
#[must_use]
pub struct StreamOutcome {
    /// Full response text received
    pub text: String,
    /// Speech still in flight for the response
    pub completion: SpeechCompletion,
    /// Whether the stream was cancelled before it ended
    pub aborted: bool,
}

struct ActiveStream {
    id: u64,
    buffer: String,
    processed: usize,
    spoken: HashSet<String>,
    token: CancellationToken,
    tickets: Vec<SpeechTicket>,
}

#[derive(Default)]
struct StreamState {
    next_id: u64,
    active: Option<ActiveStream>,
}

struct StreamingInner {
    queue: SpeechQueue,
    state: Mutex<StreamState>,
    events: broadcast::Sender<StreamEvent>,
}

/// Speaks a response while it is still being generated
#[derive(Clone)]
pub struct StreamingSpeaker {
    inner: Arc<StreamingInner>,
}

impl StreamingSpeaker {
    #[must_use]
    pub fn new(queue: SpeechQueue) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StreamingInner {
                queue,
                state: Mutex::new(StreamState::default()),
                events,
            }),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &SpeechQueue {
        &self.inner.queue
    }

    /// Subscribe to stream lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.events.subscribe()
    }

    /// Begin a new response stream, stopping any previous one
    ///
    /// Cancelling `cancel` aborts every chunk of this stream. Returns the
    /// stream id.
    pub fn start(&self, cancel: &CancellationToken) -> u64 {
        let (id, previous) = {
            let mut state = self.inner.state.lock();
            state.next_id += 1;
            let id = state.next_id;
            let previous = state.active.replace(ActiveStream {
                id,
                buffer: String::new(),
                processed: 0,
                spoken: HashSet::new(),
                token: cancel.child_token(),
                tickets: Vec::new(),
            });
            (id, previous)
        };

        if let Some(previous) = previous {
            previous.token.cancel();
            self.inner.queue.clear_all();
            tracing::debug!(stream_id = previous.id, "previous stream stopped");
        }

        tracing::debug!(stream_id = id, "response stream started");
        let _ = self.inner.events.send(StreamEvent::Started { stream_id: id });
        id
    }

    /// Feed the next piece of the response
    ///
    /// `full_text` is the cumulative response so far; only the part beyond
    /// what was already consumed is used. Returns the chunks queued by this
    /// call. Ignored when no stream is active.
    pub fn push(&self, chunk: &str, full_text: &str) -> Vec<String> {
        self.inner.push(None, chunk, full_text)
    }

    /// End the current stream, speaking whatever is still buffered
    pub fn finish(&self) -> SpeechCompletion {
        self.inner.finish(None)
    }

    /// Abort the current stream and clear the queue
    pub fn abort(&self) {
        self.inner.abort(None);
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.inner.state.lock().active.is_some()
    }

    #[must_use]
    pub fn status(&self) -> StreamStatus {
        let (is_streaming, buffer_length, queued_chunks) = {
            let state = self.inner.state.lock();
            state.active.as_ref().map_or((false, 0, 0), |s| {
                (true, s.buffer.len(), s.tickets.len())
            })
        };
        StreamStatus {
            is_streaming,
            buffer_length,
            queued_chunks,
            queue: self.inner.queue.status(),
        }
    }

    /// Speak a whole response stream
    ///
    /// Cancelling `cancel` aborts speech and resolves normally with
    /// `aborted` set. A stream error aborts speech and is returned.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `deltas`
    pub async fn speak_stream<S>(&self, mut deltas: S, cancel: CancellationToken) -> Result<StreamOutcome>
    where
        S: Stream<Item = Result<StreamDelta>> + Unpin + Send,
    {
        let id = self.start(&cancel);
        let mut text = String::new();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.inner.abort(Some(id));
                    return Ok(StreamOutcome {
                        text,
                        completion: SpeechCompletion::default(),
                        aborted: true,
                    });
                }
                next = deltas.next() => next,
            };

            match next {
                Some(Ok(delta)) => {
                    self.inner.push(Some(id), &delta.chunk, &delta.full_text);
                    text = delta.full_text;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, stream_id = id, "response stream failed");
                    self.inner.abort(Some(id));
                    return Err(e);
                }
                None => break,
            }
        }

        Ok(StreamOutcome {
            text,
            completion: self.inner.finish(Some(id)),
            aborted: false,
        })
    }
}

impl StreamingInner {
    fn push(&self, id: Option<u64>, chunk: &str, full_text: &str) -> Vec<String> {
        let mut queued = Vec::new();
        let mut state = self.state.lock();
        let Some(stream) = state
            .active
            .as_mut()
            .filter(|s| id.is_none_or(|id| s.id == id))
        else {
            tracing::trace!("no active stream, ignoring chunk");
            return queued;
        };
        if stream.token.is_cancelled() {
            return queued;
        }

        let Some(fresh) = full_text.get(stream.processed..) else {
            tracing::warn!(
                processed = stream.processed,
                len = full_text.len(),
                "response text does not extend what was consumed"
            );
            return queued;
        };
        tracing::trace!(chunk_len = chunk.len(), fresh_len = fresh.len(), "stream chunk");
        stream.buffer.push_str(fresh);
        stream.processed = full_text.len();

        loop {
            let pass = segment(&stream.buffer);
            if !pass.has_ready() {
                break;
            }
            stream.buffer = pass.remaining_text;
            if let Some(text) = self.enqueue_chunk(stream, &pass.ready_text) {
                queued.push(text);
            }
        }

        queued
    }

    fn finish(&self, id: Option<u64>) -> SpeechCompletion {
        let mut state = self.state.lock();
        if !state
            .active
            .as_ref()
            .is_some_and(|s| id.is_none_or(|id| s.id == id))
        {
            return SpeechCompletion::default();
        }
        let Some(mut stream) = state.active.take() else {
            return SpeechCompletion::default();
        };

        if !stream.token.is_cancelled() {
            let rest = std::mem::take(&mut stream.buffer);
            if !rest.trim().is_empty() {
                self.enqueue_chunk(&mut stream, &rest);
            }
        }

        let chunks = stream.tickets.len();
        tracing::debug!(stream_id = stream.id, chunks, "response stream finished");
        let _ = self.events.send(StreamEvent::Finished {
            stream_id: stream.id,
            chunks,
        });

        SpeechCompletion {
            tickets: stream.tickets,
        }
    }

    fn abort(&self, id: Option<u64>) {
        let stream = {
            let mut state = self.state.lock();
            let matches = state
                .active
                .as_ref()
                .is_some_and(|s| id.is_none_or(|id| s.id == id));
            if !matches && id.is_some() {
                return;
            }
            if matches { state.active.take() } else { None }
        };

        if let Some(stream) = stream {
            stream.token.cancel();
            tracing::debug!(stream_id = stream.id, "response stream aborted");
            let _ = self.events.send(StreamEvent::Aborted {
                stream_id: stream.id,
            });
        }
        self.queue.clear_all();
    }

    fn enqueue_chunk(&self, stream: &mut ActiveStream, text: &str) -> Option<String> {
        let clean = clean_for_speech(text);
        if clean.chars().count() < MIN_CHUNK_CHARS {
            return None;
        }

        if !stream.spoken.insert(clean.to_lowercase()) {
            tracing::debug!(text = %clean, "skipping chunk already spoken in this stream");
            return None;
        }

        let options = SpeakOptions::default()
            .with_cancel(stream.token.clone())
            .as_streaming();
        stream.tickets.push(self.queue.enqueue(&clean, options));

        let _ = self.events.send(StreamEvent::ChunkQueued {
            stream_id: stream.id,
            text: clean.clone(),
        });
        Some(clean)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::prefs::VoicePreferences;
    use crate::speech::{AvatarSignal, SimulatedEngine, SpeechDriver, SpeechTiming};

    fn speaker(engine: &SimulatedEngine) -> StreamingSpeaker {
        let driver = SpeechDriver::new(
            Arc::new(engine.clone()),
            AvatarSignal::new(),
            VoicePreferences::default(),
            SpeechTiming::default(),
        );
        StreamingSpeaker::new(SpeechQueue::new(Arc::new(driver), Duration::from_millis(150)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_without_stream_is_ignored() {
        let engine = SimulatedEngine::new();
        let speaker = speaker(&engine);
        assert!(speaker.push("Hi.", "Hi.").is_empty());
        assert_eq!(speaker.finish().chunks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_markdown_cleaned_and_short_chunks_dropped() {
        let engine = SimulatedEngine::new();
        let speaker = speaker(&engine);
        speaker.start(&CancellationToken::new());

        let queued = speaker.push("", "**Bold** claim. A. ");
        assert_eq!(queued, vec!["Bold claim. A."]);

        speaker.push("", "**Bold** claim. A. !");
        assert_eq!(speaker.finish().chunks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_within_stream_skipped() {
        let engine = SimulatedEngine::new();
        let speaker = speaker(&engine);
        speaker.start(&CancellationToken::new());

        assert_eq!(speaker.push("", "Okay. "), vec!["Okay."]);
        assert!(speaker.push("", "Okay. okay. ").is_empty());

        speaker.start(&CancellationToken::new());
        assert_eq!(speaker.push("", "Okay. "), vec!["Okay."]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_clears_everything() {
        let engine = SimulatedEngine::new();
        let speaker = speaker(&engine);
        let mut events = speaker.subscribe();
        speaker.start(&CancellationToken::new());
        speaker.push("", "First sentence here. Second one. Third one. ");

        speaker.abort();
        let status = speaker.status();
        assert!(!status.is_streaming);
        assert_eq!(status.queue.queue_length, 0);

        let mut saw_abort = false;
        while let Ok(event) = events.try_recv() {
            saw_abort |= matches!(event, StreamEvent::Aborted { .. });
        }
        assert!(saw_abort);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speak_stream_failure_aborts() {
        let engine = SimulatedEngine::new();
        let speaker = speaker(&engine);
        let deltas = futures::stream::iter(vec![
            Ok(StreamDelta::new("Hello there. ", "Hello there. ")),
            Err(crate::Error::Completion("connection reset".to_string())),
        ]);

        let result = speaker.speak_stream(deltas, CancellationToken::new()).await;
        assert!(matches!(result, Err(crate::Error::Completion(_))));
        assert!(!speaker.is_streaming());
        assert!(speaker.queue().is_empty());
    }
}
