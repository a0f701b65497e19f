//! Sequential speech queue
//!
//! Chunks are spoken strictly one after another in enqueue order. Each
//! enqueue returns a ticket that resolves with that chunk's outcome. An
//! emergency clear rejects everything waiting and stops the current chunk.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::driver::{SpeakOptions, Speaker};
use crate::{Error, Result};

/// Resolves when a queued chunk has been spoken, skipped or rejected
#[must_use = "a ticket does nothing unless awaited; dropping it does not cancel the chunk"]
pub struct SpeechTicket {
    inner: Ticket,
}

enum Ticket {
    Ready(Option<Result<()>>),
    Pending(oneshot::Receiver<Result<()>>),
}

impl SpeechTicket {
    fn ready(result: Result<()>) -> Self {
        Self {
            inner: Ticket::Ready(Some(result)),
        }
    }

    const fn pending(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            inner: Ticket::Pending(rx),
        }
    }
}

impl Future for SpeechTicket {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Ticket::Ready(result) => Poll::Ready(result.take().unwrap_or(Ok(()))),
            Ticket::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|reply| reply.unwrap_or(Err(Error::QueueCleared))),
        }
    }
}

/// Snapshot of queue state for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub is_processing: bool,
    pub is_speaking: bool,
}

struct Entry {
    text: String,
    key: String,
    options: SpeakOptions,
    reply: oneshot::Sender<Result<()>>,
}

struct QueueState {
    entries: VecDeque<Entry>,
    processing: bool,
    /// Replaced on every clear so a stale worker can tell it was superseded
    epoch: CancellationToken,
}

struct QueueInner {
    speaker: Arc<dyn Speaker>,
    pause: Duration,
    state: Mutex<QueueState>,
}

/// Cloneable handle to a sequential speech queue
#[derive(Clone)]
pub struct SpeechQueue {
    inner: Arc<QueueInner>,
}

impl SpeechQueue {
    /// Create a queue speaking through `speaker`
    ///
    /// `pause` is inserted between chunks while more are waiting.
    #[must_use]
    pub fn new(speaker: Arc<dyn Speaker>, pause: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                speaker,
                pause,
                state: Mutex::new(QueueState {
                    entries: VecDeque::new(),
                    processing: false,
                    epoch: CancellationToken::new(),
                }),
            }),
        }
    }

    /// Add a chunk to the queue
    ///
    /// Empty text resolves at once. A chunk identical (after whitespace
    /// normalization) to one still waiting resolves `Ok` without being queued
    /// again. Processing starts automatically.
    pub fn enqueue(&self, text: &str, options: SpeakOptions) -> SpeechTicket {
        let text = text.trim();
        if text.is_empty() {
            return SpeechTicket::ready(Ok(()));
        }
        if options.is_cancelled() {
            tracing::debug!("chunk aborted before queueing");
            return SpeechTicket::ready(options.aborted());
        }

        let key = normalize(text);
        let (tx, rx) = oneshot::channel();

        let worker = {
            let mut state = self.inner.state.lock();
            if state.entries.iter().any(|e| e.key == key) {
                tracing::debug!(text, "skipping duplicate chunk");
                return SpeechTicket::ready(Ok(()));
            }

            state.entries.push_back(Entry {
                text: text.to_string(),
                key,
                options,
                reply: tx,
            });
            tracing::debug!(queue_length = state.entries.len(), "chunk queued");

            if state.processing {
                None
            } else {
                state.processing = true;
                Some(state.epoch.clone())
            }
        };

        if let Some(epoch) = worker {
            tokio::spawn(Arc::clone(&self.inner).process(epoch));
        }

        SpeechTicket::pending(rx)
    }

    /// Emergency clear
    ///
    /// Rejects every waiting chunk with `Error::QueueCleared`, stops the chunk
    /// being spoken and resets processing so the next enqueue starts fresh.
    /// Returns the number of rejected chunks.
    pub fn clear_all(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut state = self.inner.state.lock();
            state.epoch.cancel();
            state.epoch = CancellationToken::new();
            state.processing = false;
            state.entries.drain(..).collect()
        };

        let count = drained.len();
        for entry in drained {
            let _ = entry.reply.send(Err(Error::QueueCleared));
        }
        self.inner.speaker.stop();

        tracing::debug!(rejected = count, "speech queue cleared");
        count
    }

    /// Number of chunks waiting (excluding the one being spoken)
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.inner.state.lock().processing
    }

    #[must_use]
    pub fn status(&self) -> QueueStatus {
        let (queue_length, is_processing) = {
            let state = self.inner.state.lock();
            (state.entries.len(), state.processing)
        };
        QueueStatus {
            queue_length,
            is_processing,
            is_speaking: self.inner.speaker.is_speaking(),
        }
    }
}

impl QueueInner {
    async fn process(self: Arc<Self>, epoch: CancellationToken) {
        tracing::debug!("queue processing started");

        loop {
            let entry = {
                let mut state = self.state.lock();
                if epoch.is_cancelled() {
                    return;
                }
                match state.entries.pop_front() {
                    Some(entry) => entry,
                    None => {
                        state.processing = false;
                        tracing::debug!("queue processing completed");
                        return;
                    }
                }
            };

            if entry.options.is_cancelled() {
                let _ = entry.reply.send(entry.options.aborted());
                continue;
            }

            let result = tokio::select! {
                biased;
                () = epoch.cancelled() => entry.options.aborted(),
                result = self.speaker.speak(&entry.text, entry.options.clone()) => result,
            };

            let halted = matches!(result, Err(Error::Aborted));
            if let Err(e) = &result {
                if !e.is_cancellation() {
                    tracing::warn!(error = %e, text = %entry.text, "chunk failed, continuing");
                }
            }
            let _ = entry.reply.send(result);

            if halted {
                self.halt(&epoch);
                return;
            }

            if !self.state.lock().entries.is_empty() {
                tokio::select! {
                    biased;
                    () = epoch.cancelled() => return,
                    () = tokio::time::sleep(self.pause) => {}
                }
            }
        }
    }

    /// Reject everything still waiting after an abort
    fn halt(&self, epoch: &CancellationToken) {
        let drained: Vec<Entry> = {
            let mut state = self.state.lock();
            if epoch.is_cancelled() {
                return;
            }
            state.processing = false;
            state.entries.drain(..).collect()
        };

        tracing::debug!(rejected = drained.len(), "queue halted by abort");
        for entry in drained {
            let _ = entry.reply.send(Err(Error::Aborted));
        }
    }
}

/// Dedup key: trimmed with internal whitespace collapsed
fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
