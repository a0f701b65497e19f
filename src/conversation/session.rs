//! Conversation session
//!
//! Turns a user query into a spoken reply: builds the prompt from history
//! and optional news context, streams the completion into the streaming
//! speaker and records the exchange.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::Result;
use crate::completion::{ChatMessage, CompletionClient};
use crate::speech::{SpeechCompletion, StreamingSpeaker};

/// Prefix of the news context message
pub const NEWS_INSTRUCTION: &str = "INSTRUCTION: Use the following news context ONLY if the user's query is about news, current events, or news updates. If the user's question is not related to news, ignore this context and use your own knowledge.\n\n";

/// Exchanges kept in the prompt
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Source of recent news text relevant to a query
#[async_trait]
pub trait NewsRetriever: Send + Sync {
    /// Retrieve context chunks for `query`
    ///
    /// # Errors
    ///
    /// Returns error if retrieval fails; the reply proceeds without context
    async fn retrieve(&self, query: &str) -> Result<Vec<String>>;
}

/// Wrap retrieved news in the instruction to use it only for news questions
#[must_use]
pub fn news_context_message(chunks: &[String]) -> Option<ChatMessage> {
    let chunks: Vec<&str> = chunks
        .iter()
        .map(String::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if chunks.is_empty() {
        return None;
    }
    Some(ChatMessage::system(format!(
        "{NEWS_INSTRUCTION}{}",
        chunks.join("\n")
    )))
}

/// One completed question and answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exchange {
    pub id: Uuid,
    pub user: String,
    pub assistant: String,
    pub at: DateTime<Utc>,
}

/// A reply being spoken
#[must_use]
pub struct Reply {
    pub id: Uuid,
    /// Text received from the model
    pub text: String,
    /// Speech still in flight
    pub completion: SpeechCompletion,
    /// Cancelled before the model finished
    pub aborted: bool,
}

/// Chat history plus the speech pipeline for replies
pub struct ConversationSession {
    client: Arc<dyn CompletionClient>,
    speech: StreamingSpeaker,
    system_prompt: Option<String>,
    news: Option<Arc<dyn NewsRetriever>>,
    history: Mutex<Vec<Exchange>>,
    history_limit: usize,
    current: Mutex<Option<(Uuid, CancellationToken)>>,
}

impl ConversationSession {
    #[must_use]
    pub fn new(client: Arc<dyn CompletionClient>, speech: StreamingSpeaker) -> Self {
        Self {
            client,
            speech,
            system_prompt: None,
            news: None,
            history: Mutex::new(Vec::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            current: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_news(mut self, news: Arc<dyn NewsRetriever>) -> Self {
        self.news = Some(news);
        self
    }

    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Completed exchanges, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<Exchange> {
        self.history.lock().clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Cancel the reply in progress, if any
    pub fn cancel(&self) {
        if let Some((_, token)) = self.current.lock().take() {
            token.cancel();
        }
    }

    /// Answer `user_text` out loud
    ///
    /// Any reply still in progress is cancelled first. Resolves once the
    /// model has finished; await [`Reply::completion`] for the end of speech.
    ///
    /// # Errors
    ///
    /// Returns error if the completion request or stream fails. Speech is
    /// aborted before the error is returned.
    pub async fn respond(&self, user_text: &str) -> Result<Reply> {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        if let Some((_, previous)) = self.current.lock().replace((id, token.clone())) {
            previous.cancel();
        }
        tracing::debug!(%id, "responding");

        let messages = self.build_messages(user_text).await;
        let deltas = match self.client.stream(&messages).await {
            Ok(deltas) => deltas,
            Err(e) => {
                tracing::warn!(error = %e, "completion request failed");
                self.speech.abort();
                self.release(id);
                return Err(e);
            }
        };

        let outcome = self.speech.speak_stream(deltas, token.clone()).await;
        self.release(id);
        let outcome = outcome?;

        if !outcome.aborted && !outcome.text.trim().is_empty() {
            self.record(Exchange {
                id,
                user: user_text.trim().to_string(),
                assistant: outcome.text.clone(),
                at: Utc::now(),
            });
        }

        Ok(Reply {
            id,
            text: outcome.text,
            completion: outcome.completion,
            aborted: outcome.aborted,
        })
    }

    async fn build_messages(&self, user_text: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }

        if let Some(news) = &self.news {
            match news.retrieve(user_text).await {
                Ok(chunks) => {
                    tracing::debug!(chunks = chunks.len(), "news context retrieved");
                    messages.extend(news_context_message(&chunks));
                }
                Err(e) => tracing::warn!(error = %e, "news retrieval failed, continuing without context"),
            }
        }

        for exchange in self.history.lock().iter() {
            messages.push(ChatMessage::user(exchange.user.clone()));
            messages.push(ChatMessage::assistant(exchange.assistant.clone()));
        }
        messages.push(ChatMessage::user(user_text.trim()));
        messages
    }

    fn record(&self, exchange: Exchange) {
        let mut history = self.history.lock();
        history.push(exchange);
        let excess = history.len().saturating_sub(self.history_limit);
        history.drain(..excess);
    }

    /// Forget reply `id` if it is still the current one
    fn release(&self, id: Uuid) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|(current_id, _)| *current_id == id) {
            *current = None;
        }
    }
}
