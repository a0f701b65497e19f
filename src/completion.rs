//! Chat completion client
//!
//! The avatar only needs two things from a language model: a full reply, or
//! a stream of text deltas it can start speaking before the reply is done.
//! [`OpenAiClient`] talks to any OpenAI-compatible `/chat/completions` API.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Stream of response deltas
pub type DeltaStream = BoxStream<'static, Result<StreamDelta>>;

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message as sent to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One increment of a streamed reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDelta {
    /// Text added by this increment
    pub chunk: String,
    /// Whole reply so far
    pub full_text: String,
}

impl StreamDelta {
    pub fn new(chunk: impl Into<String>, full_text: impl Into<String>) -> Self {
        Self {
            chunk: chunk.into(),
            full_text: full_text.into(),
        }
    }
}

/// Language model backend
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Request a complete reply
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the reply is empty
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Request a streamed reply
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started; errors during the
    /// stream are yielded as stream items
    async fn stream(&self, messages: &[ChatMessage]) -> Result<DeltaStream>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
}

#[derive(Deserialize)]
struct ResponseChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

/// Client for OpenAI-compatible chat completion APIs
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: Url,
    model: String,
    api_key: Option<SecretString>,
    temperature: f32,
}

impl OpenAiClient {
    /// Default sampling temperature
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;

    /// Create a client for `base_url` (e.g. `https://api.openai.com/v1`)
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `base_url` is not a valid URL
    pub fn new(base_url: &str, model: impl Into<String>, api_key: Option<SecretString>) -> Result<Self> {
        let mut base =
            Url::parse(base_url).map_err(|e| Error::Config(format!("invalid completion url: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join("chat/completions")
            .map_err(|e| Error::Config(format!("invalid completion url: {e}")))?;

        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            model: model.into(),
            api_key,
            temperature: Self::DEFAULT_TEMPERATURE,
        })
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request(&self, messages: &[ChatMessage], stream: bool) -> reqwest::RequestBuilder {
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream,
            temperature: self.temperature,
        };
        let request = self.http.post(self.endpoint.clone()).json(&body);
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        tracing::debug!(model = %self.model, messages = messages.len(), "requesting completion");
        let response: ChatResponse = self
            .request(messages, false)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::Completion("empty completion".to_string()))
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<DeltaStream> {
        tracing::debug!(model = %self.model, messages = messages.len(), "requesting streamed completion");
        let response = self
            .request(messages, true)
            .send()
            .await?
            .error_for_status()?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(sse_deltas(bytes))
    }
}

/// A parsed server-sent-events line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// Text content delta
    Content(String),
    /// End of stream marker
    Done,
    /// Comment, keep-alive, or a delta without content
    Skip,
}

/// Parse one line of an OpenAI-style event stream
///
/// # Errors
///
/// Returns `Error::Serialization` if a `data:` payload is not valid JSON
pub fn parse_sse_line(line: &str) -> Result<SseLine> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }

    let chunk: StreamChunk = serde_json::from_str(data)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty())
        .map_or(SseLine::Skip, SseLine::Content))
}

struct SseState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    full_text: String,
    done: bool,
}

impl SseState {
    fn drain_lines(&mut self) -> Result<()> {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            match parse_sse_line(String::from_utf8_lossy(&line).trim())? {
                SseLine::Content(content) => self.pending.push_back(content),
                SseLine::Done => self.done = true,
                SseLine::Skip => {}
            }
        }
        Ok(())
    }
}

/// Turn a raw event-stream body into cumulative deltas
fn sse_deltas(bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> DeltaStream {
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        full_text: String::new(),
        done: false,
    };

    futures::stream::try_unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.pending.pop_front() {
                state.full_text.push_str(&chunk);
                let delta = StreamDelta::new(chunk, state.full_text.clone());
                return Ok(Some((delta, state)));
            }
            if state.done {
                return Ok(None);
            }
            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    state.drain_lines()?;
                }
                Some(Err(e)) => return Err(Error::from(e)),
                None => {
                    state.buffer.push(b'\n');
                    state.drain_lines()?;
                    state.done = true;
                }
            }
        }
    })
    .boxed()
}
