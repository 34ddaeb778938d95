//! Streaming client for OpenAI-compatible chat completion APIs
//!
//! Requests are sent with `"stream": true`; the server answers with
//! server-sent events, one JSON chunk per `data:` line, terminated by
//! `data: [DONE]`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::debug;

use super::message::ChatMessage;
use super::tokens::TokenCounter;
use super::{Completion, LanguageModel, LlmError};
use crate::metrics::LLM_CALL_DURATION;

/// One `chat.completion.chunk` from the stream
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// A decoded server-sent event payload
#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into SSE `data:` payloads
///
/// Network chunks can end anywhere, including inside a UTF-8 sequence, so
/// bytes are buffered until a full line is available.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = Self::parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Whatever is left once the stream has ended without a trailing newline
    fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        Self::parse_line(&rest)
    }

    fn parse_line(line: &[u8]) -> Option<SseEvent> {
        let line = String::from_utf8_lossy(line);
        let data = line.trim().strip_prefix("data:")?.trim();
        match data {
            "" => None,
            "[DONE]" => Some(SseEvent::Done),
            payload => Some(SseEvent::Data(payload.to_string())),
        }
    }
}

/// Client for `POST {base_url}/chat/completions`
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    tokens: Arc<TokenCounter>,
}

impl ChatClient {
    /// Create a new chat client
    ///
    /// # Arguments
    /// * `base_url` - API root, e.g. "https://api.openai.com/v1" or "http://localhost:11434/v1"
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            client: reqwest::Client::new(),
            tokens: Arc::new(TokenCounter::new()),
        }
    }

    /// Send `Authorization: Bearer <key>` with every request
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LanguageModel for ChatClient {
    async fn generate(
        &self,
        model: &str,
        messages: &[ChatMessage],
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<Completion, LlmError> {
        let start = Instant::now();
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut bytes_stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut completion = Completion::default();
        let mut done = false;

        while !done {
            let events = match bytes_stream.next().await {
                Some(chunk) => decoder.push(&chunk?),
                None => {
                    done = true;
                    decoder.finish().into_iter().collect()
                }
            };

            for event in events {
                let payload = match event {
                    SseEvent::Done => {
                        done = true;
                        break;
                    }
                    SseEvent::Data(payload) => payload,
                };

                let chunk: StreamChunk = serde_json::from_str(&payload)?;
                if let Some(err) = chunk.error {
                    return Err(LlmError::Api(err.message));
                }
                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                        on_chunk(&content);
                        completion.content.push_str(&content);
                    }
                    if choice.finish_reason.is_some() {
                        completion.finish_reason = choice.finish_reason;
                    }
                }
                if let Some(usage) = chunk.usage {
                    completion.completion_tokens = Some(usage.completion_tokens);
                }
            }
        }

        LLM_CALL_DURATION
            .with_label_values(&[model])
            .observe(start.elapsed().as_secs_f64());

        if completion.content.is_empty() && completion.finish_reason.is_none() {
            return Err(LlmError::EmptyResponse);
        }

        debug!(
            model,
            chars = completion.content.len(),
            finish_reason = ?completion.finish_reason,
            "completion received"
        );
        Ok(completion)
    }

    fn count_tokens(&self, model: &str, text: &str) -> usize {
        self.tokens.count(model, text)
    }
}
