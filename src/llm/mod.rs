//! Language model integration
//!
//! The agent talks to the model through the [`LanguageModel`] trait. The
//! production implementation is [`ChatClient`], a streaming client for any
//! OpenAI-compatible `/chat/completions` endpoint (OpenAI itself, or Ollama
//! under `/v1`).

pub mod client;
pub mod message;
pub mod tokens;

use async_trait::async_trait;

pub use client::ChatClient;
pub use message::{ChatMessage, Conversation, Role};
pub use tokens::TokenCounter;

/// A fully received model response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    /// Concatenated content of every streamed delta
    pub content: String,
    /// Why the model stopped, when the server reports it ("stop", "length")
    pub finish_reason: Option<String>,
    /// Server-reported completion token count, when available
    pub completion_tokens: Option<u64>,
}

/// Errors from talking to the model server
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request to model server failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed stream event: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model server reported an error: {0}")]
    Api(String),
    #[error("model returned an empty response")]
    EmptyResponse,
}

/// A chat model that streams its answer
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one completion over the whole conversation
    ///
    /// `on_chunk` is called with every content fragment as it arrives; the
    /// future resolves once the full response has been received.
    async fn generate(
        &self,
        model: &str,
        messages: &[ChatMessage],
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<Completion, LlmError>;

    /// Number of tokens `text` occupies for `model`
    fn count_tokens(&self, model: &str, text: &str) -> usize;
}
