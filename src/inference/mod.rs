//! Language-model inference
//!
//! The chat agent only needs a stream of tokens for a list of messages.
//! [`InferenceService`] is that seam; [`OllamaClient`] implements it over
//! Ollama's streaming `/api/chat` endpoint.

pub mod ollama;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use ollama::OllamaClient;

/// Errors from the inference backend
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response line: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("model error: {0}")]
    Model(String),
}

/// A message sent to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One streamed fragment of model output
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Reasoning text (only produced when thinking is requested)
    Thinking(String),
    /// Answer text
    Content(String),
}

/// Parameters of one completion
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Ask the model to stream its reasoning as well
    pub think: bool,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<Token, InferenceError>> + Send>>;

/// Opaque streaming token producer
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn stream_tokens(&self, request: ChatRequest) -> Result<TokenStream, InferenceError>;
}
