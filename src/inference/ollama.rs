//! Ollama API client for chat inference

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;

use super::{ChatRequest, InferenceError, InferenceService, Token, TokenStream};

/// One NDJSON line of a streaming `/api/chat` response
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
}

/// Client for interacting with Ollama's HTTP API
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    /// Create a new Ollama client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the Ollama server (e.g., "http://localhost:11434")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check that the server answers at all
    pub async fn ping(&self) -> Result<(), InferenceError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(InferenceError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Turn one response line into tokens plus the `done` flag
fn parse_line(line: &[u8]) -> Result<(Vec<Token>, bool), InferenceError> {
    let chunk: ChatChunk = serde_json::from_slice(line)?;
    if let Some(error) = chunk.error {
        return Err(InferenceError::Model(error));
    }

    let mut tokens = Vec::new();
    if let Some(message) = chunk.message {
        if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
            tokens.push(Token::Thinking(thinking));
        }
        if !message.content.is_empty() {
            tokens.push(Token::Content(message.content));
        }
    }
    Ok((tokens, chunk.done))
}

#[async_trait]
impl InferenceService for OllamaClient {
    /// Stream a chat completion
    ///
    /// Ollama answers with newline-delimited JSON. HTTP chunks do not line up
    /// with JSON lines, so bytes are buffered until a full line is available.
    async fn stream_tokens(&self, request: ChatRequest) -> Result<TokenStream, InferenceError> {
        let endpoint = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .json(&serde_json::json!({
                "model": request.model,
                "messages": request.messages,
                "stream": true,
                "think": request.think,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(InferenceError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let mut bytes_stream = response.bytes_stream();
        let tokens = async_stream::stream! {
            let mut buf: Vec<u8> = Vec::new();
            'read: while let Some(chunk) = bytes_stream.next().await {
                match chunk {
                    Ok(bytes) => buf.extend_from_slice(&bytes),
                    Err(e) => {
                        yield Err(InferenceError::from(e));
                        return;
                    }
                }
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match parse_line(&line) {
                        Ok((parsed, done)) => {
                            for token in parsed {
                                yield Ok(token);
                            }
                            if done {
                                break 'read;
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            // Final line without a trailing newline
            if !buf.iter().all(u8::is_ascii_whitespace) {
                match parse_line(&buf) {
                    Ok((parsed, _)) => {
                        for token in parsed {
                            yield Ok(token);
                        }
                    }
                    Err(e) => yield Err(e),
                }
            }
        };

        Ok(Box::pin(tokens))
    }
}
