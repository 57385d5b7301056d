//! Chat completion via a local Ollama server
//!
//! `POST /api/chat` either answers with one JSON object or, when streaming,
//! with newline-delimited JSON fragments ending in `"done": true`:
//!
//! ```json
//! {"message":{"role":"assistant","content":"Hel"},"done":false}
//! {"message":{"role":"assistant","content":"lo"},"done":false}
//! {"message":{"role":"assistant","content":""},"done":true}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::history::Exchange;
use crate::{Error, Result};

/// Request timeout for chat completions
pub const CHAT_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for the connectivity check
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Generates replies from a prompt and prior context
#[async_trait]
pub trait Responder: Send + Sync {
    /// Reply to `prompt`
    ///
    /// `context` starts with the system prelude followed by earlier
    /// exchanges, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResponderTimeout`] if the server is too slow, or
    /// another error if the request fails
    async fn respond(&self, context: &[Exchange], prompt: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<&'a Exchange>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// One chat response object, or one NDJSON line when streaming
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

/// Reassembles a streamed NDJSON body into the full reply
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence, so
/// lines are cut from a byte buffer.
#[derive(Debug, Default)]
pub struct NdjsonAssembler {
    buffer: Vec<u8>,
    text: String,
    fragments: usize,
    done: bool,
}

impl NdjsonAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw body bytes
    ///
    /// # Errors
    ///
    /// Returns error if a complete line is not valid JSON or carries an
    /// error from the server
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(bytes);

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            self.line(&line)?;
        }

        Ok(())
    }

    /// Whether the final fragment was seen
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.done
    }

    /// Flush any unterminated last line and return the reply
    ///
    /// # Errors
    ///
    /// Returns error if the trailing line is malformed
    pub fn finish(mut self) -> Result<String> {
        let rest = std::mem::take(&mut self.buffer);
        self.line(&rest)?;

        if !self.done {
            tracing::warn!(fragments = self.fragments, "stream ended without done marker");
        }
        Ok(self.text)
    }

    fn line(&mut self, line: &[u8]) -> Result<()> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        let chunk: ChatChunk = serde_json::from_str(line)?;
        if let Some(err) = chunk.error {
            return Err(Error::Responder(err));
        }
        if let Some(message) = chunk.message {
            self.text.push_str(&message.content);
        }
        self.fragments += 1;
        self.done |= chunk.done;
        Ok(())
    }
}

/// Ollama `/api/chat` client
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    stream: bool,
}

impl OllamaClient {
    /// Create a client for the server at `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: &str, model: String, stream: bool) -> Result<Self> {
        Self::with_timeout(base_url, model, stream, CHAT_TIMEOUT)
    }

    /// Create a client with a custom request timeout
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn with_timeout(
        base_url: &str,
        model: String,
        stream: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        tracing::info!(model = %model, url = %base_url, stream, "ollama client ready");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            stream,
        })
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check `/api/tags`; any failure is logged, not returned
    pub async fn check_connection(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(CHECK_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(status = %response.status(), "ollama connection check failed");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, url = %self.base_url, "cannot connect to ollama");
                false
            }
        }
    }

    /// Names of models installed on the server
    ///
    /// # Errors
    ///
    /// Returns error if the server cannot be reached
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Responder(format!("ollama error {status}: {body}")));
        }

        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn request_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            tracing::error!("request to ollama timed out");
            Error::ResponderTimeout
        } else if e.is_connect() {
            Error::Responder(format!("cannot connect to ollama at {}: {e}", self.base_url))
        } else {
            Error::Http(e)
        }
    }

    async fn read_streamed(&self, response: reqwest::Response) -> Result<String> {
        let mut body = response.bytes_stream();
        let mut assembler = NdjsonAssembler::new();

        while let Some(bytes) = body.next().await {
            let bytes = bytes.map_err(|e| self.request_error(e))?;
            assembler.push(&bytes)?;
            if assembler.is_done() {
                break;
            }
        }

        assembler.finish()
    }
}

#[async_trait]
impl Responder for OllamaClient {
    async fn respond(&self, context: &[Exchange], prompt: &str) -> Result<String> {
        tracing::info!(prompt = %prompt, "generating response");

        let user = Exchange::user(prompt);
        let request = ChatRequest {
            model: &self.model,
            messages: context.iter().chain(std::iter::once(&user)).collect(),
            stream: self.stream,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "ollama error");
            return Err(Error::Responder(format!("ollama error {status}: {body}")));
        }

        let text = if self.stream {
            self.read_streamed(response).await?
        } else {
            let chunk: ChatChunk = response.json().await.map_err(|e| self.request_error(e))?;
            if let Some(err) = chunk.error {
                return Err(Error::Responder(err));
            }
            chunk.message.map(|m| m.content).unwrap_or_default()
        };

        let text = text.trim().to_string();
        tracing::debug!(chars = text.len(), "response received");
        Ok(text)
    }
}
