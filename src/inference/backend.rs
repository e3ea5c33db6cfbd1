//! Client for the text-generation backend (Ollama `/api/generate`).
//!
//! Failures are values: every call yields `Result<BackendChunk, BackendError>`
//! items instead of returning early through the caller. A streamed body is
//! newline-delimited JSON and is decoded lazily as the response arrives.

use std::fmt::Display;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::BackendConfig;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("API request failed: {0}")]
    Transport(String),

    #[error("API request failed: backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The backend reported an error in its own payload.
    #[error("{0}")]
    Backend(String),

    #[error("Failed to parse streaming response")]
    MalformedLine,

    #[error("Failed to parse backend response: {0}")]
    MalformedBody(String),
}

/// Body of one generate call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
}

/// One unit of backend output. `response` is absent when the backend
/// replied with a well-formed object that lacks the field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendChunk {
    pub response: Option<String>,
    pub done: bool,
}

impl BackendChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            response: Some(text.into()),
            done: false,
        }
    }
}

pub type BackendResult = Result<BackendChunk, BackendError>;
pub type ChunkStream = BoxStream<'static, BackendResult>;

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    done: bool,
}

impl From<WireChunk> for BackendResult {
    fn from(wire: WireChunk) -> Self {
        match wire.error {
            Some(message) => Err(BackendError::Backend(message)),
            None => Ok(BackendChunk {
                response: wire.response,
                done: wire.done,
            }),
        }
    }
}

/// A text-generation backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Blocking call: one reply for the whole generation.
    async fn generate(&self, request: BackendRequest) -> BackendResult;

    /// Incremental call: a finite, non-restartable sequence of chunks.
    /// Consumers treat the first `Err` item as terminal.
    async fn generate_stream(&self, request: BackendRequest) -> ChunkStream;
}

/// HTTP client for an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    generate_url: String,
    request_timeout: Duration,
    idle_timeout: Duration,
}

impl OllamaClient {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            generate_url: format!("{}/api/generate", config.base_url.trim_end_matches('/')),
            request_timeout: config.request_timeout(),
            idle_timeout: config.stream_idle_timeout(),
        })
    }

    pub fn generate_url(&self) -> &str {
        &self.generate_url
    }

    /// Send the request and check the status. The head must arrive within `wait`.
    async fn send(
        &self,
        request: &BackendRequest,
        wait: Duration,
    ) -> Result<reqwest::Response, BackendError> {
        let pending = self.http.post(&self.generate_url).json(request).send();
        let response = tokio::time::timeout(wait, pending)
            .await
            .map_err(|_| BackendError::Transport(format!("no response within {wait:?}")))?
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Backend for OllamaClient {
    async fn generate(&self, request: BackendRequest) -> BackendResult {
        let call = async {
            let response = self.send(&request, self.request_timeout).await?;
            let body = response
                .bytes()
                .await
                .map_err(|e| BackendError::Transport(e.to_string()))?;
            let wire: WireChunk = serde_json::from_slice(&body)
                .map_err(|e| BackendError::MalformedBody(e.to_string()))?;
            BackendResult::from(wire)
        };

        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Transport(format!(
                "generation did not finish within {:?}",
                self.request_timeout
            ))),
        }
    }

    async fn generate_stream(&self, request: BackendRequest) -> ChunkStream {
        match self.send(&request, self.idle_timeout).await {
            Ok(response) => ndjson_chunks(response.bytes_stream(), self.idle_timeout).boxed(),
            Err(e) => {
                warn!(error = %e, "backend stream could not be opened");
                stream::once(async move { Err(e) }).boxed()
            }
        }
    }
}

/// Decode a newline-delimited JSON body into backend chunks.
///
/// Lines may be split across body frames. Blank lines are skipped, a final
/// unterminated line is still decoded. An undecodable line yields
/// [`BackendError::MalformedLine`] and decoding continues; a read failure or
/// an idle gap longer than `idle_timeout` yields a transport error and ends
/// the sequence.
pub fn ndjson_chunks<S, B, E>(body: S, idle_timeout: Duration) -> impl Stream<Item = BackendResult>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    stream! {
        let mut body = Box::pin(body);
        let mut buffer = BytesMut::new();

        loop {
            let next = match tokio::time::timeout(idle_timeout, body.next()).await {
                Ok(next) => next,
                Err(_) => {
                    yield Err(BackendError::Transport(format!(
                        "stream idle for more than {idle_timeout:?}"
                    )));
                    return;
                }
            };

            match next {
                Some(Ok(frame)) => {
                    buffer.extend_from_slice(frame.as_ref());
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line = buffer.split_to(pos);
                        buffer.advance(1);
                        if let Some(item) = decode_line(&line) {
                            yield item;
                        }
                    }
                }
                Some(Err(e)) => {
                    yield Err(BackendError::Transport(e.to_string()));
                    return;
                }
                None => break,
            }
        }

        if let Some(item) = decode_line(&buffer) {
            yield item;
        }
    }
}

fn decode_line(line: &[u8]) -> Option<BackendResult> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_slice::<WireChunk>(line) {
        Ok(wire) => Some(wire.into()),
        Err(e) => {
            debug!(error = %e, "undecodable stream line");
            Some(Err(BackendError::MalformedLine))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&'static str]) -> impl Stream<Item = Result<&'static [u8], String>> {
        stream::iter(parts.iter().copied().map(|p| Ok(p.as_bytes())).collect::<Vec<_>>())
    }

    async fn decode(parts: &[&'static str]) -> Vec<BackendResult> {
        ndjson_chunks(frames(parts), Duration::from_secs(5))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_lines_split_across_frames() {
        let items = decode(&["{\"respo", "nse\":\"He\"}\n{\"response\":", "\"llo\"}\n"]).await;
        assert_eq!(
            items,
            vec![Ok(BackendChunk::text("He")), Ok(BackendChunk::text("llo"))]
        );
    }

    #[tokio::test]
    async fn test_blank_lines_and_trailing_line() {
        let items = decode(&["\n{\"response\":\"a\"}\r\n\n", "{\"response\":\"\",\"done\":true}"]).await;
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1],
            Ok(BackendChunk {
                response: Some(String::new()),
                done: true
            })
        );
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_abort() {
        let items = decode(&["{\"response\":\"a\"}\nnot json\n{\"response\":\"b\"}\n"]).await;
        assert_eq!(
            items,
            vec![
                Ok(BackendChunk::text("a")),
                Err(BackendError::MalformedLine),
                Ok(BackendChunk::text("b")),
            ]
        );
    }

    #[tokio::test]
    async fn test_error_field_becomes_error() {
        let items = decode(&["{\"error\":\"model 'nope' not found\"}\n"]).await;
        assert_eq!(
            items,
            vec![Err(BackendError::Backend("model 'nope' not found".into()))]
        );
    }

    #[tokio::test]
    async fn test_read_failure_ends_stream() {
        let body = stream::iter(vec![
            Ok(b"{\"response\":\"a\"}\n".as_slice()),
            Err("connection reset".to_string()),
            Ok(b"{\"response\":\"b\"}\n".as_slice()),
        ]);
        let items: Vec<_> = ndjson_chunks(body, Duration::from_secs(5)).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1],
            Err(BackendError::Transport("connection reset".into()))
        );
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let body = stream::pending::<Result<&'static [u8], String>>();
        let items: Vec<_> = ndjson_chunks(body, Duration::from_millis(50)).collect().await;
        assert!(matches!(items.as_slice(), [Err(BackendError::Transport(_))]));
    }

    #[test]
    fn test_generate_url() {
        let config = BackendConfig {
            base_url: "http://localhost:11434/".to_string(),
            ..BackendConfig::default()
        };
        let client = OllamaClient::new(&config).unwrap();
        assert_eq!(client.generate_url(), "http://localhost:11434/api/generate");
    }

    #[test]
    fn test_request_wire_shape() {
        let req = BackendRequest {
            model: "llama3".into(),
            prompt: "User: Hi\n\nAssistant:".into(),
            stream: true,
            temperature: 0.5,
            max_tokens: 64,
            top_p: 0.9,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["model"], "llama3");
        assert_eq!(v["stream"], true);
        assert_eq!(v["max_tokens"], 64);
    }
}
