//! Generation orchestrator: drives backend calls and keeps token accounting.
//!
//! The engine is the top-level component that:
//! 1. Builds the backend prompt from the request's messages
//! 2. Calls the backend once (free-form) or twice (strict-JSON)
//! 3. Retries blocking calls whose reply lacks a `response` field
//! 4. Accumulates usage counters, summing both passes in strict-JSON mode
//! 5. Returns either one completed result or partial results via a channel

use std::ops::Add;
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::inference::backend::{Backend, BackendChunk, BackendRequest, BackendResult, ChunkStream};
use crate::inference::prompt::{Message, PromptBuilder, PromptInput};
use crate::inference::tokenizer::TokenCounter;

/// Text returned when every blocking attempt came back without a response.
pub const RETRY_FALLBACK_TEXT: &str = "Failed to generate response after multiple attempts";

/// Status text when a strict-JSON stream ends without valid JSON.
pub const JSON_FAILURE_TEXT: &str = "Failed to create valid JSON from LLM response";

const STREAM_BUFFER: usize = 32;

/// Token accounting. `total_tokens == prompt_tokens + completion_tokens` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn prompt_only(prompt_tokens: usize) -> Self {
        Self::new(prompt_tokens, 0)
    }

    pub fn add_completion(&mut self, tokens: usize) {
        *self = Self::new(self.prompt_tokens, self.completion_tokens + tokens);
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    pub fn completion_tokens(&self) -> usize {
        self.completion_tokens
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage::new(
            self.prompt_tokens + rhs.prompt_tokens,
            self.completion_tokens + rhs.completion_tokens,
        )
    }
}

/// A generation request, already resolved against defaults.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Unique request ID, used for logging.
    pub request_id: String,

    pub messages: Vec<Message>,
    pub model: String,
    pub stream: bool,

    /// Strict-JSON output: run a second formatting pass.
    pub json_mode: bool,

    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Generated,
    /// The backend call failed; the text is the error message.
    BackendFailed,
    /// Every attempt lacked a response; the text is [`RETRY_FALLBACK_TEXT`].
    RetriesExhausted,
}

/// Result of a blocking generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
    pub outcome: CompletionOutcome,
}

impl Completion {
    pub fn is_error(&self) -> bool {
        self.outcome != CompletionOutcome::Generated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonStatus {
    Streaming,
    Error,
}

/// One element of a streamed generation. Usage is cumulative.
#[derive(Debug, Clone, PartialEq)]
pub enum PartialResult {
    /// Free-form text increment.
    Delta { text: String, usage: Usage },
    /// Strict-JSON success; always the last element.
    Json { value: Value, usage: Usage },
    /// Strict-JSON progress or failure.
    Status {
        status: JsonStatus,
        message: String,
        usage: Usage,
    },
    /// Backend failure; always the last element.
    Error { message: String, usage: Usage },
}

impl PartialResult {
    pub fn usage(&self) -> Usage {
        match self {
            PartialResult::Delta { usage, .. }
            | PartialResult::Json { usage, .. }
            | PartialResult::Status { usage, .. }
            | PartialResult::Error { usage, .. } => *usage,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PartialResult::Error { .. }
                | PartialResult::Status {
                    status: JsonStatus::Error,
                    ..
                }
        )
    }
}

pub type PartialStream = ReceiverStream<PartialResult>;

pub enum Generation {
    Complete(Completion),
    Stream(PartialStream),
}

/// Sampling parameters shared by every backend call of one request.
#[derive(Debug, Clone)]
struct Sampling {
    model: String,
    temperature: f64,
    max_tokens: u32,
    top_p: f64,
}

impl Sampling {
    fn from_request(request: &GenerationRequest) -> Self {
        Self {
            model: request.model.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
        }
    }

    fn backend_request(&self, prompt: &str, stream: bool) -> BackendRequest {
        BackendRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
        }
    }
}

/// The generation engine. Cheap to clone; shares the backend and tokenizer.
#[derive(Clone)]
pub struct GenerationEngine {
    backend: Arc<dyn Backend>,
    tokenizer: Arc<dyn TokenCounter>,
    prompts: Arc<PromptBuilder>,
    json_instruction: Arc<str>,
    max_retries: u32,
}

impl GenerationEngine {
    pub fn new(
        backend: Arc<dyn Backend>,
        tokenizer: Arc<dyn TokenCounter>,
        config: &BackendConfig,
    ) -> Self {
        Self {
            backend,
            tokenizer,
            prompts: Arc::new(PromptBuilder::new(config.system_prompt.clone())),
            json_instruction: Arc::from(config.json_formatting_prompt.as_str()),
            max_retries: config.max_retries.max(1),
        }
    }

    /// Count tokens with the engine's tokenizer.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }

    /// The framed text sent to the backend for these messages.
    pub fn backend_prompt(&self, messages: &[Message]) -> String {
        self.prompts
            .frame(&self.prompts.build(PromptInput::Messages(messages)))
    }

    /// Dispatch on the request's stream flag.
    pub async fn generate(&self, request: GenerationRequest) -> Generation {
        if request.stream {
            Generation::Stream(self.stream(request))
        } else {
            Generation::Complete(self.complete(&request).await)
        }
    }

    /// Run a generation to completion.
    pub async fn complete(&self, request: &GenerationRequest) -> Completion {
        let sampling = Sampling::from_request(request);
        let prompt = self.backend_prompt(&request.messages);

        info!(
            request_id = request.request_id,
            model = request.model,
            json_mode = request.json_mode,
            "Starting blocking generation"
        );

        let first = self.complete_prompt(&prompt, &sampling).await;
        if !request.json_mode || first.is_error() {
            return first;
        }

        let json_prompt = self.json_prompt(&first.text);
        let second = self.complete_prompt(&json_prompt, &sampling).await;
        Completion {
            text: second.text,
            usage: first.usage + second.usage,
            outcome: second.outcome,
        }
    }

    /// Start a streamed generation. Partial results arrive on the returned
    /// stream; dropping it stops the generation and closes the backend call.
    pub fn stream(&self, request: GenerationRequest) -> PartialStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let engine = self.clone();

        tokio::spawn(async move {
            info!(
                request_id = request.request_id,
                model = request.model,
                json_mode = request.json_mode,
                "Starting streamed generation"
            );

            let sampling = Sampling::from_request(&request);
            let prompt = engine.backend_prompt(&request.messages);

            let finished = if request.json_mode {
                let first = engine.complete_prompt(&prompt, &sampling).await;
                if first.is_error() {
                    let _ = tx
                        .send(PartialResult::Error {
                            message: first.text,
                            usage: first.usage,
                        })
                        .await;
                    true
                } else {
                    let json_prompt = engine.json_prompt(&first.text);
                    engine
                        .stream_json(&json_prompt, first.usage, &sampling, &tx)
                        .await
                }
            } else {
                engine.stream_free_form(&prompt, &sampling, &tx).await
            };

            if finished {
                info!(request_id = request.request_id, "Streamed generation complete");
            } else {
                debug!(request_id = request.request_id, "Receiver dropped, generation stopped");
            }
        });

        ReceiverStream::new(rx)
    }

    fn json_prompt(&self, content: &str) -> String {
        self.prompts
            .frame(&format!("{}{}", self.json_instruction, content))
    }

    /// Blocking call with the retry policy: an error is returned as-is, a
    /// reply without `response` is retried up to `max_retries` attempts.
    async fn complete_prompt(&self, prompt: &str, sampling: &Sampling) -> Completion {
        let usage = Usage::prompt_only(self.count_tokens(prompt));

        for attempt in 1..=self.max_retries {
            match self
                .backend
                .generate(sampling.backend_request(prompt, false))
                .await
            {
                Ok(BackendChunk {
                    response: Some(text),
                    ..
                }) => {
                    let mut usage = usage;
                    usage.add_completion(self.count_tokens(&text));
                    return Completion {
                        text,
                        usage,
                        outcome: CompletionOutcome::Generated,
                    };
                }
                Ok(_) => {
                    warn!(attempt, max = self.max_retries, "Backend reply missing response field");
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Backend call failed");
                    return Completion {
                        text: e.to_string(),
                        usage,
                        outcome: CompletionOutcome::BackendFailed,
                    };
                }
            }
        }

        Completion {
            text: RETRY_FALLBACK_TEXT.to_string(),
            usage,
            outcome: CompletionOutcome::RetriesExhausted,
        }
    }

    /// Relay backend chunks as deltas. Returns false if the receiver went away.
    async fn stream_free_form(
        &self,
        prompt: &str,
        sampling: &Sampling,
        tx: &mpsc::Sender<PartialResult>,
    ) -> bool {
        let mut usage = Usage::prompt_only(self.count_tokens(prompt));
        let mut chunks = self
            .backend
            .generate_stream(sampling.backend_request(prompt, true))
            .await;

        while let Some(item) = next_or_closed(&mut chunks, tx).await {
            let partial = match item {
                Ok(chunk) => {
                    let text = chunk.response.unwrap_or_default();
                    if text.is_empty() {
                        continue;
                    }
                    usage.add_completion(self.count_tokens(&text));
                    PartialResult::Delta { text, usage }
                }
                Err(e) => {
                    warn!(error = %e, "Backend stream failed");
                    return tx
                        .send(PartialResult::Error {
                            message: e.to_string(),
                            usage,
                        })
                        .await
                        .is_ok();
                }
            };

            if tx.send(partial).await.is_err() {
                return false;
            }
        }
        !tx.is_closed()
    }

    /// Stream the formatting pass, parsing the accumulated text after every
    /// chunk. Stops at the first parseable buffer.
    async fn stream_json(
        &self,
        prompt: &str,
        first_pass: Usage,
        sampling: &Sampling,
        tx: &mpsc::Sender<PartialResult>,
    ) -> bool {
        let mut usage = Usage::prompt_only(self.count_tokens(prompt));
        let mut buffer = String::new();
        let mut chunks = self
            .backend
            .generate_stream(sampling.backend_request(prompt, true))
            .await;

        while let Some(item) = next_or_closed(&mut chunks, tx).await {
            let text = match item {
                Ok(chunk) => chunk.response.unwrap_or_default(),
                Err(e) => {
                    warn!(error = %e, "Backend stream failed during JSON formatting");
                    return tx
                        .send(PartialResult::Status {
                            status: JsonStatus::Error,
                            message: e.to_string(),
                            usage: first_pass + usage,
                        })
                        .await
                        .is_ok();
                }
            };
            if text.is_empty() {
                continue;
            }

            buffer.push_str(&text);
            usage.add_completion(self.count_tokens(&text));

            let partial = match serde_json::from_str::<Value>(&buffer) {
                Ok(value) => {
                    // Dropping `chunks` on return closes the backend stream.
                    return tx
                        .send(PartialResult::Json {
                            value,
                            usage: first_pass + usage,
                        })
                        .await
                        .is_ok();
                }
                Err(_) => PartialResult::Status {
                    status: JsonStatus::Streaming,
                    message: text,
                    usage: first_pass + usage,
                },
            };

            if tx.send(partial).await.is_err() {
                return false;
            }
        }

        if tx.is_closed() {
            return false;
        }

        warn!(buffered = buffer.len(), "Backend stream ended without valid JSON");
        tx.send(PartialResult::Status {
            status: JsonStatus::Error,
            message: JSON_FAILURE_TEXT.to_string(),
            usage: first_pass + usage,
        })
        .await
        .is_ok()
    }
}

/// Next backend item, or `None` as soon as the receiver is gone, even while
/// the backend is stalled.
async fn next_or_closed(
    chunks: &mut ChunkStream,
    tx: &mpsc::Sender<PartialResult>,
) -> Option<BackendResult> {
    tokio::select! {
        biased;
        _ = tx.closed() => None,
        item = chunks.next() => item,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_invariant() {
        let mut usage = Usage::prompt_only(12);
        assert_eq!(usage.total_tokens(), 12);
        usage.add_completion(5);
        usage.add_completion(3);
        assert_eq!(usage.completion_tokens(), 8);
        assert_eq!(usage.total_tokens(), 20);
    }

    #[test]
    fn test_usage_sum_is_fieldwise() {
        let a = Usage::new(10, 4);
        let b = Usage::new(7, 9);
        let sum = a + b;
        assert_eq!(sum, Usage::new(17, 13));
        assert_eq!(sum.total_tokens(), sum.prompt_tokens() + sum.completion_tokens());
    }

    #[test]
    fn test_usage_serializes_openai_fields() {
        let v = serde_json::to_value(Usage::new(3, 2)).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5})
        );
    }

    #[test]
    fn test_failure_classification() {
        let usage = Usage::default();
        assert!(PartialResult::Error { message: "x".into(), usage }.is_failure());
        assert!(PartialResult::Status {
            status: JsonStatus::Error,
            message: "x".into(),
            usage
        }
        .is_failure());
        assert!(!PartialResult::Status {
            status: JsonStatus::Streaming,
            message: "x".into(),
            usage
        }
        .is_failure());
        assert!(!PartialResult::Delta { text: "x".into(), usage }.is_failure());
    }
}
