//! OpenAI envelopes for completed and streamed generations.
//!
//! Every envelope gets a fresh random `chatcmpl-` identifier. Completed
//! envelopes always report `finish_reason: "stop"`, chunks always `null`:
//! the backend does not distinguish natural completion from truncation.

use serde::Serialize;
use serde_json::json;

use crate::inference::engine::{PartialResult, Usage};

/// Chat completion response (non-streaming).
#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: AssistantMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

/// Streaming chat completion chunk.
#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct ChunkDelta {
    pub content: String,
}

/// `chatcmpl-` followed by 8 random hex digits.
pub fn completion_id() -> String {
    format!("chatcmpl-{:08x}", rand::random::<u32>())
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn format_completion(content: String, model: &str, usage: Usage) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion",
        created: unix_now(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant",
                content,
            },
            finish_reason: "stop",
        }],
        usage,
    }
}

pub fn format_chunk(partial: &PartialResult, model: &str) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: completion_id(),
        object: "chat.completion.chunk",
        created: unix_now(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                content: chunk_content(partial),
            },
            finish_reason: None,
        }],
        usage: partial.usage(),
    }
}

/// Text placed in `delta.content` for one partial result.
pub fn chunk_content(partial: &PartialResult) -> String {
    match partial {
        PartialResult::Delta { text, .. } => text.clone(),
        PartialResult::Error { message, .. } => message.clone(),
        PartialResult::Json { value, .. } => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        PartialResult::Status {
            status, message, ..
        } => json!({
            "success": false,
            "status": status,
            "response": message,
        })
        .to_string(),
    }
}

/// Pretty-print `text` when it parses as JSON, otherwise `None`.
pub fn pretty_json(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    serde_json::to_string_pretty(&value).ok()
}
