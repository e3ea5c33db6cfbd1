//! ollama-gateway: OpenAI-compatible chat completions on top of Ollama.
//!
//! Translates chat-completion requests into calls against an Ollama
//! `/api/generate` endpoint and re-frames the replies as OpenAI
//! `chat.completion` objects or `chat.completion.chunk` SSE events.
//! API keys gate which models a caller may use, and every response carries
//! token usage, summed across both passes in strict-JSON mode.

pub mod auth;
pub mod config;
pub mod inference;
pub mod metrics;
pub mod server;
