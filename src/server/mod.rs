//! HTTP server providing an OpenAI-compatible API.
//!
//! - [`openai_api`]: Request/response types and route handlers
//! - [`format`]: OpenAI completion and chunk envelopes
//! - [`streaming`]: SSE streaming for incremental responses
//! - [`error`]: Error-to-response mapping

pub mod error;
pub mod format;
pub mod openai_api;
pub mod streaming;
