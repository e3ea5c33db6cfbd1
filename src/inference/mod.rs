//! Request translation pipeline.
//!
//! - [`tokenizer`]: BPE token counting for usage accounting
//! - [`prompt`]: Message sanitization and prompt rendering
//! - [`backend`]: HTTP client for the Ollama generate endpoint
//! - [`engine`]: Generation orchestrator (free-form and strict-JSON modes)

pub mod backend;
pub mod engine;
pub mod prompt;
pub mod tokenizer;
