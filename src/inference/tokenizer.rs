//! Token counting for usage accounting.
//!
//! Counts are an approximation of what the backend model sees: the backend
//! runs its own tokenizer, the gateway reports OpenAI-style BPE counts.

use thiserror::Error;
use tiktoken_rs::CoreBPE;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("unknown tokenizer encoding: {0}")]
    UnknownEncoding(String),

    #[error("failed to load encoding {name}: {reason}")]
    Load { name: String, reason: String },
}

/// Text → token count.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Byte-pair-encoding tokenizer backed by tiktoken's vocabularies.
pub struct BpeTokenizer {
    name: String,
    bpe: CoreBPE,
}

impl BpeTokenizer {
    /// Load a tokenizer by encoding name.
    pub fn for_encoding(name: &str) -> Result<Self, TokenizerError> {
        let loaded = match name {
            "cl100k_base" => tiktoken_rs::cl100k_base(),
            "o200k_base" => tiktoken_rs::o200k_base(),
            "p50k_base" => tiktoken_rs::p50k_base(),
            "r50k_base" => tiktoken_rs::r50k_base(),
            other => return Err(TokenizerError::UnknownEncoding(other.to_string())),
        };
        let bpe = loaded.map_err(|e| TokenizerError::Load {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name: name.to_string(),
            bpe,
        })
    }

    pub fn cl100k() -> Result<Self, TokenizerError> {
        Self::for_encoding("cl100k_base")
    }

    pub fn encoding(&self) -> &str {
        &self.name
    }
}

impl TokenCounter for BpeTokenizer {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        // Special-token markers are counted as plain text.
        self.bpe.encode_ordinary(text).len()
    }
}
