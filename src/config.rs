//! Runtime configuration for ollama-gateway.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section falls back to its defaults when omitted, so an empty `{}`
//! file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::{KeySeed, ModelDescriptor};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "ollama-gateway", about = "OpenAI-compatible gateway for an Ollama backend")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides `server.listen`).
    #[arg(long)]
    pub listen: Option<String>,

    /// SQLite URL for the credential store (overrides `auth.database_url`).
    #[arg(long)]
    pub database_url: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Generation backend connection and prompting.
    pub backend: BackendConfig,

    /// Defaults applied to fields a request leaves out.
    pub defaults: GenerationDefaults,

    /// Token counting.
    pub tokenizer: TokenizerConfig,

    /// Credential store and key issuance.
    pub auth: AuthConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:5000").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
        }
    }
}

/// Backend endpoint and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the Ollama server; `/api/generate` is appended.
    pub base_url: String,

    /// Attempts for a blocking generation whose reply lacks a `response` field.
    pub max_retries: u32,

    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Total budget for one blocking generate call, in seconds.
    pub request_timeout_secs: u64,

    /// Maximum wait between two streamed chunks, in seconds.
    pub stream_idle_timeout_secs: u64,

    /// Preamble placed before every conversation sent to the backend.
    pub system_prompt: String,

    /// Instruction prepended to Phase-1 output in strict-JSON mode.
    pub json_formatting_prompt: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            max_retries: 3,
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
            stream_idle_timeout_secs: 120,
            system_prompt: "You are an AI assistant designed to provide helpful responses. \
                Your primary function is to assist users while maintaining a helpful and informative output."
                .to_string(),
            json_formatting_prompt: "Format the following input into a valid JSON object. \
                Return ONLY the JSON object, without any additional text, explanations, or code blocks. \
                Here's the input to format into a JSON object:\n\n"
                .to_string(),
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

/// Values used when a chat-completion request omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,

    /// System message injected when the caller sends none.
    pub system_message: String,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            model: "llama3".to_string(),
            temperature: 1.0,
            max_tokens: 2048,
            top_p: 1.0,
            system_message: "You are a helpful AI assistant.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// BPE encoding name (cl100k_base, o200k_base, p50k_base, r50k_base).
    pub encoding: String,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            encoding: "cl100k_base".to_string(),
        }
    }
}

/// Credential store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// SQLite URL (e.g. "sqlite://gateway.db"). `None` keeps credentials in memory.
    pub database_url: Option<String>,

    /// Bearer token required by `POST /v1/api_keys`. `None` leaves issuance open.
    pub admin_token: Option<String>,

    /// Models registered at startup.
    pub models: Vec<ModelDescriptor>,

    /// Keys registered at startup, with their explicit model grants.
    pub keys: Vec<KeySeed>,
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides on top of the file configuration.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(url) = &cli.database_url {
            self.auth.database_url = Some(url.clone());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "backend.max_retries must be at least 1".to_string(),
            ));
        }
        let timeouts = [
            ("backend.connect_timeout_secs", self.backend.connect_timeout_secs),
            ("backend.request_timeout_secs", self.backend.request_timeout_secs),
            ("backend.stream_idle_timeout_secs", self.backend.stream_idle_timeout_secs),
        ];
        for (name, secs) in timeouts {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}
