//! API-key authorization.
//!
//! [`AuthService`] is the seam between the gateway and credential storage.
//! The gateway only asks two questions per request (is this key valid, which
//! models may it use) plus key issuance. Two implementations ship:
//! - [`memory::InMemoryAuthStore`]: process-local, seeded from config
//! - [`sqlite::SqliteAuthStore`]: persistent, backed by sqlx
//!
//! A model is available to a key when it is public or explicitly granted to
//! that key. Without a key, only public models are listed.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("invalid stored value: {0}")]
    Corrupt(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),
}

/// A model as listed by `GET /v1/models`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default = "default_owner")]
    pub owned_by: String,
    #[serde(default = "default_permission")]
    pub permission: Value,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub strengths: String,
    #[serde(default)]
    pub price_prompt: f64,
    #[serde(default)]
    pub price_completion: f64,
    /// Available to every caller, keyed or not.
    #[serde(default)]
    pub is_public: bool,
}

fn default_owner() -> String {
    "local".to_string()
}

fn default_permission() -> Value {
    Value::Array(Vec::new())
}

impl ModelDescriptor {
    /// A minimal descriptor, mostly for seeding and tests.
    pub fn new(id: impl Into<String>, is_public: bool) -> Self {
        let id = id.into();
        Self {
            root: Some(id.clone()),
            id,
            created: 0,
            owned_by: default_owner(),
            permission: default_permission(),
            parent: None,
            description: String::new(),
            strengths: String::new(),
            price_prompt: 0.0,
            price_completion: 0.0,
            is_public,
        }
    }
}

/// A key registered at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySeed {
    pub key: String,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Explicitly granted (non-public) model IDs.
    #[serde(default)]
    pub models: Vec<String>,
}

fn default_active() -> bool {
    true
}

/// Credential validation and model-access lookup.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// True when the key exists and is active.
    async fn validate(&self, key: &str) -> Result<bool, AuthError>;

    /// Public models plus those granted to `key`, ordered by id.
    async fn allowed_models(&self, key: Option<&str>) -> Result<Vec<ModelDescriptor>, AuthError>;

    /// Create and persist a new active key.
    async fn issue_key(&self) -> Result<String, AuthError>;

    /// Register models and keys from configuration.
    async fn seed(&self, models: &[ModelDescriptor], keys: &[KeySeed]) -> Result<(), AuthError>;
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_url_safe_and_unique() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_eq!(a.len(), 43);
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_descriptor_defaults_from_json() {
        let m: ModelDescriptor = serde_json::from_str(r#"{"id": "mistral"}"#).unwrap();
        assert_eq!(m.owned_by, "local");
        assert_eq!(m.permission, serde_json::json!([]));
        assert!(!m.is_public);
    }
}
