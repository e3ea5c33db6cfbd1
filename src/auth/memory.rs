//! In-memory implementation of [`AuthService`].

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use super::{generate_api_key, AuthError, AuthService, KeySeed, ModelDescriptor};

#[derive(Debug, Default)]
struct Registry {
    /// key → active flag
    keys: HashMap<String, bool>,
    models: Vec<ModelDescriptor>,
    grants: HashMap<String, HashSet<String>>,
}

/// Process-local credential store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryAuthStore {
    registry: RwLock<Registry>,
}

impl InMemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_model(&self, model: ModelDescriptor) {
        let mut registry = self.registry.write().await;
        match registry.models.iter_mut().find(|m| m.id == model.id) {
            Some(existing) => *existing = model,
            None => registry.models.push(model),
        }
    }

    pub async fn add_key(&self, key: impl Into<String>, active: bool) {
        self.registry.write().await.keys.insert(key.into(), active);
    }

    pub async fn grant(&self, key: &str, model_id: &str) -> Result<(), AuthError> {
        let mut registry = self.registry.write().await;
        if !registry.models.iter().any(|m| m.id == model_id) {
            return Err(AuthError::UnknownModel(model_id.to_string()));
        }
        registry
            .grants
            .entry(key.to_string())
            .or_default()
            .insert(model_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl AuthService for InMemoryAuthStore {
    async fn validate(&self, key: &str) -> Result<bool, AuthError> {
        Ok(self
            .registry
            .read()
            .await
            .keys
            .get(key)
            .copied()
            .unwrap_or(false))
    }

    async fn allowed_models(&self, key: Option<&str>) -> Result<Vec<ModelDescriptor>, AuthError> {
        let registry = self.registry.read().await;
        let granted = key.and_then(|k| registry.grants.get(k));
        let mut models: Vec<ModelDescriptor> = registry
            .models
            .iter()
            .filter(|m| m.is_public || granted.is_some_and(|g| g.contains(&m.id)))
            .cloned()
            .collect();
        // Listed by id, matching the SQLite store.
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }

    async fn issue_key(&self) -> Result<String, AuthError> {
        let key = generate_api_key();
        self.add_key(key.clone(), true).await;
        Ok(key)
    }

    async fn seed(&self, models: &[ModelDescriptor], keys: &[KeySeed]) -> Result<(), AuthError> {
        for model in models {
            self.add_model(model.clone()).await;
        }
        for seed in keys {
            self.add_key(seed.key.clone(), seed.active).await;
            for model_id in &seed.models {
                self.grant(&seed.key, model_id).await?;
            }
        }
        info!(models = models.len(), keys = keys.len(), "Seeded in-memory credential store");
        Ok(())
    }
}
